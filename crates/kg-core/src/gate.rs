//! Session Gatekeeper.
//!
//! Answers "may key material be used right now?". A hit needs both a fresh
//! session record and a live endpoint serving at least one key. A miss
//! always purges first (force-stop of the agent), then either fails
//! (non-interactive) or waits a bounded time for the user to unlock.

use crate::agent::{AgentControl, CallerMode, Located};
use crate::logging::{event_names, LogContext, Stage};
use crate::poll::{poll_until, CancelToken, PollOutcome, PollSpec};
use crate::prompt::{Notice, UnlockPrompt};
use crate::session::{LockMarker, SessionStore};
use kg_common::{Error, Result};
use std::time::{Duration, Instant};
use tracing::field::display;
use tracing::warn;

/// Unlock wait probe interval.
pub const UNLOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshOutcome {
    /// Session was fresh and keys were live; nothing prompted.
    FastPath { remaining: Duration },
    /// The user unlocked during the wait; the session was refreshed.
    Unlocked { waited: Duration },
}

/// The seam the Command Interceptor drives.
pub trait FreshnessGate {
    fn ensure_fresh(&mut self, interactive: bool) -> Result<FreshOutcome>;
}

pub struct Gatekeeper {
    store: SessionStore,
    agent: Box<dyn AgentControl>,
    prompt: Box<dyn UnlockPrompt>,
    unlock_wait: PollSpec,
    cancel: CancelToken,
    ctx: LogContext,
}

impl Gatekeeper {
    pub fn new(
        store: SessionStore,
        agent: Box<dyn AgentControl>,
        prompt: Box<dyn UnlockPrompt>,
        unlock_timeout: Duration,
        ctx: LogContext,
    ) -> Self {
        Self {
            store,
            agent,
            prompt,
            unlock_wait: PollSpec::new(UNLOCK_POLL_INTERVAL, unlock_timeout),
            cancel: CancelToken::with_signals(),
            ctx,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.unlock_wait.interval = interval;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn is_fresh(&self) -> bool {
        self.store.is_fresh()
    }

    /// Fast path, or purge then (optionally) wait for an unlock.
    pub fn ensure_fresh(&mut self, interactive: bool) -> Result<FreshOutcome> {
        let cause = match self.store.remaining() {
            Some(remaining) => match self.agent.ensure_live(CallerMode::FailFast) {
                Ok(found) if found.key_count > 0 => {
                    crate::log_event!(
                        self.ctx,
                        DEBUG,
                        event_names::GATE_FAST_PATH,
                        Stage::Gate,
                        "session fresh",
                        remaining_secs = remaining.as_secs(),
                        keys = found.key_count as u64
                    );
                    return Ok(FreshOutcome::FastPath { remaining });
                }
                Ok(found) => Error::VaultLocked(found.endpoint.path.display().to_string()),
                Err(e) => e,
            },
            None => Error::NoSession("session expired".into()),
        };
        let reason = match &cause {
            Error::NoSession(reason) => reason.clone(),
            other => other.to_string(),
        };

        crate::log_event!(
            self.ctx,
            INFO,
            event_names::GATE_SESSION_EXPIRED,
            Stage::Gate,
            "session not fresh, purging agent",
            reason = display(&reason),
            cause = cause.code_name(),
            interactive = interactive
        );
        if let Err(e) = self.agent.force_stop() {
            warn!(error = %e, "purge failed");
        }
        self.prompt.notify(&Notice::SessionExpired {
            reason: reason.clone(),
        });

        if !interactive {
            return Err(Error::NoSession(reason));
        }
        self.wait_for_unlock()
    }

    fn wait_for_unlock(&mut self) -> Result<FreshOutcome> {
        let baseline = self.store.lock_marker();
        self.prompt.bring_to_front();
        self.prompt.notify(&Notice::AwaitingUnlock {
            timeout: self.unlock_wait.max_wait,
        });

        let cancel = self.cancel.clone();
        let store = &self.store;
        let agent = &mut self.agent;
        let max_wait = self.unlock_wait.max_wait;
        let started = Instant::now();
        let outcome = poll_until(self.unlock_wait, &cancel, || {
            if lock_changed(store, &baseline) {
                return Some(Err(()));
            }
            let budget = max_wait.saturating_sub(started.elapsed());
            match agent.ensure_live(CallerMode::Within(budget)) {
                Ok(found) if found.key_count > 0 => Some(Ok(found)),
                _ => None,
            }
        });

        match outcome {
            PollOutcome::Ready {
                value: Ok(found),
                waited,
            } => self.accept_unlock(found, waited, &baseline),
            PollOutcome::Ready { value: Err(()), .. } => Err(self.locked_during_wait()),
            PollOutcome::TimedOut { waited } => {
                crate::log_event!(
                    self.ctx,
                    WARN,
                    event_names::GATE_TIMED_OUT,
                    Stage::Gate,
                    "no unlock within timeout",
                    waited_ms = waited.as_millis() as u64
                );
                Err(Error::UnlockTimeout {
                    seconds: self.unlock_wait.max_wait.as_secs(),
                })
            }
            PollOutcome::Cancelled => Err(Error::Interrupted),
        }
    }

    fn accept_unlock(
        &mut self,
        found: Located,
        waited: Duration,
        baseline: &Option<LockMarker>,
    ) -> Result<FreshOutcome> {
        if let Err(e) = self.store.touch() {
            // Keys are live; the next invocation simply re-verifies.
            warn!(error = %e, "could not persist session");
        }
        // A lock that landed between the probe and the touch must win.
        if lock_changed(&self.store, baseline) {
            let _ = self.store.invalidate();
            return Err(self.locked_during_wait());
        }
        crate::log_event!(
            self.ctx,
            INFO,
            event_names::GATE_UNLOCKED,
            Stage::Gate,
            "unlock observed, session refreshed",
            waited_ms = waited.as_millis() as u64,
            keys = found.key_count as u64
        );
        self.prompt.notify(&Notice::Unlocked);
        Ok(FreshOutcome::Unlocked { waited })
    }

    fn locked_during_wait(&mut self) -> Error {
        crate::log_event!(
            self.ctx,
            INFO,
            event_names::GATE_LOCKED,
            Stage::Gate,
            "explicit lock observed during unlock wait"
        );
        if let Err(e) = self.agent.force_stop() {
            warn!(error = %e, "purge after lock failed");
        }
        Error::NoSession("locked while waiting for unlock".into())
    }

    /// Explicit lock: record the lock, then purge. Both must succeed.
    pub fn lock(&mut self) -> Result<LockMarker> {
        let marker = self.store.invalidate()?;
        self.agent.force_stop()?;
        crate::log_event!(
            self.ctx,
            INFO,
            event_names::GATE_LOCKED,
            Stage::Gate,
            "session invalidated and agent purged",
            marker = display(&marker.id)
        );
        self.prompt.notify(&Notice::Locked);
        Ok(marker)
    }
}

fn lock_changed(store: &SessionStore, baseline: &Option<LockMarker>) -> bool {
    store.lock_marker().as_ref() != baseline.as_ref()
}

impl FreshnessGate for Gatekeeper {
    fn ensure_fresh(&mut self, interactive: bool) -> Result<FreshOutcome> {
        Gatekeeper::ensure_fresh(self, interactive)
    }
}
