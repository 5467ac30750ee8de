//! Agent Supervisor: keep exactly one live key-serving endpoint behind the
//! canonical path.
//!
//! ```text
//! Idle ──locate──▶ Linked(Native) ──provider vanished──▶ Idle
//! Idle ──▶ AwaitingAuth ──▶ Spawned ──▶ Linked(Managed) ──exit──▶ Idle
//! any ──signal──▶ ShuttingDown
//! ```
//!
//! Short-lived invocations call [`AgentSupervisor::ensure_live`] and
//! [`AgentSupervisor::force_stop`]; the daemon calls [`AgentSupervisor::run`].
//! A managed agent spawned by a short-lived invocation outlives it and is
//! found again through the persisted [`ManagedRecord`].
//!
//! A supervisor built [`with_lock_hold`](AgentSupervisor::with_lock_hold)
//! links nothing while an explicit lock is newer than the last verified
//! unlock; only a gatekeeper `touch` releases it.

use super::endpoint::{AgentEndpoint, CanonicalLink, EndpointKind};
use super::locator::{is_socket, Located, SocketLocator};
use super::process::{ManagedProcess, ManagedRecord, SpawnLock, TerminateOutcome};
use crate::fsutil;
use crate::logging::{event_names, LogContext, Stage};
use crate::poll::{
    deadline_after, poll_until, sleep_interruptible, CancelToken, PollOutcome, PollSpec,
};
use crate::session::SessionStore;
use crate::vault::{VaultCli, VaultStatus};
use kg_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::field::display;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    AwaitingAuth,
    Spawned,
    Linked(EndpointKind),
    ShuttingDown,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::AwaitingAuth => write!(f, "awaiting_auth"),
            SupervisorState::Spawned => write!(f, "spawned"),
            SupervisorState::Linked(kind) => write!(f, "linked({kind})"),
            SupervisorState::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// What `ensure_live` does when nothing is reachable and the vault is not
/// ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerMode {
    /// Poll the vault for a bounded time.
    Wait,
    /// Return `EndpointUnreachable` at once.
    FailFast,
    /// Fail fast, and spend at most this long starting an agent: a single
    /// spawn attempt, with the vault query and socket wait cut to fit.
    Within(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// Vault authentication wait in `CallerMode::Wait`.
    pub auth_wait: PollSpec,
    /// Socket appearance after spawning.
    pub socket_wait: PollSpec,
    pub spawn_attempts: u32,
    /// Pause after a managed exit or a failed cycle.
    pub restart_backoff: Duration,
    /// Native endpoint liveness check interval.
    pub native_poll: Duration,
    /// Owned child exit check interval.
    pub managed_poll: Duration,
    /// Adopted pid liveness check interval.
    pub adopted_poll: Duration,
    pub term_grace: Duration,
    pub lock_wait: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            auth_wait: PollSpec::new(Duration::from_secs(2), Duration::from_secs(30)),
            socket_wait: PollSpec::new(Duration::from_secs(1), Duration::from_secs(5)),
            spawn_attempts: 3,
            restart_backoff: Duration::from_secs(2),
            native_poll: Duration::from_secs(3),
            managed_poll: Duration::from_millis(250),
            adopted_poll: Duration::from_secs(1),
            term_grace: super::process::TERM_GRACE,
            lock_wait: Duration::from_secs(15),
        }
    }
}

/// Filesystem locations the supervisor owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorPaths {
    pub runtime_dir: PathBuf,
    pub canonical: PathBuf,
    pub managed_socket: PathBuf,
    pub managed_record: PathBuf,
    pub spawn_lock: PathBuf,
    pub daemon_pid: PathBuf,
}

impl SupervisorPaths {
    /// Standard layout inside `runtime_dir`.
    pub fn in_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        Self {
            canonical: runtime_dir.join("agent.sock"),
            managed_socket: runtime_dir.join("managed.sock"),
            managed_record: runtime_dir.join("managed.json"),
            spawn_lock: runtime_dir.join("supervisor.lock"),
            daemon_pid: runtime_dir.join("daemon.pid"),
            runtime_dir,
        }
    }
}

/// The seam the Session Gatekeeper drives.
pub trait AgentControl {
    /// Make sure the canonical endpoint is live; report what it serves.
    fn ensure_live(&mut self, mode: CallerMode) -> Result<Located>;

    /// Purge: stop any managed agent and drop the canonical reference.
    /// Idempotent.
    fn force_stop(&mut self) -> Result<()>;
}

enum WaitWake {
    Found(Located),
    Authenticated,
    Held,
}

/// Time left before `deadline`; unbounded without one.
fn left(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
}

fn lock_in_effect() -> Error {
    Error::NoSession("explicit lock in effect until the next unlock".into())
}

pub struct AgentSupervisor {
    locator: SocketLocator,
    vault: Box<dyn VaultCli>,
    link: CanonicalLink,
    paths: SupervisorPaths,
    timings: SupervisorTimings,
    state: SupervisorState,
    current: Option<AgentEndpoint>,
    process: Option<ManagedProcess>,
    lock_hold: Option<SessionStore>,
    cancel: CancelToken,
    ctx: LogContext,
}

impl AgentSupervisor {
    pub fn new(
        locator: SocketLocator,
        vault: Box<dyn VaultCli>,
        paths: SupervisorPaths,
        ctx: LogContext,
    ) -> Self {
        Self {
            link: CanonicalLink::new(&paths.canonical),
            locator,
            vault,
            paths,
            timings: SupervisorTimings::default(),
            state: SupervisorState::Idle,
            current: None,
            process: None,
            lock_hold: None,
            cancel: CancelToken::with_signals(),
            ctx,
        }
    }

    pub fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Refuse to link or spawn while `store` reports an explicit lock.
    pub fn with_lock_hold(mut self, store: SessionStore) -> Self {
        self.lock_hold = Some(store);
        self
    }

    fn held(&self) -> bool {
        self.lock_hold.as_ref().is_some_and(SessionStore::is_locked)
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn canonical_path(&self) -> &Path {
        self.link.path()
    }

    pub fn paths(&self) -> &SupervisorPaths {
        &self.paths
    }

    pub fn current(&self) -> Option<&AgentEndpoint> {
        self.current.as_ref()
    }

    /// Pid of the managed agent this supervisor holds, if any.
    pub fn managed_pid(&self) -> Option<u32> {
        self.process.as_ref().map(ManagedProcess::pid)
    }

    /// Re-validate a linked endpoint, or run one full locate/spawn cycle.
    pub fn ensure_live(&mut self, mode: CallerMode) -> Result<Located> {
        if let (SupervisorState::Linked(_), Some(endpoint)) = (self.state, self.current.clone()) {
            match self.link.probe(self.locator.probe_timeout()) {
                Ok(reply) => {
                    return Ok(Located {
                        endpoint,
                        key_count: reply.key_count(),
                    })
                }
                Err(err) => {
                    crate::log_event!(
                        self.ctx,
                        WARN,
                        event_names::SUPERVISOR_ENDPOINT_LOST,
                        Stage::Supervise,
                        "linked endpoint stopped answering",
                        path = display(endpoint.path.display()),
                        error = display(&err)
                    );
                    self.drop_endpoint();
                }
            }
        }
        self.cycle(mode)
    }

    fn cycle(&mut self, mode: CallerMode) -> Result<Located> {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        if self.held() {
            self.state = SupervisorState::AwaitingAuth;
            return Err(lock_in_effect());
        }
        let deadline = match mode {
            CallerMode::Within(budget) => Some(deadline_after(Instant::now(), budget)),
            CallerMode::Wait | CallerMode::FailFast => None,
        };
        if let Some(found) = self.locator.locate() {
            return self.take_found(found);
        }

        match self.await_auth(mode, deadline)? {
            WaitWake::Found(found) => return self.take_found(found),
            WaitWake::Authenticated => {}
            WaitWake::Held => return Err(lock_in_effect()),
        }

        let lock_wait = self.timings.lock_wait.min(left(deadline));
        let lock = SpawnLock::acquire(&self.paths.spawn_lock, lock_wait, &self.cancel)
            .map_err(|e| Error::ProcessSpawnFailure(format!("spawn lock: {e}")))?;
        let Some(_lock) = lock else {
            if self.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            return Err(Error::ProcessSpawnFailure(
                "another invocation holds the spawn lock".into(),
            ));
        };

        // Another invocation may have spawned while we waited for the lock.
        if let Some(found) = self.locator.locate() {
            return self.take_found(found);
        }
        if self.held() {
            return Err(lock_in_effect());
        }
        self.spawn_with_retries(deadline)
    }

    fn take_found(&mut self, found: Located) -> Result<Located> {
        if found.endpoint.kind == EndpointKind::Managed && self.process.is_none() {
            self.adopt_managed(&found.endpoint.path);
        }
        self.link_to(&found)?;
        Ok(found)
    }

    fn adopt_managed(&mut self, socket: &Path) {
        match ManagedRecord::load(&self.paths.managed_record) {
            Ok(Some(record)) if record.socket_path == socket && record.is_alive() => {
                debug!(pid = record.pid, "adopting managed agent");
                self.process = Some(ManagedProcess::adopt(record));
            }
            Ok(_) => debug!("managed socket is live without a matching record"),
            Err(e) => warn!(error = %e, "managed record unreadable"),
        }
    }

    fn await_auth(&mut self, mode: CallerMode, deadline: Option<Instant>) -> Result<WaitWake> {
        let status = self.vault_status(left(deadline));
        if status.map(VaultStatus::can_serve).unwrap_or(false) {
            return Ok(WaitWake::Authenticated);
        }
        self.state = SupervisorState::AwaitingAuth;
        let shown = status.map(|s| s.to_string()).unwrap_or_else(|| "unavailable".into());

        if mode != CallerMode::Wait {
            return Err(Error::EndpointUnreachable(format!(
                "no agent socket found and vault is {shown}"
            )));
        }

        let outcome = poll_until(self.timings.auth_wait, &self.cancel.clone(), || {
            if self.held() {
                return Some(WaitWake::Held);
            }
            if let Some(found) = self.locator.locate() {
                return Some(WaitWake::Found(found));
            }
            self.vault_status(Duration::MAX)
                .filter(|s| s.can_serve())
                .map(|_| WaitWake::Authenticated)
        });
        match outcome {
            PollOutcome::Ready { value, .. } => Ok(value),
            PollOutcome::TimedOut { waited } => Err(Error::EndpointUnreachable(format!(
                "no agent socket found and vault stayed {shown} for {}s",
                waited.as_secs()
            ))),
            PollOutcome::Cancelled => Err(Error::Interrupted),
        }
    }

    fn vault_status(&self, limit: Duration) -> Option<VaultStatus> {
        match self.vault.status(limit) {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(error = %e, "vault status unavailable");
                None
            }
        }
    }

    fn spawn_with_retries(&mut self, deadline: Option<Instant>) -> Result<Located> {
        let attempts = match deadline {
            Some(_) => 1,
            None => self.timings.spawn_attempts.max(1),
        };
        let mut last = String::new();
        for attempt in 1..=attempts {
            if left(deadline).is_zero() {
                self.state = SupervisorState::Idle;
                return Err(Error::EndpointUnreachable(
                    "no time left to start a managed agent".into(),
                ));
            }
            match self.spawn_once(deadline) {
                Ok(found) => return Ok(found),
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "managed agent start failed");
                    last = e.to_string();
                }
            }
            if attempt < attempts
                && !sleep_interruptible(self.timings.restart_backoff * attempt, &self.cancel)
            {
                return Err(Error::Interrupted);
            }
        }
        self.state = SupervisorState::Idle;
        Err(Error::ProcessSpawnFailure(format!(
            "gave up after {attempts} attempts: {last}"
        )))
    }

    fn spawn_once(&mut self, deadline: Option<Instant>) -> Result<Located> {
        let socket = self.paths.managed_socket.clone();
        fsutil::ensure_private_dir(&self.paths.runtime_dir)?;
        fsutil::remove_if_exists(&socket)?;

        let command = self.vault.agent_command(&socket);
        let mut process = ManagedProcess::spawn(command, &socket)
            .map_err(|e| Error::ProcessSpawnFailure(e.to_string()))?;
        self.state = SupervisorState::Spawned;

        let probe_timeout = self.locator.probe_timeout();
        let mut socket_wait = self.timings.socket_wait;
        socket_wait.max_wait = socket_wait.max_wait.min(left(deadline));
        let outcome = poll_until(socket_wait, &self.cancel, || {
            if let Some(exit) = process.try_exit() {
                return Some(Err(exit));
            }
            if !is_socket(&socket) {
                return None;
            }
            let endpoint = AgentEndpoint::new(&socket, EndpointKind::Managed);
            endpoint.probe(probe_timeout).ok().map(|reply| {
                Ok(Located {
                    endpoint: endpoint.mark_live(),
                    key_count: reply.key_count(),
                })
            })
        });

        let failure = match outcome {
            PollOutcome::Ready { value: Ok(found), .. } => {
                if let Err(e) = process.record().save(&self.paths.managed_record) {
                    warn!(error = %e, "could not persist managed record");
                }
                crate::log_event!(
                    self.ctx,
                    INFO,
                    event_names::SUPERVISOR_SPAWNED,
                    Stage::Supervise,
                    "managed agent started",
                    pid = process.pid(),
                    keys = found.key_count as u64
                );
                self.process = Some(process);
                self.link_to(&found)?;
                return Ok(found);
            }
            PollOutcome::Ready { value: Err(exit), .. } => {
                Error::ProcessSpawnFailure(format!("agent exited during startup ({exit})"))
            }
            PollOutcome::TimedOut { waited } => {
                process.terminate(self.timings.term_grace);
                Error::ProcessSpawnFailure(format!(
                    "socket {} did not appear within {}s",
                    socket.display(),
                    waited.as_secs()
                ))
            }
            PollOutcome::Cancelled => {
                process.terminate(self.timings.term_grace);
                Error::Interrupted
            }
        };
        let _ = fsutil::remove_if_exists(&socket);
        self.state = SupervisorState::Idle;
        Err(failure)
    }

    fn link_to(&mut self, found: &Located) -> Result<()> {
        let target = &found.endpoint.path;
        if !self.link.points_at(target) {
            self.link.point_at(target)?;
        }
        let kind = found.endpoint.kind;
        let relinked = self.state != SupervisorState::Linked(kind)
            || self.current.as_ref().map(|c| &c.path) != Some(target);
        self.state = SupervisorState::Linked(kind);
        self.current = Some(found.endpoint.clone());
        if relinked {
            crate::log_event!(
                self.ctx,
                INFO,
                event_names::SUPERVISOR_LINKED,
                Stage::Supervise,
                "canonical endpoint linked",
                kind = display(kind),
                target = display(target.display()),
                keys = found.key_count as u64
            );
        }
        Ok(())
    }

    /// Forget the current endpoint and remove the canonical reference.
    fn drop_endpoint(&mut self) {
        if let Err(e) = self.link.clear() {
            warn!(error = %e, "could not remove canonical link");
        }
        self.current = None;
        self.state = SupervisorState::Idle;
    }

    fn remove_managed_files(&self) -> Result<()> {
        fsutil::remove_if_exists(&self.paths.managed_socket)?;
        ManagedRecord::remove(&self.paths.managed_record)?;
        Ok(())
    }

    /// Stop any managed agent (ours or one found on disk), remove its socket
    /// and record, and drop the canonical reference.
    pub fn force_stop(&mut self) -> Result<()> {
        let process = match self.process.take() {
            Some(p) => Some(p),
            None => match ManagedRecord::load(&self.paths.managed_record) {
                Ok(Some(record)) if record.is_alive() => Some(ManagedProcess::adopt(record)),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "managed record unreadable, removing");
                    None
                }
            },
        };
        let outcome = process.map(|mut p| (p.pid(), p.terminate(self.timings.term_grace)));

        self.remove_managed_files()?;
        self.link.clear()?;
        self.current = None;
        self.state = SupervisorState::Idle;

        match outcome {
            Some((pid, result)) => crate::log_event!(
                self.ctx,
                INFO,
                event_names::SUPERVISOR_FORCE_STOPPED,
                Stage::Supervise,
                "managed agent stopped",
                pid = pid,
                outcome = tracing::field::debug(result)
            ),
            None => crate::log_event!(
                self.ctx,
                DEBUG,
                event_names::SUPERVISOR_FORCE_STOPPED,
                Stage::Supervise,
                "no managed agent to stop"
            ),
        }
        Ok(())
    }

    /// Continuous supervision. Returns only once cancelled; every other
    /// failure is logged and retried after the backoff.
    pub fn run(&mut self) -> Result<()> {
        fsutil::ensure_private_dir(&self.paths.runtime_dir)?;
        std::fs::write(&self.paths.daemon_pid, format!("{}\n", std::process::id()))?;
        crate::log_event!(
            self.ctx,
            INFO,
            event_names::SUPERVISOR_STARTED,
            Stage::Supervise,
            "supervisor loop started",
            canonical = display(self.paths.canonical.display())
        );

        let mut holding = false;
        while !self.cancel.is_cancelled() {
            let result = self.ensure_live(CallerMode::Wait);
            let now_holding = matches!(result, Err(Error::NoSession(_)));
            if now_holding && !holding {
                crate::log_event!(
                    self.ctx,
                    INFO,
                    event_names::SUPERVISOR_LOCK_HELD,
                    Stage::Supervise,
                    "explicit lock in effect, not serving keys until unlocked"
                );
            }
            holding = now_holding;
            match result {
                Ok(_) => self.watch(),
                Err(Error::Interrupted) => break,
                Err(Error::NoSession(_)) => {
                    sleep_interruptible(self.timings.restart_backoff, &self.cancel);
                }
                Err(e @ Error::EndpointUnreachable(_)) => {
                    debug!(error = %e, "no endpoint yet");
                    sleep_interruptible(self.timings.restart_backoff, &self.cancel);
                }
                Err(e) => {
                    warn!(error = %e, code = e.code_name(), "supervision cycle failed");
                    sleep_interruptible(self.timings.restart_backoff, &self.cancel);
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Block until the linked endpoint goes away or we are cancelled.
    fn watch(&mut self) {
        loop {
            let interval = match (self.state, self.process.as_ref()) {
                (SupervisorState::Linked(EndpointKind::Managed), Some(p)) if p.is_owned() => {
                    self.timings.managed_poll
                }
                (SupervisorState::Linked(EndpointKind::Managed), Some(_)) => {
                    self.timings.adopted_poll
                }
                (SupervisorState::Linked(_), _) => self.timings.native_poll,
                _ => return,
            };
            if !sleep_interruptible(interval, &self.cancel) {
                return;
            }

            if self.held() {
                crate::log_event!(
                    self.ctx,
                    INFO,
                    event_names::SUPERVISOR_LOCK_HELD,
                    Stage::Supervise,
                    "explicit lock observed, dropping endpoint"
                );
                if let Some(mut p) = self.process.take() {
                    p.terminate(self.timings.term_grace);
                }
                self.lose_endpoint();
                return;
            }

            if let Some(exit) = self.process.as_mut().and_then(ManagedProcess::try_exit) {
                let pid = self.process.take().map(|p| p.pid());
                crate::log_event!(
                    self.ctx,
                    WARN,
                    event_names::SUPERVISOR_PROCESS_EXITED,
                    Stage::Supervise,
                    "managed agent exited",
                    pid = tracing::field::debug(pid),
                    status = display(exit)
                );
                self.lose_endpoint();
                return;
            }

            let lost = match &self.current {
                Some(endpoint) => {
                    !self.link.points_at(&endpoint.path)
                        || endpoint.probe(self.locator.probe_timeout()).is_err()
                }
                None => true,
            };
            if lost {
                crate::log_event!(
                    self.ctx,
                    WARN,
                    event_names::SUPERVISOR_ENDPOINT_LOST,
                    Stage::Supervise,
                    "endpoint no longer reachable"
                );
                if let Some(mut p) = self.process.take() {
                    p.terminate(self.timings.term_grace);
                }
                self.lose_endpoint();
                return;
            }
        }
    }

    fn lose_endpoint(&mut self) {
        let managed = matches!(self.state, SupervisorState::Linked(EndpointKind::Managed));
        if managed {
            if let Err(e) = self.remove_managed_files() {
                warn!(error = %e, "could not remove managed agent files");
            }
        }
        self.drop_endpoint();
        sleep_interruptible(self.timings.restart_backoff, &self.cancel);
    }

    /// Graceful stop: SIGTERM the managed agent, remove socket, record,
    /// canonical reference and pid file.
    pub fn shutdown(&mut self) {
        self.state = SupervisorState::ShuttingDown;
        let outcome = self
            .process
            .take()
            .map(|mut p| p.terminate(self.timings.term_grace));
        // Files of an agent we never held belong to whoever spawned it.
        if outcome.is_some() {
            if let Err(e) = self.remove_managed_files() {
                warn!(error = %e, "could not remove managed agent files");
            }
        }
        if let Err(e) = self.link.clear() {
            warn!(error = %e, "could not remove canonical link");
        }
        self.current = None;
        if owns_pid_file(&self.paths.daemon_pid) {
            let _ = fsutil::remove_if_exists(&self.paths.daemon_pid);
        }
        crate::log_event!(
            self.ctx,
            INFO,
            event_names::SUPERVISOR_STOPPED,
            Stage::Supervise,
            "supervisor stopped",
            terminated = matches!(outcome, Some(TerminateOutcome::Terminated))
        );
    }
}

fn owns_pid_file(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        == Some(std::process::id())
}

/// Pid recorded in a daemon pid file, if that process is still alive.
pub fn running_daemon(pid_file: &Path) -> Option<u32> {
    let pid = std::fs::read_to_string(pid_file)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()?;
    super::process::pid_alive(pid).then_some(pid)
}

impl AgentControl for AgentSupervisor {
    fn ensure_live(&mut self, mode: CallerMode) -> Result<Located> {
        AgentSupervisor::ensure_live(self, mode)
    }

    fn force_stop(&mut self) -> Result<()> {
        AgentSupervisor::force_stop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeAgent;
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptVault {
        status: VaultStatus,
        script: String,
        status_calls: Arc<AtomicUsize>,
    }

    impl VaultCli for ScriptVault {
        fn status(&self, _limit: Duration) -> Result<VaultStatus> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.status)
        }

        fn agent_command(&self, socket: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &self.script]).env("KG_SOCKET", socket);
            cmd
        }
    }

    fn fast_timings() -> SupervisorTimings {
        SupervisorTimings {
            auth_wait: PollSpec::new(Duration::from_millis(20), Duration::from_millis(100)),
            socket_wait: PollSpec::new(Duration::from_millis(20), Duration::from_millis(300)),
            spawn_attempts: 2,
            restart_backoff: Duration::from_millis(20),
            native_poll: Duration::from_millis(20),
            managed_poll: Duration::from_millis(20),
            adopted_poll: Duration::from_millis(20),
            term_grace: Duration::from_millis(500),
            lock_wait: Duration::from_millis(200),
        }
    }

    fn supervisor(dir: &Path, native: Vec<PathBuf>, vault: ScriptVault) -> AgentSupervisor {
        let paths = SupervisorPaths::in_dir(dir.join("run"));
        let locator = SocketLocator::new(None, native, Some(paths.managed_socket.clone()))
            .with_probe_timeout(Duration::from_millis(100));
        AgentSupervisor::new(locator, Box::new(vault), paths, LogContext::new("run-test", "test"))
            .with_timings(fast_timings())
            .with_cancel(CancelToken::new())
    }

    #[test]
    fn native_endpoint_is_linked_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let native = dir.path().join("native.sock");
        let _agent = FakeAgent::with_keys(&native, 1).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let vault = ScriptVault {
            status: VaultStatus::Unlocked,
            script: "exit 99".into(),
            status_calls: calls.clone(),
        };
        let mut sup = supervisor(dir.path(), vec![native.clone()], vault);

        let found = sup.ensure_live(CallerMode::FailFast).unwrap();
        assert_eq!(found.endpoint.kind, EndpointKind::Native);
        assert_eq!(found.key_count, 1);
        assert_eq!(sup.state(), SupervisorState::Linked(EndpointKind::Native));
        assert_eq!(std::fs::read_link(sup.canonical_path()).unwrap(), native);
        assert_eq!(sup.managed_pid(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "vault must not be consulted");

        // Linked fast path re-probes only.
        assert_eq!(sup.ensure_live(CallerMode::FailFast).unwrap().key_count, 1);
    }

    #[test]
    fn locked_vault_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let vault = ScriptVault {
            status: VaultStatus::Locked,
            script: "exit 99".into(),
            status_calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut sup = supervisor(dir.path(), vec![], vault);
        let err = sup.ensure_live(CallerMode::FailFast).unwrap_err();
        assert!(matches!(err, Error::EndpointUnreachable(_)), "{err}");
        assert_eq!(sup.state(), SupervisorState::AwaitingAuth);
    }

    #[test]
    fn locked_vault_wait_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let vault = ScriptVault {
            status: VaultStatus::Locked,
            script: "exit 99".into(),
            status_calls: calls.clone(),
        };
        let mut sup = supervisor(dir.path(), vec![], vault);
        let start = std::time::Instant::now();
        assert!(sup.ensure_live(CallerMode::Wait).is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn crashing_agent_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let vault = ScriptVault {
            status: VaultStatus::Unlocked,
            script: "exit 7".into(),
            status_calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut sup = supervisor(dir.path(), vec![], vault);
        let err = sup.ensure_live(CallerMode::FailFast).unwrap_err();
        match err {
            Error::ProcessSpawnFailure(msg) => {
                assert!(msg.contains("2 attempts"), "{msg}");
                assert!(msg.contains("exit code 7"), "{msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert!(!sup.canonical_path().exists());
    }

    #[test]
    fn budgeted_call_makes_one_short_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let vault = ScriptVault {
            status: VaultStatus::Unlocked,
            script: "exec sleep 30".into(),
            status_calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut sup = supervisor(dir.path(), vec![], vault);
        let start = std::time::Instant::now();
        let err = sup
            .ensure_live(CallerMode::Within(Duration::from_millis(100)))
            .unwrap_err();
        match err {
            Error::ProcessSpawnFailure(msg) => assert!(msg.contains("1 attempts"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
        // Socket wait cut to the budget, plus at most the term grace.
        assert!(start.elapsed() < Duration::from_millis(900));
    }

    #[test]
    fn lock_hold_refuses_to_link() {
        let dir = tempfile::tempdir().unwrap();
        let native = dir.path().join("native.sock");
        let _agent = FakeAgent::with_keys(&native, 1).unwrap();
        let store = SessionStore::new(
            dir.path().join("session.json"),
            dir.path().join("lock.json"),
            Duration::from_secs(900),
        );
        let vault = ScriptVault {
            status: VaultStatus::Unlocked,
            script: "exit 99".into(),
            status_calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut sup = supervisor(dir.path(), vec![native.clone()], vault).with_lock_hold(store.clone());

        store.invalidate().unwrap();
        let err = sup.ensure_live(CallerMode::Wait).unwrap_err();
        assert!(matches!(err, Error::NoSession(_)), "{err}");
        assert_eq!(sup.state(), SupervisorState::AwaitingAuth);
        assert!(sup.canonical_path().symlink_metadata().is_err());

        store.touch().unwrap();
        let found = sup.ensure_live(CallerMode::Wait).unwrap();
        assert_eq!(found.endpoint.path, native);
    }

    #[test]
    fn force_stop_is_idempotent_without_anything_running() {
        let dir = tempfile::tempdir().unwrap();
        let vault = ScriptVault {
            status: VaultStatus::Locked,
            script: "true".into(),
            status_calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut sup = supervisor(dir.path(), vec![], vault);
        sup.force_stop().unwrap();
        sup.force_stop().unwrap();
        assert_eq!(sup.state(), SupervisorState::Idle);
    }

    #[test]
    fn force_stop_unlinks_native_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let native = dir.path().join("native.sock");
        let _agent = FakeAgent::with_keys(&native, 1).unwrap();
        let vault = ScriptVault {
            status: VaultStatus::Unlocked,
            script: "exit 99".into(),
            status_calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut sup = supervisor(dir.path(), vec![native.clone()], vault);
        sup.ensure_live(CallerMode::FailFast).unwrap();
        sup.force_stop().unwrap();
        assert!(std::fs::symlink_metadata(sup.canonical_path()).is_err());
        // The provider's own socket is not ours to remove.
        assert!(native.exists());
    }

    #[test]
    fn state_display() {
        assert_eq!(
            SupervisorState::Linked(EndpointKind::Managed).to_string(),
            "linked(managed)"
        );
    }

    #[test]
    fn running_daemon_ignores_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("daemon.pid");
        assert_eq!(running_daemon(&pid_file), None);
        std::fs::write(&pid_file, format!("{}\n", i32::MAX)).unwrap();
        assert_eq!(running_daemon(&pid_file), None);
        std::fs::write(&pid_file, format!("{}\n", std::process::id())).unwrap();
        assert_eq!(running_daemon(&pid_file), Some(std::process::id()));
    }
}
