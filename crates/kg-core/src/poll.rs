//! Bounded, cancellable polling.
//!
//! Every wait in keygate (socket appearance, vault authentication, unlock,
//! process exit) goes through [`poll_until`] or [`sleep_interruptible`]:
//! a fixed probe interval, a hard upper bound on total wait measured on the
//! monotonic clock, and a [`CancelToken`] checked at least every
//! [`CANCEL_CHECK_SLICE`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep inside a wait.
pub const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(100);

/// Stand-in deadline for waits too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Cooperative cancellation flag shared between a waiter and whoever may
/// want to stop it.
///
/// Tokens created with [`CancelToken::with_signals`] also observe the
/// process-wide shutdown flag set by the signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    follow_signals: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is also cancelled by SIGINT/SIGTERM/SIGHUP.
    pub fn with_signals() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            follow_signals: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.follow_signals && crate::shutdown::requested())
    }
}

/// Interval and bound for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl PollSpec {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The probe produced a value.
    Ready { value: T, waited: Duration },
    /// `max_wait` elapsed without the probe succeeding.
    TimedOut { waited: Duration },
    /// The cancel token fired first.
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            PollOutcome::Ready { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Probe immediately, then every `spec.interval`, until the probe returns
/// `Some`, `spec.max_wait` has elapsed, or `cancel` fires.
///
/// The probe always runs at least once, and once more at the deadline if
/// the last interval was cut short by it.
pub fn poll_until<T, F>(spec: PollSpec, cancel: &CancelToken, mut probe: F) -> PollOutcome<T>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    let deadline = deadline_after(start, spec.max_wait);

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if let Some(value) = probe() {
            return PollOutcome::Ready {
                value,
                waited: start.elapsed(),
            };
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut {
                waited: start.elapsed(),
            };
        }

        let nap = spec.interval.min(deadline - now);
        if !sleep_interruptible(nap, cancel) {
            return PollOutcome::Cancelled;
        }
    }
}

/// Sleep for `duration` in short slices. Returns `false` if cancelled
/// before the full duration elapsed.
pub fn sleep_interruptible(duration: Duration, cancel: &CancelToken) -> bool {
    let deadline = deadline_after(Instant::now(), duration);
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
    }
}

/// `start + wait`, saturating instead of panicking on overflow.
pub fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn ready_on_first_probe_does_not_sleep() {
        let outcome = poll_until(PollSpec::new(ms(500), ms(5_000)), &CancelToken::new(), || {
            Some(7)
        });
        match outcome {
            PollOutcome::Ready { value, waited } => {
                assert_eq!(value, 7);
                assert!(waited < ms(100));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn times_out_after_bound() {
        let calls = Cell::new(0u32);
        let start = Instant::now();
        let outcome: PollOutcome<()> =
            poll_until(PollSpec::new(ms(20), ms(120)), &CancelToken::new(), || {
                calls.set(calls.get() + 1);
                None
            });
        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert!(start.elapsed() >= ms(120));
        assert!(start.elapsed() < ms(1_000));
        assert!(calls.get() >= 3, "probed {} times", calls.get());
    }

    #[test]
    fn becomes_ready_midway() {
        let calls = Cell::new(0u32);
        let outcome = poll_until(PollSpec::new(ms(10), ms(2_000)), &CancelToken::new(), || {
            calls.set(calls.get() + 1);
            (calls.get() == 3).then_some("up")
        });
        assert_eq!(outcome.ready(), Some("up"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn cancelled_token_stops_before_probing() {
        let token = CancelToken::new();
        token.cancel();
        let outcome: PollOutcome<()> = poll_until(PollSpec::new(ms(10), ms(1_000)), &token, || {
            panic!("probe must not run after cancellation")
        });
        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[test]
    fn cancel_from_another_thread_interrupts_sleep() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(ms(50));
            remote.cancel();
        });
        let start = Instant::now();
        assert!(!sleep_interruptible(Duration::from_secs(10), &token));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn zero_max_wait_probes_once() {
        let calls = Cell::new(0u32);
        let outcome: PollOutcome<()> =
            poll_until(PollSpec::new(ms(10), Duration::ZERO), &CancelToken::new(), || {
                calls.set(calls.get() + 1);
                None
            });
        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn huge_max_wait_does_not_overflow() {
        let outcome = poll_until(
            PollSpec::new(ms(10), Duration::from_secs(u64::MAX)),
            &CancelToken::new(),
            || Some(()),
        );
        assert!(matches!(outcome, PollOutcome::Ready { .. }));

        let token = CancelToken::new();
        token.cancel();
        assert!(!sleep_interruptible(Duration::MAX, &token));
        assert!(deadline_after(Instant::now(), Duration::MAX) > Instant::now());
    }
}
