//! Gatekeeper and interceptor driven against a real supervisor, an
//! in-process agent and a fake vault.

#![cfg(feature = "test-utils")]

use kg_common::{Error, Result};
use kg_core::agent::{AgentSupervisor, SocketLocator};
use kg_core::fsutil;
use kg_core::gate::{FreshOutcome, Gatekeeper};
use kg_core::intercept::{GitConfigSource, Interceptor, ProcessDelegate};
use kg_core::logging::LogContext;
use kg_core::poll::CancelToken;
use kg_core::prompt::Notice;
use kg_core::test_utils::{fast_timings, FakeAgent, FakeReply, FakeVault, RecordingPrompt, TestRuntime};
use kg_core::vault::VaultStatus;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

const TTL: Duration = Duration::from_secs(900);

struct NoConfig;

impl GitConfigSource for NoConfig {
    fn get(&self, _globals: &[String], _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

struct Harness {
    rt: TestRuntime,
    vault: FakeVault,
    prompt: RecordingPrompt,
}

impl Harness {
    fn new() -> Self {
        let rt = TestRuntime::new().unwrap();
        fsutil::ensure_private_dir(&rt.runtime_dir()).unwrap();
        Self {
            rt,
            vault: FakeVault::new(VaultStatus::Locked),
            prompt: RecordingPrompt::default(),
        }
    }

    fn native(&self) -> PathBuf {
        self.rt.root().join("native.sock")
    }

    fn canonical(&self) -> PathBuf {
        self.rt.paths().canonical
    }

    fn gatekeeper(&self, unlock_timeout: Duration) -> Gatekeeper {
        let ctx = LogContext::new("test", "gate");
        let paths = self.rt.paths();
        let locator = SocketLocator::new(None, vec![self.native()], Some(paths.managed_socket.clone()))
            .with_probe_timeout(Duration::from_millis(200));
        let supervisor = AgentSupervisor::new(locator, Box::new(self.vault.clone()), paths, ctx.clone())
            .with_timings(fast_timings())
            .with_cancel(CancelToken::new());
        Gatekeeper::new(
            self.rt.session_store(TTL),
            Box::new(supervisor),
            Box::new(self.prompt.clone()),
            unlock_timeout,
            ctx,
        )
        .with_poll_interval(Duration::from_millis(50))
        .with_cancel(CancelToken::new())
    }

    /// A stand-in VCS program that records its socket and exits 5.
    fn program(&self) -> PathBuf {
        let path = self.rt.root().join("fake-git");
        let seen = self.rt.root().join("seen-socket");
        std::fs::write(
            &path,
            format!("#!/bin/sh\necho \"$SSH_AUTH_SOCK\" > {}\nexit 5\n", seen.display()),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn seen_socket(&self) -> Option<String> {
        std::fs::read_to_string(self.rt.root().join("seen-socket"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn interceptor(&self, unlock_timeout: Duration) -> Interceptor {
        Interceptor::new(
            self.program(),
            self.canonical(),
            Box::new(self.gatekeeper(unlock_timeout)),
            Box::new(NoConfig),
            Box::new(ProcessDelegate),
            LogContext::new("test", "git"),
        )
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn push_waits_for_unlock_then_runs() {
    let h = Harness::new();
    let mut interceptor = h.interceptor(Duration::from_secs(5));

    let native = h.native();
    let unlocker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        FakeAgent::with_keys(native, 1).unwrap()
    });

    let result = interceptor.intercept(&args(&["push", "origin"])).unwrap();
    let _agent = unlocker.join().unwrap();

    assert_eq!(result.exit_code, 5);
    assert!(result.decision.required);
    assert!(matches!(result.fresh, Some(FreshOutcome::Unlocked { .. })));
    assert_eq!(h.seen_socket().as_deref(), Some(h.canonical().to_str().unwrap()));
    assert_eq!(std::fs::read_link(h.canonical()).unwrap(), h.native());
    assert!(h.rt.session_store(TTL).is_fresh());

    let notices = h.prompt.notices();
    assert!(matches!(notices.first(), Some(Notice::SessionExpired { .. })));
    assert!(notices.iter().any(|n| matches!(n, Notice::AwaitingUnlock { .. })));
    assert_eq!(notices.last(), Some(&Notice::Unlocked));
    assert_eq!(h.prompt.fronts(), 1);
}

#[test]
fn timeout_aborts_without_running_the_program() {
    let h = Harness::new();
    let mut interceptor = h.interceptor(Duration::from_secs(1));

    let started = Instant::now();
    let err = interceptor.intercept(&args(&["fetch"])).unwrap_err();
    assert!(matches!(err, Error::UnlockTimeout { seconds: 1 }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(h.seen_socket(), None);
    assert!(!h.rt.session_store(TTL).is_fresh());
}

#[test]
fn ungated_command_runs_without_the_gate() {
    let h = Harness::new();
    let mut interceptor = h.interceptor(Duration::from_secs(1));

    let result = interceptor.intercept(&args(&["status"])).unwrap();
    assert_eq!(result.exit_code, 5);
    assert!(result.fresh.is_none());
    assert!(h.prompt.notices().is_empty());
    // No canonical link exists, so the socket is left alone.
    assert_ne!(h.seen_socket().as_deref(), h.canonical().to_str());
}

#[test]
fn fresh_session_takes_the_fast_path_silently() {
    let h = Harness::new();
    let _agent = FakeAgent::with_keys(h.native(), 2).unwrap();
    h.rt.session_store(TTL).touch().unwrap();

    let mut gate = h.gatekeeper(Duration::from_secs(1));
    let outcome = gate.ensure_fresh(true).unwrap();
    assert!(matches!(outcome, FreshOutcome::FastPath { .. }));
    assert!(h.prompt.notices().is_empty());
    assert_eq!(h.prompt.fronts(), 0);
    assert_eq!(h.vault.status_calls(), 0);
}

#[test]
fn agent_without_keys_is_purged() {
    let h = Harness::new();
    let _agent = FakeAgent::start(h.native(), FakeReply::Failure).unwrap();
    h.rt.session_store(TTL).touch().unwrap();

    let mut gate = h.gatekeeper(Duration::from_secs(1));
    let err = gate.ensure_fresh(false).unwrap_err();
    assert!(matches!(err, Error::NoSession(_)), "{err:?}");
    assert!(h.canonical().symlink_metadata().is_err());
    assert!(matches!(
        h.prompt.notices().as_slice(),
        [Notice::SessionExpired { .. }]
    ));
}

#[test]
fn lock_invalidates_and_unlinks() {
    let h = Harness::new();
    let _agent = FakeAgent::with_keys(h.native(), 1).unwrap();
    h.rt.session_store(TTL).touch().unwrap();

    let mut gate = h.gatekeeper(Duration::from_secs(1));
    gate.ensure_fresh(true).unwrap();
    assert!(h.canonical().symlink_metadata().is_ok());

    let marker = gate.lock().unwrap();
    assert!(!marker.id.is_empty());
    assert!(!gate.is_fresh());
    assert!(h.canonical().symlink_metadata().is_err());
    assert_eq!(h.prompt.notices().last(), Some(&Notice::Locked));

    // A second lock still succeeds and records a new marker.
    let again = gate.lock().unwrap();
    assert_ne!(again.id, marker.id);

    let err = gate.ensure_fresh(false).unwrap_err();
    assert!(matches!(err, Error::NoSession(_)));
}

#[test]
fn lock_during_wait_aborts_the_wait() {
    let h = Harness::new();
    let mut gate = h.gatekeeper(Duration::from_secs(10));

    let store = h.rt.session_store(TTL);
    let locker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        store.invalidate().unwrap();
    });

    let started = Instant::now();
    let err = gate.ensure_fresh(true).unwrap_err();
    locker.join().unwrap();

    assert!(matches!(err, Error::NoSession(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!gate.is_fresh());
}

#[test]
fn cancelled_wait_is_interrupted() {
    let h = Harness::new();
    let cancel = CancelToken::new();
    let mut gate = h.gatekeeper(Duration::from_secs(10)).with_cancel(cancel.clone());

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        cancel.cancel();
    });
    let err = gate.ensure_fresh(true).unwrap_err();
    canceller.join().unwrap();
    assert!(matches!(err, Error::Interrupted), "{err:?}");
}
