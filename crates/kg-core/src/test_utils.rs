//! Test utilities for kg-core.
//!
//! Exported under the `test-utils` feature so integration tests can drive
//! the real supervisor and gatekeeper without a vault installed:
//! - [`FakeAgent`]: an in-process agent answering identity listings on a
//!   Unix socket
//! - [`FakeVault`]: a vault whose status the test flips
//! - [`ScriptedAgent`]: an [`AgentControl`] replaying canned probe results
//! - [`RecordingPrompt`]: an [`UnlockPrompt`] that keeps every notice
//! - [`TestRuntime`]: tempdir-backed runtime and state directories

use crate::agent::protocol::{decode, read_message, write_message, Identity};
use crate::agent::{
    AgentControl, AgentEndpoint, CallerMode, EndpointKind, Located, SupervisorPaths,
    SupervisorTimings,
};
use crate::poll::PollSpec;
use crate::prompt::{Notice, UnlockPrompt};
use crate::session::SessionStore;
use crate::vault::{VaultCli, VaultStatus};
use kg_common::{Error, Result};
use ssh_agent_lib::proto::{Request, Response};
use ssh_key::public::{Ed25519PublicKey, KeyData};
use std::io::{self, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// An ed25519 identity with the given comment.
pub fn test_identity(comment: &str) -> Identity {
    Identity {
        pubkey: KeyData::Ed25519(Ed25519PublicKey([7u8; 32])),
        comment: comment.to_string(),
    }
}

/// What a [`FakeAgent`] answers to `REQUEST_IDENTITIES`.
#[derive(Debug, Clone)]
pub enum FakeReply {
    Keys(Vec<Identity>),
    Failure,
    /// Accept and read, never answer.
    Silent,
}

impl FakeReply {
    pub fn keys(count: usize) -> Self {
        FakeReply::Keys(
            (0..count)
                .map(|i| test_identity(&format!("key-{i}")))
                .collect(),
        )
    }
}

/// In-process agent bound to a Unix socket. Stops and unlinks on drop.
pub struct FakeAgent {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeAgent {
    pub fn start(path: impl Into<PathBuf>, reply: FakeReply) -> io::Result<Self> {
        let path = path.into();
        let listener = UnixListener::bind(&path)?;
        // Polled so shutdown works even after someone unlinks the path.
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let conn = match listener.accept() {
                        Ok((conn, _)) => conn,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                            continue;
                        }
                        Err(_) => break,
                    };
                    serve_connection(conn, reply.clone());
                }
            })
        };

        Ok(Self {
            path,
            stop,
            handle: Some(handle),
        })
    }

    pub fn with_keys(path: impl Into<PathBuf>, count: usize) -> io::Result<Self> {
        Self::start(path, FakeReply::keys(count))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop serving without unlinking the socket path, like a crashed
    /// provider that leaves its socket file behind.
    pub fn crash(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

const ACCEPT_POLL: Duration = Duration::from_millis(10);

fn serve_connection(mut conn: UnixStream, reply: FakeReply) {
    let _ = conn.set_nonblocking(false);
    let _ = conn.set_read_timeout(Some(Duration::from_secs(2)));
    let Ok(body) = read_message(&mut conn) else {
        return;
    };
    let response = match (decode::<Request>(&body), reply) {
        (Ok(Request::RequestIdentities), FakeReply::Keys(ids)) => Response::IdentitiesAnswer(ids),
        (_, FakeReply::Silent) => {
            // Hold the connection open until the client gives up.
            let _ = conn.read(&mut [0u8; 1]);
            return;
        }
        _ => Response::Failure,
    };
    let _ = write_message(&mut conn, &response);
}

/// Vault whose status is shared with the test.
#[derive(Debug, Clone)]
pub struct FakeVault {
    status: Arc<Mutex<VaultStatus>>,
    agent_script: String,
    status_calls: Arc<AtomicUsize>,
}

impl FakeVault {
    pub fn new(status: VaultStatus) -> Self {
        Self {
            status: Arc::new(Mutex::new(status)),
            agent_script: "exit 1".to_string(),
            status_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `sh -c` script run as the managed agent. `$KG_SOCKET` is the socket
    /// it should bind.
    pub fn with_agent_script(mut self, script: impl Into<String>) -> Self {
        self.agent_script = script.into();
        self
    }

    pub fn set_status(&self, status: VaultStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

impl VaultCli for FakeVault {
    fn status(&self, _limit: Duration) -> Result<VaultStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status
            .lock()
            .map(|s| *s)
            .map_err(|_| Error::Config("fake vault poisoned".into()))
    }

    fn agent_command(&self, socket: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &self.agent_script]).env("KG_SOCKET", socket);
        cmd
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    /// Key counts per `ensure_live` call; `None` is unreachable.
    replies: Vec<Option<usize>>,
    next: usize,
    modes: Vec<CallerMode>,
    force_stops: usize,
}

/// [`AgentControl`] that replays canned results. The last reply repeats.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Option<usize>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                replies,
                ..Default::default()
            })),
        }
    }

    /// Caller mode of every `ensure_live` call so far.
    pub fn modes(&self) -> Vec<CallerMode> {
        self.state.lock().map(|s| s.modes.clone()).unwrap_or_default()
    }

    pub fn force_stops(&self) -> usize {
        self.state.lock().map(|s| s.force_stops).unwrap_or(0)
    }
}

impl AgentControl for ScriptedAgent {
    fn ensure_live(&mut self, mode: CallerMode) -> Result<Located> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Config("scripted agent poisoned".into()))?;
        state.modes.push(mode);
        let idx = state.next.min(state.replies.len().saturating_sub(1));
        state.next += 1;
        match state.replies.get(idx).copied().flatten() {
            Some(key_count) => Ok(Located {
                endpoint: AgentEndpoint::new("/scripted/agent.sock", EndpointKind::Native)
                    .mark_live(),
                key_count,
            }),
            None => Err(Error::EndpointUnreachable("scripted".into())),
        }
    }

    fn force_stop(&mut self) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state.force_stops += 1;
        }
        Ok(())
    }
}

/// Keeps every notice and counts foreground requests.
#[derive(Debug, Clone, Default)]
pub struct RecordingPrompt {
    notices: Arc<Mutex<Vec<Notice>>>,
    fronts: Arc<AtomicUsize>,
}

impl RecordingPrompt {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn fronts(&self) -> usize {
        self.fronts.load(Ordering::SeqCst)
    }
}

impl UnlockPrompt for RecordingPrompt {
    fn notify(&self, notice: &Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice.clone());
        }
    }

    fn bring_to_front(&self) {
        self.fronts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Isolated runtime and state directories.
pub struct TestRuntime {
    dir: tempfile::TempDir,
}

impl TestRuntime {
    /// Also writes a config file with no native socket candidates, so the
    /// host's own vault sockets never leak into a test.
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("config.toml"), "native_sockets = []\n")?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.dir.path().join("run")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn paths(&self) -> SupervisorPaths {
        SupervisorPaths::in_dir(self.runtime_dir())
    }

    pub fn session_store(&self, ttl: Duration) -> SessionStore {
        SessionStore::new(
            self.state_dir().join("session.json"),
            self.state_dir().join("lock.json"),
            ttl,
        )
    }
}

/// Supervisor timings short enough for tests.
pub fn fast_timings() -> SupervisorTimings {
    SupervisorTimings {
        auth_wait: PollSpec::new(Duration::from_millis(20), Duration::from_millis(100)),
        socket_wait: PollSpec::new(Duration::from_millis(20), Duration::from_millis(500)),
        spawn_attempts: 2,
        restart_backoff: Duration::from_millis(20),
        native_poll: Duration::from_millis(20),
        managed_poll: Duration::from_millis(20),
        adopted_poll: Duration::from_millis(20),
        term_grace: Duration::from_millis(500),
        lock_wait: Duration::from_millis(200),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::request_identities;

    #[test]
    fn fake_agent_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_keys(dir.path().join("a.sock"), 2).unwrap();
        let reply = request_identities(agent.path(), Duration::from_millis(500)).unwrap();
        assert_eq!(reply.key_count(), 2);

        let path = agent.path().to_path_buf();
        drop(agent);
        assert!(!path.exists());
    }

    #[test]
    fn scripted_agent_repeats_last_reply() {
        let mut agent = ScriptedAgent::new(vec![None, Some(1)]);
        assert!(agent.ensure_live(CallerMode::FailFast).is_err());
        assert_eq!(agent.ensure_live(CallerMode::FailFast).unwrap().key_count, 1);
        assert_eq!(agent.ensure_live(CallerMode::Wait).unwrap().key_count, 1);
        assert_eq!(
            agent.modes(),
            vec![CallerMode::FailFast, CallerMode::FailFast, CallerMode::Wait]
        );
    }
}
