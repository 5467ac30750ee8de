//! Managed agent process handle, its persisted record, and the spawn lock.
//!
//! A managed process is either *owned* (spawned by this invocation, so we
//! hold the `Child`) or *adopted* (spawned by another invocation and found
//! through `managed.json`). Both can be polled and terminated; only owned
//! children report an exit status.

use crate::fsutil;
use crate::poll::{poll_until, CancelToken, PollOutcome, PollSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default wait between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(3);

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Persisted description of the running managed agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub socket_path: PathBuf,
    /// Program basename, checked against the live pid to avoid signalling
    /// a recycled pid.
    #[serde(default)]
    pub program: Option<String>,
}

impl ManagedRecord {
    pub fn load(path: &Path) -> io::Result<Option<Self>> {
        fsutil::read_json(path)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fsutil::write_json_atomic(path, self)
    }

    pub fn remove(path: &Path) -> io::Result<()> {
        fsutil::remove_if_exists(path)
    }

    /// The recorded pid exists and still runs the recorded program.
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid) && self.program_matches()
    }

    #[cfg(target_os = "linux")]
    fn program_matches(&self) -> bool {
        let Some(expected) = self.program.as_deref() else {
            return true;
        };
        let Ok(cmdline) = std::fs::read(format!("/proc/{}/cmdline", self.pid)) else {
            // Unreadable (hidepid): trust the pid.
            return true;
        };
        // argv[1] covers interpreters (`node /usr/bin/bw ...`).
        cmdline
            .split(|b| *b == 0)
            .take(2)
            .any(|arg| basename(&String::from_utf8_lossy(arg)) == expected)
    }

    #[cfg(not(target_os = "linux"))]
    fn program_matches(&self) -> bool {
        true
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// How a managed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    /// Exit of a process we did not parent; no status is available.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process was already gone.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

#[derive(Debug)]
pub struct ManagedProcess {
    child: Option<Child>,
    record: ManagedRecord,
}

impl ManagedProcess {
    /// Start `command` in its own process group with stdio detached.
    pub fn spawn(mut command: Command, socket_path: &Path) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let program = basename(&command.get_program().to_string_lossy());
        let child = command.spawn()?;
        let record = ManagedRecord {
            pid: child.id(),
            started_at: Utc::now(),
            socket_path: socket_path.to_path_buf(),
            program: Some(program),
        };
        debug!(pid = record.pid, socket = %socket_path.display(), "spawned managed agent");
        Ok(Self {
            child: Some(child),
            record,
        })
    }

    /// Take over a process started by another invocation.
    pub fn adopt(record: ManagedRecord) -> Self {
        Self {
            child: None,
            record,
        }
    }

    pub fn pid(&self) -> u32 {
        self.record.pid
    }

    pub fn record(&self) -> &ManagedRecord {
        &self.record
    }

    pub fn is_owned(&self) -> bool {
        self.child.is_some()
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> Option<ExitReport> {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.into()),
                Ok(None) => None,
                Err(e) => {
                    warn!(pid = self.record.pid, error = %e, "try_wait failed");
                    None
                }
            },
            None => (!self.record.is_alive()).then(ExitReport::unknown),
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Idempotent.
    pub fn terminate(&mut self, grace: Duration) -> TerminateOutcome {
        if self.try_exit().is_some() {
            return TerminateOutcome::AlreadyExited;
        }
        let pid = self.record.pid;
        match send_signal(pid, libc::SIGTERM) {
            Ok(false) => {
                self.reap();
                return TerminateOutcome::AlreadyExited;
            }
            Ok(true) => debug!(pid, "sent SIGTERM"),
            Err(e) => warn!(pid, error = %e, "SIGTERM failed"),
        }

        let exited = poll_until(PollSpec::new(EXIT_POLL, grace), &CancelToken::new(), || {
            self.try_exit()
        });
        if let PollOutcome::Ready { value, .. } = exited {
            trace!(pid, status = %value, "managed agent exited after SIGTERM");
            return TerminateOutcome::Terminated;
        }

        warn!(pid, "managed agent ignored SIGTERM, sending SIGKILL");
        if let Err(e) = send_signal(pid, libc::SIGKILL) {
            warn!(pid, error = %e, "SIGKILL failed");
        }
        self.reap();
        TerminateOutcome::Killed
    }

    fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.wait();
        }
    }
}

/// Send `signal` to `pid`. `Ok(false)` if no such process.
pub fn send_signal(pid: u32, signal: i32) -> io::Result<bool> {
    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid <= 0"));
    }
    // SAFETY: kill(2) with a positive pid has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        _ => Err(err),
    }
}

/// Whether a process with this pid exists.
pub fn pid_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(alive) => alive,
        // EPERM: exists but owned by someone else.
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

/// Exclusive advisory lock serialising managed-agent spawns.
///
/// Released on drop. The lock file itself is left in place.
#[derive(Debug)]
pub struct SpawnLock {
    file: File,
    path: PathBuf,
}

impl SpawnLock {
    /// Try once without blocking. `Ok(None)` if another holder has it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fsutil::ensure_private_dir(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(fsutil::FILE_MODE)
            .open(path)?;

        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is valid for the lifetime of `file`.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// Retry until acquired, `max_wait` elapses, or `cancel` fires.
    pub fn acquire(path: &Path, max_wait: Duration, cancel: &CancelToken) -> io::Result<Option<Self>> {
        let mut last_err = None;
        let outcome = poll_until(PollSpec::new(EXIT_POLL * 2, max_wait), cancel, || {
            match Self::try_acquire(path) {
                Ok(lock) => lock,
                Err(e) => {
                    last_err = Some(e);
                    None
                }
            }
        });
        match (outcome, last_err) {
            (PollOutcome::Ready { value, .. }, _) => Ok(Some(value)),
            (_, Some(e)) => Err(e),
            _ => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpawnLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is valid until `file` is dropped after this.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
