//! External vault CLI.
//!
//! Two questions are asked of the vault: "are you unlocked?" and "start an
//! agent bound to this socket". Both go through [`VaultCli`] so the
//! supervisor can be driven by a fake in tests.

use crate::poll::{poll_until, CancelToken, PollOutcome, PollSpec};
use kg_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Placeholder substituted with the managed socket path in agent args.
pub const SOCKET_PLACEHOLDER: &str = "{socket}";

/// Upper bound on one `status` query. The stock CLI starts a JavaScript
/// runtime and can take a few seconds on a cold cache.
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on captured `status` output.
const MAX_STATUS_OUTPUT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultStatus {
    /// No account session at all.
    Unauthenticated,
    /// Logged in, vault locked.
    Locked,
    /// Logged in and unlocked; can serve keys.
    Unlocked,
}

impl VaultStatus {
    /// Whether a managed agent started now would serve keys.
    pub fn can_serve(self) -> bool {
        matches!(self, VaultStatus::Unlocked)
    }

    /// Parse `bw status`-style output: a JSON object with a `status` field,
    /// or a bare status word.
    pub fn parse(output: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct StatusDoc {
            status: String,
        }
        let word = match serde_json::from_str::<StatusDoc>(output.trim()) {
            Ok(doc) => doc.status,
            Err(_) => output.trim().to_string(),
        };
        match word.to_ascii_lowercase().as_str() {
            "unlocked" => Some(VaultStatus::Unlocked),
            "locked" => Some(VaultStatus::Locked),
            "unauthenticated" | "logged out" | "loggedout" => Some(VaultStatus::Unauthenticated),
            _ => None,
        }
    }
}

impl std::fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultStatus::Unauthenticated => write!(f, "unauthenticated"),
            VaultStatus::Locked => write!(f, "locked"),
            VaultStatus::Unlocked => write!(f, "unlocked"),
        }
    }
}

pub trait VaultCli: Send + Sync {
    /// Query the vault's authentication state, spending at most `limit`.
    fn status(&self, limit: Duration) -> Result<VaultStatus>;

    /// Command that runs an agent bound to `socket` until terminated.
    fn agent_command(&self, socket: &Path) -> Command;
}

/// Vault driven by an external program (`bw` by default).
#[derive(Debug, Clone)]
pub struct CommandVault {
    program: PathBuf,
    status_args: Vec<String>,
    agent_args: Vec<String>,
    timeout: Duration,
}

impl CommandVault {
    pub fn new(
        program: impl Into<PathBuf>,
        status_args: Vec<String>,
        agent_args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            status_args,
            agent_args,
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl VaultCli for CommandVault {
    fn status(&self, limit: Duration) -> Result<VaultStatus> {
        let timeout = limit.min(self.timeout);
        let mut child = Command::new(&self.program)
            .args(&self.status_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::Delegation {
                program: self.program_name(),
                source,
            })?;

        let stdout = child.stdout.take();
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(out) = stdout {
                let _ = out.take(MAX_STATUS_OUTPUT as u64).read_to_end(&mut buf);
            }
            buf
        });

        let waited = poll_until(
            PollSpec::new(Duration::from_millis(25), timeout),
            &CancelToken::with_signals(),
            || child.try_wait().ok().flatten(),
        );
        let status = match waited {
            PollOutcome::Ready { value, .. } => value,
            PollOutcome::TimedOut { .. } | PollOutcome::Cancelled => {
                warn!(program = %self.program_name(), "vault status query did not finish, killing");
                let _ = child.kill();
                let _ = child.wait();
                // A grandchild may still hold the pipe; leave the reader detached.
                drop(reader);
                return Err(Error::EndpointUnreachable(format!(
                    "{} status did not answer within {}ms",
                    self.program_name(),
                    timeout.as_millis()
                )));
            }
        };

        let output = reader.join().unwrap_or_default();
        let text = String::from_utf8_lossy(&output);
        debug!(exit = ?status.code(), "vault status query finished");

        match VaultStatus::parse(&text) {
            Some(parsed) => Ok(parsed),
            // A failing status call without parseable output means no session.
            None if !status.success() => Ok(VaultStatus::Unauthenticated),
            None => Err(Error::Config(format!(
                "unrecognised output from {} status: {:?}",
                self.program_name(),
                text.trim()
            ))),
        }
    }

    fn agent_command(&self, socket: &Path) -> Command {
        let socket = socket.display().to_string();
        let mut cmd = Command::new(&self.program);
        cmd.args(
            self.agent_args
                .iter()
                .map(|arg| arg.replace(SOCKET_PLACEHOLDER, &socket)),
        );
        cmd.env("SSH_AUTH_SOCK", &socket);
        cmd
    }
}
