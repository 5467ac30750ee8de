//! Socket Locator: find the socket currently answering agent requests.
//!
//! Stateless. Each call walks the candidate list in order and returns the
//! first one that is a socket and answers a listing request within the
//! probe timeout. An empty answer qualifies: it means "present but locked".

use super::endpoint::{AgentEndpoint, EndpointKind};
use super::protocol::{self, ProbeError};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

/// One place a provider might be listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub kind: EndpointKind,
}

impl Candidate {
    pub fn native(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: EndpointKind::Native,
        }
    }

    pub fn managed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: EndpointKind::Managed,
        }
    }
}

/// A qualifying candidate plus what it answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub endpoint: AgentEndpoint,
    pub key_count: usize,
}

/// Default locations where desktop vault applications expose their agent.
pub fn default_native_sockets(home: &Path) -> Vec<PathBuf> {
    vec![
        home.join(".bitwarden-ssh-agent.sock"),
        home.join(".var/app/com.bitwarden.desktop/data/.bitwarden-ssh-agent.sock"),
        home.join("snap/bitwarden/current/.bitwarden-ssh-agent.sock"),
    ]
}

#[derive(Debug, Clone)]
pub struct SocketLocator {
    candidates: Vec<Candidate>,
    probe_timeout: Duration,
}

impl SocketLocator {
    /// Build the ordered list: override first, then native defaults, then
    /// the managed socket last.
    pub fn new(
        override_path: Option<PathBuf>,
        native: impl IntoIterator<Item = PathBuf>,
        managed: Option<PathBuf>,
    ) -> Self {
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut push = |c: Candidate| {
            if !candidates.iter().any(|seen| seen.path == c.path) {
                candidates.push(c);
            }
        };
        if let Some(p) = override_path {
            push(Candidate::native(p));
        }
        for p in native {
            push(Candidate::native(p));
        }
        if let Some(p) = managed {
            push(Candidate::managed(p));
        }
        Self {
            candidates,
            probe_timeout: protocol::DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// First qualifying candidate, or `None`.
    pub fn locate(&self) -> Option<Located> {
        self.candidates.iter().find_map(|c| self.qualify(c))
    }

    fn qualify(&self, candidate: &Candidate) -> Option<Located> {
        if !is_socket(&candidate.path) {
            trace!(path = %candidate.path.display(), "candidate absent");
            return None;
        }
        match protocol::request_identities(&candidate.path, self.probe_timeout) {
            Ok(reply) => Some(Located {
                endpoint: AgentEndpoint::new(&candidate.path, candidate.kind).mark_live(),
                key_count: reply.key_count(),
            }),
            Err(err) => {
                log_probe_failure(&candidate.path, &err);
                None
            }
        }
    }
}

/// Whether `path` exists (following symlinks) and is a socket.
pub fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

fn log_probe_failure(path: &Path, err: &ProbeError) {
    debug!(path = %path.display(), error = %err, "candidate did not answer");
}
