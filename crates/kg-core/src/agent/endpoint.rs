//! Agent endpoints and the canonical socket reference.
//!
//! Consumers only ever see one path (`SSH_AUTH_SOCK`). That path is a
//! symlink to whichever provider is live. It is replaced with
//! symlink-then-rename so an observer sees either the old target or the new
//! one, never a missing link mid-swap.

use super::protocol::{self, AgentReply, ProbeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which provider serves an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// A socket owned by another application (desktop vault, override).
    Native,
    /// An agent process keygate started itself.
    Managed,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Native => write!(f, "native"),
            EndpointKind::Managed => write!(f, "managed"),
        }
    }
}

/// A reachable key-serving socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub path: PathBuf,
    pub kind: EndpointKind,
    pub live_since: Option<DateTime<Utc>>,
}

impl AgentEndpoint {
    pub fn new(path: impl Into<PathBuf>, kind: EndpointKind) -> Self {
        Self {
            path: path.into(),
            kind,
            live_since: None,
        }
    }

    pub fn mark_live(mut self) -> Self {
        self.live_since.get_or_insert_with(Utc::now);
        self
    }

    pub fn probe(&self, timeout: Duration) -> Result<AgentReply, ProbeError> {
        protocol::request_identities(&self.path, timeout)
    }
}

/// The single advertised path, as a symlink to the live provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalLink {
    path: PathBuf,
}

impl CanonicalLink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically point the link at `target`.
    pub fn point_at(&self, target: &Path) -> io::Result<()> {
        if target == self.path {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "canonical link cannot point at itself",
            ));
        }
        let dir = self
            .path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "link has no parent"))?;
        crate::fsutil::ensure_private_dir(dir)?;

        let tmp = dir.join(format!(
            ".{}.{}.{}",
            self.file_name(),
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::os::unix::fs::symlink(target, &tmp)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    /// Remove the link. Succeeds if it is already absent.
    pub fn clear(&self) -> io::Result<()> {
        crate::fsutil::remove_if_exists(&self.path)
    }

    /// Current link target, if the link exists.
    pub fn target(&self) -> Option<PathBuf> {
        fs::read_link(&self.path).ok()
    }

    pub fn points_at(&self, target: &Path) -> bool {
        self.target().as_deref() == Some(target)
    }

    /// Probe through the link. Fails if the link is dangling or the provider
    /// does not answer.
    pub fn probe(&self, timeout: Duration) -> Result<AgentReply, ProbeError> {
        protocol::request_identities(&self.path, timeout)
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent.sock".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_at_replaces_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let link = CanonicalLink::new(dir.path().join("agent.sock"));

        link.point_at(Path::new("/run/a.sock")).unwrap();
        assert!(link.points_at(Path::new("/run/a.sock")));

        link.point_at(Path::new("/run/b.sock")).unwrap();
        assert_eq!(link.target(), Some(PathBuf::from("/run/b.sock")));

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let link = CanonicalLink::new(dir.path().join("agent.sock"));
        link.clear().unwrap();
        link.point_at(Path::new("/run/a.sock")).unwrap();
        link.clear().unwrap();
        link.clear().unwrap();
        assert_eq!(link.target(), None);
    }

    #[test]
    fn refuses_self_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let link = CanonicalLink::new(&path);
        assert!(link.point_at(&path).is_err());
    }

    #[test]
    fn dangling_link_does_not_probe() {
        let dir = tempfile::tempdir().unwrap();
        let link = CanonicalLink::new(dir.path().join("agent.sock"));
        link.point_at(&dir.path().join("missing.sock")).unwrap();
        assert!(link.probe(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn mark_live_keeps_first_timestamp() {
        let ep = AgentEndpoint::new("/x", EndpointKind::Native).mark_live();
        let first = ep.live_since;
        let again = ep.mark_live();
        assert_eq!(again.live_since, first);
    }
}
