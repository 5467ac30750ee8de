//! Status Reporter.
//!
//! Read-only aggregation of what the supervisor and the gatekeeper leave
//! on disk: the canonical link, the managed process record, the daemon pid
//! file and the session record. Gathering never spawns, links or touches
//! anything.

use crate::agent::supervisor::running_daemon;
use crate::agent::{CanonicalLink, EndpointKind, ManagedRecord};
use crate::config::GateConfig;
use crate::session::SessionStore;
use chrono::{DateTime, Utc};
use kg_common::OutputFormat;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub path: PathBuf,
    pub kind: Option<EndpointKind>,
    pub target: Option<PathBuf>,
    pub live: bool,
    /// `None` when the endpoint did not answer.
    pub key_count: Option<usize>,
    pub probe_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedStatus {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub socket_path: PathBuf,
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub fresh: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub remaining_secs: Option<u64>,
    pub ttl_secs: u64,
    pub last_lock: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    /// Fresh session and a live endpoint serving at least one key.
    pub unlocked: bool,
    pub endpoint: EndpointStatus,
    pub managed: Option<ManagedStatus>,
    pub daemon_pid: Option<u32>,
    pub session: SessionStatus,
}

impl StatusReport {
    pub fn gather(config: &GateConfig) -> Self {
        let store = SessionStore::new(
            config.session_file(),
            config.lock_marker(),
            config.session_ttl(),
        );
        Self::gather_from(
            &CanonicalLink::new(config.canonical_socket()),
            &config.managed_socket(),
            &config.managed_record(),
            &config.daemon_pid(),
            &store,
            config.probe_timeout(),
        )
    }

    pub fn gather_from(
        link: &CanonicalLink,
        managed_socket: &Path,
        managed_record: &Path,
        daemon_pid: &Path,
        store: &SessionStore,
        probe_timeout: Duration,
    ) -> Self {
        let endpoint = endpoint_status(link, managed_socket, probe_timeout);
        let managed = ManagedRecord::load(managed_record)
            .ok()
            .flatten()
            .map(|record| ManagedStatus {
                alive: record.is_alive(),
                pid: record.pid,
                started_at: record.started_at,
                socket_path: record.socket_path,
            });
        let session = session_status(store);
        let unlocked = session.fresh && endpoint.key_count.is_some_and(|n| n > 0);

        StatusReport {
            generated_at: Utc::now(),
            unlocked,
            endpoint,
            managed,
            daemon_pid: running_daemon(daemon_pid),
            session,
        }
    }

    /// Single line for prompts and status bars.
    pub fn summary(&self) -> String {
        let state = if self.unlocked { "unlocked" } else { "locked" };
        let keys = match self.endpoint.key_count {
            Some(n) => format!("{n} key{}", if n == 1 { "" } else { "s" }),
            None => "no agent".to_string(),
        };
        let session = match self.session.remaining_secs {
            Some(secs) => format!("session {}", format_secs(secs)),
            None => "session expired".to_string(),
        };
        format!("keygate: {state}, {keys}, {session}")
    }

    pub fn render_human(&self) -> String {
        let mut out = String::new();
        let symbol = if self.unlocked { "✓" } else { "✗" };
        let state = if self.unlocked { "unlocked" } else { "locked" };
        out.push_str(&format!("{symbol} keygate {state}\n\n"));

        let e = &self.endpoint;
        out.push_str(&format!("Endpoint: {}\n", e.path.display()));
        match (&e.kind, &e.target) {
            (Some(kind), Some(target)) => {
                out.push_str(&format!("  Kind:   {kind} -> {}\n", target.display()))
            }
            _ => out.push_str("  Kind:   none\n"),
        }
        if e.live {
            let keys = e.key_count.unwrap_or(0);
            out.push_str(&format!("  Live:   yes, {keys} key(s)\n"));
        } else if let Some(err) = &e.probe_error {
            out.push_str(&format!("  Live:   no ({err})\n"));
        } else {
            out.push_str("  Live:   no\n");
        }

        match &self.managed {
            Some(m) => out.push_str(&format!(
                "Managed: pid {} ({}), started {}\n",
                m.pid,
                if m.alive { "running" } else { "gone" },
                m.started_at.to_rfc3339()
            )),
            None => out.push_str("Managed: none\n"),
        }
        match self.daemon_pid {
            Some(pid) => out.push_str(&format!("Daemon:  pid {pid}\n")),
            None => out.push_str("Daemon:  not running\n"),
        }

        let s = &self.session;
        match (s.verified_at, s.remaining_secs) {
            (Some(at), Some(left)) => out.push_str(&format!(
                "Session: fresh, verified {}, {} left of {}\n",
                at.to_rfc3339(),
                format_secs(left),
                format_secs(s.ttl_secs)
            )),
            (Some(at), None) => out.push_str(&format!(
                "Session: expired, last verified {}\n",
                at.to_rfc3339()
            )),
            _ => out.push_str("Session: none\n"),
        }
        if let Some(at) = s.last_lock {
            out.push_str(&format!("  Last lock: {}\n", at.to_rfc3339()));
        }
        out
    }

    pub fn render(&self, format: OutputFormat) -> kg_common::Result<String> {
        Ok(match format {
            OutputFormat::Json => serde_json::to_string_pretty(self)?,
            OutputFormat::Summary => self.summary(),
            OutputFormat::Human => self.render_human(),
        })
    }
}

fn endpoint_status(link: &CanonicalLink, managed_socket: &Path, timeout: Duration) -> EndpointStatus {
    let target = link.target();
    let kind = target.as_ref().map(|t| {
        if t == managed_socket {
            EndpointKind::Managed
        } else {
            EndpointKind::Native
        }
    });
    let (live, key_count, probe_error) = if target.is_some() {
        match link.probe(timeout) {
            Ok(reply) => (true, Some(reply.key_count()), None),
            Err(e) => (false, None, Some(e.to_string())),
        }
    } else {
        (false, None, None)
    };
    EndpointStatus {
        path: link.path().to_path_buf(),
        kind,
        target,
        live,
        key_count,
        probe_error,
    }
}

fn session_status(store: &SessionStore) -> SessionStatus {
    let now = Utc::now();
    let verified_at = store.load().ok().flatten().map(|r| r.verified_at);
    let remaining = store.remaining_at(now);
    SessionStatus {
        fresh: remaining.is_some(),
        verified_at,
        remaining_secs: remaining.map(|d| d.as_secs()),
        ttl_secs: store.ttl().as_secs(),
        last_lock: store.lock_marker().map(|m| m.locked_at),
    }
}

fn format_secs(secs: u64) -> String {
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeAgent;

    struct Layout {
        _dir: tempfile::TempDir,
        link: CanonicalLink,
        managed_socket: PathBuf,
        managed_record: PathBuf,
        daemon_pid: PathBuf,
        store: SessionStore,
    }

    fn layout() -> Layout {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        Layout {
            link: CanonicalLink::new(root.join("agent.sock")),
            managed_socket: root.join("managed.sock"),
            managed_record: root.join("managed.json"),
            daemon_pid: root.join("daemon.pid"),
            store: SessionStore::new(
                root.join("session.json"),
                root.join("lock.json"),
                Duration::from_secs(900),
            ),
            _dir: dir,
        }
    }

    fn gather(l: &Layout) -> StatusReport {
        StatusReport::gather_from(
            &l.link,
            &l.managed_socket,
            &l.managed_record,
            &l.daemon_pid,
            &l.store,
            Duration::from_millis(300),
        )
    }

    #[test]
    fn empty_runtime_is_locked() {
        let l = layout();
        let report = gather(&l);
        assert!(!report.unlocked);
        assert_eq!(report.endpoint.kind, None);
        assert!(!report.endpoint.live);
        assert_eq!(report.managed, None);
        assert_eq!(report.daemon_pid, None);
        assert!(!report.session.fresh);
        assert!(report.summary().contains("locked, no agent, session expired"));
    }

    #[test]
    fn fresh_session_with_keys_is_unlocked() {
        let l = layout();
        let _agent = FakeAgent::with_keys(&l.managed_socket, 1).unwrap();
        l.link.point_at(&l.managed_socket).unwrap();
        l.store.touch().unwrap();

        let report = gather(&l);
        assert!(report.unlocked);
        assert_eq!(report.endpoint.kind, Some(EndpointKind::Managed));
        assert_eq!(report.endpoint.key_count, Some(1));
        assert!(report.session.remaining_secs.unwrap() > 890);
        assert!(report.render_human().contains("1 key(s)"));
    }

    #[test]
    fn dangling_link_reports_probe_error() {
        let l = layout();
        l.link.point_at(&l.managed_socket).unwrap();
        let report = gather(&l);
        assert!(!report.endpoint.live);
        assert!(report.endpoint.probe_error.is_some());
        assert_eq!(report.endpoint.target.as_deref(), Some(l.managed_socket.as_path()));
    }

    #[test]
    fn json_render_has_stable_fields() {
        let l = layout();
        let json = gather(&l).render(OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for key in ["unlocked", "endpoint", "managed", "daemon_pid", "session"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["session"]["ttl_secs"], 900);
    }

    #[test]
    fn lock_marker_is_reported() {
        let l = layout();
        l.store.invalidate().unwrap();
        let report = gather(&l);
        assert!(report.session.last_lock.is_some());
        assert!(report.render_human().contains("Last lock"));
    }

    #[test]
    fn seconds_format() {
        assert_eq!(format_secs(59), "59s");
        assert_eq!(format_secs(900), "15m00s");
    }
}
