//! Structured event vocabulary for logging.
//!
//! Lifecycle events carry a stable event name (used as the tracing target),
//! the invocation's run id and the stage that emitted them.

use serde::{Deserialize, Serialize};

/// Stages of a keygate invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// Probing candidate agent sockets.
    Locate,
    /// Keeping the canonical endpoint alive.
    Supervise,
    /// Session freshness and unlock flow.
    Gate,
    /// Classifying and delegating intercepted commands.
    Intercept,
    /// Read-only status reporting.
    Report,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Locate => "locate",
            Stage::Supervise => "supervise",
            Stage::Gate => "gate",
            Stage::Intercept => "intercept",
            Stage::Report => "report",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Run lifecycle
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";

    // Supervisor
    pub const SUPERVISOR_STARTED: &str = "supervisor.started";
    pub const SUPERVISOR_LINKED: &str = "supervisor.linked";
    pub const SUPERVISOR_SPAWNED: &str = "supervisor.spawned";
    pub const SUPERVISOR_PROCESS_EXITED: &str = "supervisor.process_exited";
    pub const SUPERVISOR_ENDPOINT_LOST: &str = "supervisor.endpoint_lost";
    pub const SUPERVISOR_FORCE_STOPPED: &str = "supervisor.force_stopped";
    pub const SUPERVISOR_LOCK_HELD: &str = "supervisor.lock_held";
    pub const SUPERVISOR_STOPPED: &str = "supervisor.stopped";

    // Gatekeeper
    pub const GATE_FAST_PATH: &str = "gate.fast_path";
    pub const GATE_SESSION_EXPIRED: &str = "gate.session_expired";
    pub const GATE_UNLOCKED: &str = "gate.unlocked";
    pub const GATE_TIMED_OUT: &str = "gate.timed_out";
    pub const GATE_LOCKED: &str = "gate.locked";

    // Interceptor
    pub const INTERCEPT_GATED: &str = "intercept.gated";
    pub const INTERCEPT_PASSTHROUGH: &str = "intercept.passthrough";
    pub const INTERCEPT_DELEGATED: &str = "intercept.delegated";
    pub const INTERCEPT_ABORTED: &str = "intercept.aborted";

    // Config
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_ERROR: &str = "config.error";
}

/// Correlation context shared by every event of one invocation.
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Unique ID for this invocation.
    pub run_id: String,
    /// Subcommand being run.
    pub command: String,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>, command: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            command: command.into(),
        }
    }
}
