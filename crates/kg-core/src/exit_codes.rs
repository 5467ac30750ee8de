//! Exit codes for the keygate CLI.
//!
//! Scripts wrapping `keygate` can branch on the code alone. An intercepted
//! command that passed the gate exits with the real program's status
//! instead, so these codes only appear when keygate itself decided.
//!
//! | Range | Meaning |
//! |-------|---------|
//! | 0-6   | outcome (clean, locked, interrupted) |
//! | 10-19 | the user or environment must act |
//! | 20-29 | keygate failed or waited too long |

use kg_common::Error;

/// Process exit status of a keygate subcommand. Values never change once
/// released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // -- outcomes --
    Clean = 0,

    /// Status reported: no fresh session or no live endpoint
    Locked = 1,

    /// Interrupted by a shutdown signal
    Interrupted = 6,

    // -- user action needed --
    /// Usage error
    ArgsError = 10,

    /// Configuration could not be resolved
    ConfigError = 11,

    /// Signing requested but the signer is misconfigured
    SigningError = 12,

    /// No fresh session and no interactive unlock possible
    SessionError = 13,

    /// Another invocation holds the supervisor lock
    LockError = 14,

    /// No agent endpoint reachable
    EndpointError = 15,

    /// Managed agent failed to start
    SpawnError = 16,

    // -- keygate failures --
    /// The real program could not be started, or a bug
    InternalError = 20,

    /// I/O error
    IoError = 21,

    /// Timed out waiting for unlock
    TimeoutError = 22,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean)
    }

    /// Below 10: not a failure of keygate itself.
    pub fn is_operational(self) -> bool {
        (self as i32) < 10
    }

    /// 10-19.
    pub fn is_user_error(self) -> bool {
        let code = self as i32;
        (10..20).contains(&code)
    }

    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Name used in JSON output and logs.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Locked => "OK_LOCKED",
            ExitCode::Interrupted => "ERR_INTERRUPTED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::SigningError => "ERR_SIGNING",
            ExitCode::SessionError => "ERR_SESSION",
            ExitCode::LockError => "ERR_LOCK",
            ExitCode::EndpointError => "ERR_ENDPOINT",
            ExitCode::SpawnError => "ERR_SPAWN",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
            ExitCode::TimeoutError => "ERR_TIMEOUT",
        }
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::EndpointUnreachable(_) => ExitCode::EndpointError,
            Error::VaultLocked(_) | Error::NoSession(_) => ExitCode::SessionError,
            Error::SessionStoreIo { .. } => ExitCode::IoError,
            Error::UnlockTimeout { .. } => ExitCode::TimeoutError,
            Error::Interrupted => ExitCode::Interrupted,
            Error::SigningMisconfigured(_) => ExitCode::SigningError,
            Error::ProcessSpawnFailure(_) => ExitCode::SpawnError,
            Error::Delegation { .. } => ExitCode::InternalError,
            Error::Config(_) => ExitCode::ConfigError,
            Error::Io(_) | Error::Json(_) => ExitCode::IoError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
