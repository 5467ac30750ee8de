//! Error types for Keygate.
//!
//! One taxonomy covers the agent supervisor, the session gatekeeper and the
//! command interceptor. Every variant carries a numeric code that never
//! changes meaning, a category, a hint for scripts deciding whether to try
//! again and a one-line fix for the person at the terminal.
//!
//! # Human-Facing Output
//!
//! ```text
//! ✗ Unlock Timed Out
//!   Reason: timed out waiting for unlock after 60s
//!   Fix: Unlock the vault application, then re-run the command.
//! ```
//!
//! # Agent-Facing Output
//!
//! ```json
//! {
//!   "code": 32,
//!   "category": "session",
//!   "message": "timed out waiting for unlock after 60s",
//!   "recoverable": true,
//!   "suggested_action": "wait",
//!   "context": { "timeout_seconds": 60 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Shorthand used across the keygate crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Which part of the gate an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// No key-serving endpoint could be reached.
    Endpoint,
    /// The vault is present but not serving key material.
    Vault,
    /// Session freshness and unlock flow.
    Session,
    /// Signing configuration problems.
    Signing,
    /// Managed agent process lifecycle.
    Process,
    /// Configuration loading and validation.
    Config,
    /// File I/O and serialization.
    Io,
}

/// What a wrapper script should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Run the same command again.
    Retry,
    /// Unlock the vault and retry.
    Unlock,
    /// Give the vault more time.
    Wait,
    /// Fix configuration before retrying.
    FixConfig,
    /// Stop; nothing to retry.
    Abort,
    /// A person has to look at it.
    ManualIntervention,
}

/// Every failure keygate can report.
#[derive(Error, Debug)]
pub enum Error {
    // Endpoint errors (10-19)
    #[error("no agent endpoint reachable: {0}")]
    EndpointUnreachable(String),

    // Vault errors (20-29)
    #[error("vault is locked: agent at {0} is serving no keys")]
    VaultLocked(String),

    // Session errors (30-39)
    #[error("no fresh session: {0}")]
    NoSession(String),

    #[error("session store error at {path}: {reason}")]
    SessionStoreIo { path: PathBuf, reason: String },

    #[error("timed out waiting for unlock after {seconds}s")]
    UnlockTimeout { seconds: u64 },

    #[error("interrupted by shutdown signal")]
    Interrupted,

    // Signing errors (40-49)
    #[error("signing misconfigured: {0}")]
    SigningMisconfigured(String),

    // Process errors (50-59)
    #[error("managed agent failed to start: {0}")]
    ProcessSpawnFailure(String),

    #[error("failed to run {program}: {source}")]
    Delegation {
        program: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors (60-69)
    #[error("configuration error: {0}")]
    Config(String),

    // I/O errors (70-79)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Numeric code, grouped in tens by category:
    /// - 10-19: Endpoint errors
    /// - 20-29: Vault errors
    /// - 30-39: Session errors
    /// - 40-49: Signing errors
    /// - 50-59: Process errors
    /// - 60-69: Configuration errors
    /// - 70-79: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::EndpointUnreachable(_) => 10,
            Error::VaultLocked(_) => 20,
            Error::NoSession(_) => 30,
            Error::SessionStoreIo { .. } => 31,
            Error::UnlockTimeout { .. } => 32,
            Error::Interrupted => 33,
            Error::SigningMisconfigured(_) => 40,
            Error::ProcessSpawnFailure(_) => 50,
            Error::Delegation { .. } => 51,
            Error::Config(_) => 60,
            Error::Io(_) => 70,
            Error::Json(_) => 71,
        }
    }

    /// Stable symbolic name for logs and JSON output.
    pub fn code_name(&self) -> &'static str {
        match self {
            Error::EndpointUnreachable(_) => "ENDPOINT_UNREACHABLE",
            Error::VaultLocked(_) => "VAULT_LOCKED",
            Error::NoSession(_) => "NO_SESSION",
            Error::SessionStoreIo { .. } => "SESSION_STORE_IO",
            Error::UnlockTimeout { .. } => "UNLOCK_TIMEOUT",
            Error::Interrupted => "INTERRUPTED",
            Error::SigningMisconfigured(_) => "SIGNING_MISCONFIGURED",
            Error::ProcessSpawnFailure(_) => "PROCESS_SPAWN_FAILURE",
            Error::Delegation { .. } => "DELEGATION_FAILED",
            Error::Config(_) => "CONFIG",
            Error::Io(_) => "IO",
            Error::Json(_) => "JSON",
        }
    }

    /// Category the code range belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::EndpointUnreachable(_) => ErrorCategory::Endpoint,
            Error::VaultLocked(_) => ErrorCategory::Vault,
            Error::NoSession(_)
            | Error::SessionStoreIo { .. }
            | Error::UnlockTimeout { .. }
            | Error::Interrupted => ErrorCategory::Session,
            Error::SigningMisconfigured(_) => ErrorCategory::Signing,
            Error::ProcessSpawnFailure(_) | Error::Delegation { .. } => ErrorCategory::Process,
            Error::Config(_) => ErrorCategory::Config,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Whether a later attempt could succeed.
    ///
    /// A misconfigured signer is the one failure an unlock can never fix.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::EndpointUnreachable(_) => true,
            Error::VaultLocked(_) => true,
            Error::NoSession(_) => true,
            Error::SessionStoreIo { .. } => true,
            Error::UnlockTimeout { .. } => true,
            Error::Interrupted => false,
            Error::SigningMisconfigured(_) => false,
            Error::ProcessSpawnFailure(_) => true,
            Error::Delegation { .. } => false,
            Error::Config(_) => false,
            Error::Io(_) => true,
            Error::Json(_) => true,
        }
    }

    /// Next step for scripts.
    pub fn suggested_action(&self) -> SuggestedAction {
        match self {
            Error::EndpointUnreachable(_) => SuggestedAction::Retry,
            Error::VaultLocked(_) => SuggestedAction::Unlock,
            Error::NoSession(_) => SuggestedAction::Unlock,
            Error::SessionStoreIo { .. } => SuggestedAction::Retry,
            Error::UnlockTimeout { .. } => SuggestedAction::Wait,
            Error::Interrupted => SuggestedAction::Abort,
            Error::SigningMisconfigured(_) => SuggestedAction::FixConfig,
            Error::ProcessSpawnFailure(_) => SuggestedAction::Retry,
            Error::Delegation { .. } => SuggestedAction::ManualIntervention,
            Error::Config(_) => SuggestedAction::FixConfig,
            Error::Io(_) => SuggestedAction::Retry,
            Error::Json(_) => SuggestedAction::ManualIntervention,
        }
    }

    /// One-line fix shown under the reason.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::EndpointUnreachable(_) => {
                "Start the vault desktop application or log in with the vault CLI, then retry."
            }
            Error::VaultLocked(_) => "Unlock the vault, or run 'keygate unlock'.",
            Error::NoSession(_) => "Run 'keygate unlock' from an interactive terminal.",
            Error::SessionStoreIo { .. } => {
                "Check permissions on the keygate state directory. The session is treated as expired."
            }
            Error::UnlockTimeout { .. } => {
                "Unlock the vault application, then re-run the command. Raise KEYGATE_UNLOCK_TIMEOUT for more time."
            }
            Error::Interrupted => "The wait was cancelled. Re-run the command when ready.",
            Error::SigningMisconfigured(_) => {
                "Set 'git config gpg.format ssh' and 'git config user.signingkey <key>'. Unlocking will not help."
            }
            Error::ProcessSpawnFailure(_) => {
                "Check that the vault CLI supports serving an SSH agent and that KEYGATE_VAULT_CLI points at it."
            }
            Error::Delegation { .. } => {
                "Check that the real program exists on PATH or set KEYGATE_GIT."
            }
            Error::Config(_) => {
                "Run 'keygate config' to inspect the resolved configuration and fix the offending value."
            }
            Error::Io(_) => "Check disk space and directory permissions, then retry.",
            Error::Json(_) => "A state file is corrupted. It is safe to delete it.",
        }
    }

    /// Title-cased headline for the terminal.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::EndpointUnreachable(_) => "Agent Unreachable",
            Error::VaultLocked(_) => "Vault Locked",
            Error::NoSession(_) => "Session Expired",
            Error::SessionStoreIo { .. } => "Session Store Error",
            Error::UnlockTimeout { .. } => "Unlock Timed Out",
            Error::Interrupted => "Interrupted",
            Error::SigningMisconfigured(_) => "Signing Misconfigured",
            Error::ProcessSpawnFailure(_) => "Agent Failed to Start",
            Error::Delegation { .. } => "Command Failed to Start",
            Error::Config(_) => "Configuration Error",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
        }
    }

    /// Format for a terminal: headline, reason and fix.
    pub fn format_human(&self) -> String {
        format!(
            "✗ {}\n  Reason: {}\n  Fix: {}",
            self.headline(),
            self,
            self.remediation()
        )
    }
}

/// Machine-readable form of an [`Error`], printed with `--format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: u32,
    /// `UNLOCK_TIMEOUT`, `VAULT_LOCKED` and so on.
    pub code_name: String,
    pub category: ErrorCategory,
    /// The `Display` text of the error.
    pub message: String,
    pub recoverable: bool,
    pub suggested_action: SuggestedAction,
    /// Variant fields worth surfacing: socket, path, program or timeout.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::UnlockTimeout { seconds } => {
                context.insert("timeout_seconds".to_string(), serde_json::json!(seconds));
            }
            Error::SessionStoreIo { path, .. } => {
                context.insert("path".to_string(), serde_json::json!(path));
            }
            Error::VaultLocked(path) => {
                context.insert("socket".to_string(), serde_json::json!(path));
            }
            Error::Delegation { program, .. } => {
                context.insert("program".to_string(), serde_json::json!(program));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            code_name: err.code_name().to_string(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            suggested_action: err.suggested_action(),
            context,
        }
    }
}

impl StructuredError {
    /// One-line JSON; falls back to a bare code if serialization fails.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}
