//! User-facing notices during the unlock flow.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The session expired or the vault is locked; keys were purged.
    SessionExpired { reason: String },
    /// Waiting for the user to unlock, up to `timeout`.
    AwaitingUnlock { timeout: Duration },
    /// Unlock observed; the session was refreshed.
    Unlocked,
    /// An explicit lock completed.
    Locked,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::SessionExpired { reason } => write!(f, "keygate: session locked ({reason})"),
            Notice::AwaitingUnlock { timeout } => write!(
                f,
                "keygate: unlock your vault to continue (waiting up to {}s)",
                timeout.as_secs()
            ),
            Notice::Unlocked => write!(f, "keygate: unlocked"),
            Notice::Locked => write!(f, "keygate: locked, keys purged"),
        }
    }
}

pub trait UnlockPrompt: Send + Sync {
    fn notify(&self, notice: &Notice);

    /// Best-effort: raise the vault application. Failures are ignored.
    fn bring_to_front(&self);
}

/// Writes notices to stderr and optionally runs a focus command.
#[derive(Debug, Clone, Default)]
pub struct TerminalPrompt {
    focus_command: Option<Vec<String>>,
    quiet: bool,
}

impl TerminalPrompt {
    pub fn new(focus_command: Option<Vec<String>>) -> Self {
        Self {
            focus_command: focus_command.filter(|argv| !argv.is_empty()),
            quiet: false,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

impl UnlockPrompt for TerminalPrompt {
    fn notify(&self, notice: &Notice) {
        if self.quiet {
            return;
        }
        let _ = writeln!(std::io::stderr().lock(), "{notice}");
    }

    fn bring_to_front(&self) {
        let Some((program, args)) = self.focus_command.as_ref().and_then(|a| a.split_first())
        else {
            return;
        };
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            // Not waited on: the focus helper may be the vault app itself.
            Ok(child) => debug!(pid = child.id(), "focus command started"),
            Err(e) => debug!(error = %e, program = %program, "focus command failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_render() {
        let text = Notice::AwaitingUnlock {
            timeout: Duration::from_secs(60),
        }
        .to_string();
        assert!(text.contains("60s"));
        assert!(Notice::SessionExpired {
            reason: "ttl elapsed".into()
        }
        .to_string()
        .contains("ttl elapsed"));
    }

    #[test]
    fn empty_focus_command_is_ignored() {
        let prompt = TerminalPrompt::new(Some(vec![]));
        prompt.bring_to_front();
        let missing = TerminalPrompt::new(Some(vec!["/nonexistent/focus".into()]));
        missing.bring_to_front();
    }
}
