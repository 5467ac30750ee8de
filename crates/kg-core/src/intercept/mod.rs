//! Command Interceptor.
//!
//! `keygate git <args>` is an explicit front-end for the real VCS program.
//! It classifies the invocation, checks signing configuration when a
//! signature is requested, runs the freshness gate, and only then hands the
//! unmodified arguments to the real program with `SSH_AUTH_SOCK` pointing at
//! the canonical endpoint.

pub mod classify;

pub use classify::{
    classify, split_invocation, GateDecision, GateReason, Invocation, SigningDefaults,
};

use crate::gate::{FreshOutcome, FreshnessGate};
use crate::logging::{event_names, LogContext, Stage};
use kg_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::field::display;
use tracing::{debug, warn};

/// Read access to the VCS program's persisted configuration.
pub trait GitConfigSource {
    /// `git <globals> config --get <key>`. Unset keys are `Ok(None)`.
    fn get(&self, globals: &[String], key: &str) -> Result<Option<String>>;
}

/// Runs `git config` through the real program so `-C`/`-c`/`--git-dir`
/// globals select the same repository and overrides the user asked for.
#[derive(Debug, Clone)]
pub struct GitConfig {
    program: PathBuf,
}

impl GitConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl GitConfigSource for GitConfig {
    fn get(&self, globals: &[String], key: &str) -> Result<Option<String>> {
        let output = Command::new(&self.program)
            .args(globals)
            .args(["config", "--get", key])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| Error::Delegation {
                program: self.program.display().to_string(),
                source,
            })?;
        match output.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            )),
            // 1 is "key not set"; anything else (outside a repository,
            // unreadable config) reads as unset too.
            Some(1) => Ok(None),
            code => {
                debug!(key, code = ?code, "config lookup failed, treating as unset");
                Ok(None)
            }
        }
    }
}

/// Git boolean spelling. A key present with no value is true.
pub fn parse_git_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl SigningDefaults {
    /// Read only the key relevant to `name`; other commands never consult
    /// the configuration.
    pub fn load(source: &dyn GitConfigSource, globals: &[String], name: &str) -> Result<Self> {
        let read = |key: &str| -> Result<bool> {
            Ok(source
                .get(globals, key)?
                .and_then(|v| parse_git_bool(&v))
                .unwrap_or(false))
        };
        Ok(match name {
            "commit" => SigningDefaults {
                commit_gpgsign: read("commit.gpgsign")?,
                tag_gpgsign: false,
            },
            "tag" => SigningDefaults {
                commit_gpgsign: false,
                tag_gpgsign: read("tag.gpgsign")?,
            },
            _ => SigningDefaults::default(),
        })
    }
}

/// Signing must use the agent's key format and name a key.
pub fn check_signing(source: &dyn GitConfigSource, globals: &[String]) -> Result<()> {
    let format = source.get(globals, "gpg.format")?.unwrap_or_default();
    if format.trim() != "ssh" {
        let shown = if format.trim().is_empty() {
            "unset (defaults to openpgp)".to_string()
        } else {
            format!("'{}'", format.trim())
        };
        return Err(Error::SigningMisconfigured(format!(
            "gpg.format is {shown}, expected 'ssh'"
        )));
    }

    let key = source.get(globals, "user.signingkey")?.unwrap_or_default();
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::SigningMisconfigured(
            "user.signingkey is not set".to_string(),
        ));
    }
    if let Some(path) = signing_key_path(key) {
        if !path.exists() {
            return Err(Error::SigningMisconfigured(format!(
                "user.signingkey points at {}, which does not exist",
                path.display()
            )));
        }
    }
    Ok(())
}

/// The file a `user.signingkey` value names, when it names one we can
/// check. Literal keys and relative paths are left to the signer.
fn signing_key_path(value: &str) -> Option<PathBuf> {
    if value.starts_with("key::") || value.starts_with("ssh-") || value.starts_with("ecdsa-") {
        return None;
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return dirs::home_dir().map(|home| home.join(rest));
    }
    let path = Path::new(value);
    path.is_absolute().then(|| path.to_path_buf())
}

/// Hands an invocation to the real program.
pub trait Delegate {
    /// Run `program args` and return its exit code. `socket`, when given,
    /// becomes `SSH_AUTH_SOCK`.
    fn run(&self, program: &Path, args: &[String], socket: Option<&Path>) -> Result<i32>;
}

/// Inherits stdio and waits for the child.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessDelegate;

impl Delegate for ProcessDelegate {
    fn run(&self, program: &Path, args: &[String], socket: Option<&Path>) -> Result<i32> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(socket) = socket {
            cmd.env("SSH_AUTH_SOCK", socket);
        }
        let status = cmd.status().map_err(|source| Error::Delegation {
            program: program.display().to_string(),
            source,
        })?;
        Ok(exit_code_of(status))
    }
}

/// Exit code as a shell would report it: signal deaths are `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Classify a full VCS command line. Reads persisted config only for
/// `commit` and `tag`.
pub fn decide(config: &dyn GitConfigSource, argv: &[String]) -> Result<GateDecision> {
    let inv = split_invocation(argv);
    let Some(name) = inv.name.as_deref() else {
        return Ok(GateDecision::PASS);
    };
    let defaults = SigningDefaults::load(config, &inv.globals, name)?;
    Ok(classify(name, &inv.args, defaults))
}

/// What an interception decided and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interception {
    pub decision: GateDecision,
    pub fresh: Option<FreshOutcome>,
    pub exit_code: i32,
}

pub struct Interceptor {
    program: PathBuf,
    canonical: PathBuf,
    gate: Box<dyn FreshnessGate>,
    config: Box<dyn GitConfigSource>,
    delegate: Box<dyn Delegate>,
    ctx: LogContext,
}

impl Interceptor {
    pub fn new(
        program: impl Into<PathBuf>,
        canonical: impl Into<PathBuf>,
        gate: Box<dyn FreshnessGate>,
        config: Box<dyn GitConfigSource>,
        delegate: Box<dyn Delegate>,
        ctx: LogContext,
    ) -> Self {
        Self {
            program: program.into(),
            canonical: canonical.into(),
            gate,
            config,
            delegate,
            ctx,
        }
    }

    pub fn decide(&self, argv: &[String]) -> Result<GateDecision> {
        decide(self.config.as_ref(), argv)
    }

    /// Gate then delegate. Nothing is delegated when the gate fails.
    pub fn intercept(&mut self, argv: &[String]) -> Result<Interception> {
        let inv = split_invocation(argv);
        let decision = self.decide(argv)?;
        let name = inv.name.as_deref().unwrap_or("");

        if !decision.required {
            crate::log_event!(
                self.ctx,
                DEBUG,
                event_names::INTERCEPT_PASSTHROUGH,
                Stage::Intercept,
                "no gate required",
                operation = name
            );
            // Point at the canonical endpoint only when one is advertised.
            let socket = self
                .canonical
                .symlink_metadata()
                .ok()
                .map(|_| self.canonical.as_path());
            let exit_code = self.delegate.run(&self.program, argv, socket)?;
            return Ok(Interception {
                decision,
                fresh: None,
                exit_code,
            });
        }

        crate::log_event!(
            self.ctx,
            INFO,
            event_names::INTERCEPT_GATED,
            Stage::Intercept,
            "gate required",
            operation = name,
            reason = display(decision.reason)
        );

        let gated = self.pass_gate(&inv, decision.reason);
        let fresh = match gated {
            Ok(fresh) => fresh,
            Err(e) => {
                crate::log_event!(
                    self.ctx,
                    WARN,
                    event_names::INTERCEPT_ABORTED,
                    Stage::Intercept,
                    "gate failed, not delegating",
                    operation = name,
                    code = e.code_name(),
                    error = display(&e)
                );
                return Err(e);
            }
        };

        let exit_code = self
            .delegate
            .run(&self.program, argv, Some(&self.canonical))?;
        crate::log_event!(
            self.ctx,
            INFO,
            event_names::INTERCEPT_DELEGATED,
            Stage::Intercept,
            "delegated",
            operation = name,
            exit_code = exit_code as i64
        );
        if exit_code != 0 {
            warn!(operation = name, exit_code, "delegated program failed");
        }
        Ok(Interception {
            decision,
            fresh: Some(fresh),
            exit_code,
        })
    }

    fn pass_gate(&mut self, inv: &Invocation, reason: GateReason) -> Result<FreshOutcome> {
        // Unlocking cannot fix a misconfiguration; check first.
        if reason.is_signing() {
            check_signing(self.config.as_ref(), &inv.globals)?;
        }
        self.gate.ensure_fresh(true)
    }
}
