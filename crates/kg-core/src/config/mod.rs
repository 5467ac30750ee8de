//! Configuration loading for keygate.
//!
//! Resolution order, highest first: CLI flags → environment → TOML file →
//! built-in defaults. The file is `$KEYGATE_CONFIG`, or
//! `<config_dir>/keygate/config.toml`; a missing file is not an error.

use crate::agent::locator::default_native_sockets;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_CONFIG: &str = "KEYGATE_CONFIG";
const ENV_SOCKET: &str = "KEYGATE_SOCKET";
const ENV_VAULT_CLI: &str = "KEYGATE_VAULT_CLI";
const ENV_UNLOCK_TIMEOUT: &str = "KEYGATE_UNLOCK_TIMEOUT";
const ENV_SESSION_TTL: &str = "KEYGATE_SESSION_TTL";
const ENV_RUNTIME_DIR: &str = "KEYGATE_RUNTIME_DIR";
const ENV_STATE_DIR: &str = "KEYGATE_STATE_DIR";
const ENV_GIT: &str = "KEYGATE_GIT";

const APP_NAME: &str = "keygate";
const CONFIG_FILENAME: &str = "config.toml";

const DEFAULT_UNLOCK_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SESSION_TTL_SECS: u64 = 900;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 500;

/// Upper bound for the unlock timeout and the session TTL: one week.
const MAX_WAIT_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_PROBE_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },

    #[error("no state directory could be determined; set KEYGATE_STATE_DIR")]
    NoStateDir,
}

impl From<ConfigError> for kg_common::Error {
    fn from(err: ConfigError) -> Self {
        kg_common::Error::Config(err.to_string())
    }
}

/// Where the config file came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    CliArgument,
    Environment,
    XdgConfig,
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// On-disk shape. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub socket: Option<PathBuf>,
    pub vault_cli: Option<PathBuf>,
    pub unlock_timeout_secs: Option<u64>,
    pub session_ttl_secs: Option<u64>,
    pub runtime_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub git: Option<PathBuf>,
    pub native_sockets: Option<Vec<PathBuf>>,
    pub vault_status_args: Option<Vec<String>>,
    pub vault_agent_args: Option<Vec<String>>,
    pub focus_command: Option<Vec<String>>,
    pub probe_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    pub unlock_timeout_secs: Option<u64>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateConfig {
    pub socket_override: Option<PathBuf>,
    pub vault_cli: PathBuf,
    pub vault_status_args: Vec<String>,
    pub vault_agent_args: Vec<String>,
    pub native_sockets: Vec<PathBuf>,
    pub focus_command: Option<Vec<String>>,
    pub unlock_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub probe_timeout_ms: u64,
    pub runtime_dir: PathBuf,
    pub state_dir: PathBuf,
    pub git: PathBuf,
    pub config_file: Option<PathBuf>,
    pub config_source: ConfigSource,
}

impl GateConfig {
    /// Resolve from the process environment.
    pub fn load(cli: &CliOverrides) -> Result<Self, ConfigError> {
        Self::resolve(cli, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve<F>(cli: &CliOverrides, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let (config_file, config_source) = locate_file(cli, &env);
        let file = match &config_file {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };

        let unlock_timeout_secs = match cli.unlock_timeout_secs {
            Some(v) => bounded(ENV_UNLOCK_TIMEOUT, v, MAX_WAIT_SECS)?,
            None => pick_secs(
                ENV_UNLOCK_TIMEOUT,
                env(ENV_UNLOCK_TIMEOUT),
                file.unlock_timeout_secs,
                DEFAULT_UNLOCK_TIMEOUT_SECS,
            )?,
        };
        let session_ttl_secs = pick_secs(
            ENV_SESSION_TTL,
            env(ENV_SESSION_TTL),
            file.session_ttl_secs,
            DEFAULT_SESSION_TTL_SECS,
        )?;
        let probe_timeout_ms = bounded(
            "probe_timeout_ms",
            file.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
            MAX_PROBE_TIMEOUT_MS,
        )?;

        let state_dir = match env(ENV_STATE_DIR).map(PathBuf::from).or(file.state_dir) {
            Some(dir) => dir,
            None => dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .map(|base| base.join(APP_NAME))
                .ok_or(ConfigError::NoStateDir)?,
        };
        let runtime_dir = env(ENV_RUNTIME_DIR)
            .map(PathBuf::from)
            .or(file.runtime_dir)
            .or_else(|| env("XDG_RUNTIME_DIR").map(|d| PathBuf::from(d).join(APP_NAME)))
            .unwrap_or_else(|| state_dir.join("run"));

        let native_sockets = match file.native_sockets {
            Some(list) => list,
            None => env("HOME")
                .map(PathBuf::from)
                .or_else(dirs::home_dir)
                .map(|home| default_native_sockets(&home))
                .unwrap_or_default(),
        };

        let vault_agent_args = file
            .vault_agent_args
            .unwrap_or_else(|| vec!["ssh-agent".into(), "--socket".into(), "{socket}".into()]);
        if vault_agent_args.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "vault_agent_args".into(),
                value: "[]".into(),
                reason: "must not be empty",
            });
        }

        Ok(GateConfig {
            socket_override: cli
                .socket
                .clone()
                .or_else(|| env(ENV_SOCKET).map(PathBuf::from))
                .or(file.socket),
            vault_cli: env(ENV_VAULT_CLI)
                .map(PathBuf::from)
                .or(file.vault_cli)
                .unwrap_or_else(|| PathBuf::from("bw")),
            vault_status_args: file
                .vault_status_args
                .unwrap_or_else(|| vec!["status".into()]),
            vault_agent_args,
            native_sockets,
            focus_command: file.focus_command.filter(|argv| !argv.is_empty()),
            unlock_timeout_secs,
            session_ttl_secs,
            probe_timeout_ms,
            runtime_dir,
            state_dir,
            git: env(ENV_GIT)
                .map(PathBuf::from)
                .or(file.git)
                .unwrap_or_else(|| PathBuf::from("git")),
            config_file,
            config_source,
        })
    }

    pub fn unlock_timeout(&self) -> Duration {
        Duration::from_secs(self.unlock_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// The advertised `SSH_AUTH_SOCK` path.
    pub fn canonical_socket(&self) -> PathBuf {
        self.runtime_dir.join("agent.sock")
    }

    pub fn managed_socket(&self) -> PathBuf {
        self.runtime_dir.join("managed.sock")
    }

    pub fn managed_record(&self) -> PathBuf {
        self.runtime_dir.join("managed.json")
    }

    pub fn spawn_lock(&self) -> PathBuf {
        self.runtime_dir.join("supervisor.lock")
    }

    pub fn daemon_pid(&self) -> PathBuf {
        self.runtime_dir.join("daemon.pid")
    }

    pub fn session_file(&self) -> PathBuf {
        self.state_dir.join("session.json")
    }

    pub fn lock_marker(&self) -> PathBuf {
        self.state_dir.join("lock.json")
    }
}

fn locate_file<F>(cli: &CliOverrides, env: &F) -> (Option<PathBuf>, ConfigSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = &cli.config_path {
        return (Some(path.clone()), ConfigSource::CliArgument);
    }
    if let Some(path) = env(ENV_CONFIG) {
        return (Some(PathBuf::from(path)), ConfigSource::Environment);
    }
    let xdg = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .map(|dir| dir.join(APP_NAME).join(CONFIG_FILENAME));
    match xdg {
        Some(path) if path.exists() => (Some(path), ConfigSource::XdgConfig),
        _ => (None, ConfigSource::BuiltinDefault),
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => FileConfig::parse(path, &text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn pick_secs(
    key: &str,
    env_value: Option<String>,
    file_value: Option<u64>,
    default: u64,
) -> Result<u64, ConfigError> {
    let value = match env_value {
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: "expected a whole number of seconds",
        })?,
        None => file_value.unwrap_or(default),
    };
    bounded(key, value, MAX_WAIT_SECS)
}

fn bounded(key: &str, value: u64, max: u64) -> Result<u64, ConfigError> {
    let reason = if value == 0 {
        "must be greater than zero"
    } else if value > max {
        "exceeds the allowed maximum"
    } else {
        return Ok(value);
    };
    Err(ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    })
}
