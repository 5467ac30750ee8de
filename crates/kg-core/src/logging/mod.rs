//! Structured logging foundation for kg-core.
//!
//! Two output modes, both on stderr:
//! - Human-readable console output for interactive use
//! - JSON lines for the daemon and for automation
//!
//! stdout is reserved for command payloads (`status` JSON, the `env` export
//! line) and for the delegated program's own output.
//!
//! # Usage
//!
//! ```ignore
//! use kg_core::logging::{init_logging, LogConfig, LogContext, Stage, event_names};
//!
//! init_logging(&LogConfig::from_env(None, None));
//! let ctx = LogContext::new(kg_core::logging::generate_run_id(), "git");
//! kg_core::log_event!(ctx, INFO, event_names::RUN_STARTED, Stage::Init, "starting");
//! ```

pub mod config;
pub mod events;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, LogContext, Stage};

use std::io::IsTerminal;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Later calls leave the first one in place.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .with_env_var("KEYGATE_LOG_FILTER")
        .from_env_lossy();

    let result = match config.format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal());
            if config.timestamps {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

/// `run-` plus 12 hex digits, shared by every event of one invocation.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}", &uuid[..12])
}

/// Emit a lifecycle event carrying the run id, command and stage.
///
/// The level is one of `TRACE`, `DEBUG`, `INFO`, `WARN`, `ERROR`. Extra
/// fields are `key = value`; wrap non-primitive values in
/// `tracing::field::display` or `tracing::field::debug`.
///
/// ```ignore
/// log_event!(ctx, INFO, event_names::GATE_UNLOCKED, Stage::Gate, "session refreshed",
///     waited_ms = 1200u64);
/// ```
#[macro_export]
macro_rules! log_event {
    ($ctx:expr, $level:ident, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)* $(,)?) => {
        tracing::event!(
            tracing::Level::$level,
            event = $event,
            run_id = %$ctx.run_id,
            command = %$ctx.command,
            stage = %$stage,
            $($key = $val,)*
            "{}", $msg
        )
    };
}
