//! Keygate - SSH key and signing gate
//!
//! The `keygate` binary:
//! - `daemon` keeps one live agent endpoint behind the canonical socket
//! - `git` runs the real VCS program once the gate passes
//! - `status`, `lock`, `unlock`, `classify`, `env`, `config` for operators

use clap::{Args, Parser, Subcommand};
use kg_common::error::StructuredError;
use kg_common::{Error, OutputFormat, Result};
use kg_core::agent::supervisor::running_daemon;
use kg_core::agent::{AgentSupervisor, SocketLocator, SupervisorPaths};
use kg_core::config::{CliOverrides, GateConfig};
use kg_core::exit_codes::ExitCode;
use kg_core::gate::{FreshOutcome, Gatekeeper};
use kg_core::intercept::{decide, split_invocation, GitConfig, Interceptor, ProcessDelegate};
use kg_core::logging::{
    event_names, generate_run_id, init_logging, LogConfig, LogContext, LogFormat, LogLevel, Stage,
};
use kg_core::prompt::TerminalPrompt;
use kg_core::session::SessionStore;
use kg_core::status::StatusReport;
use kg_core::vault::{CommandVault, DEFAULT_STATUS_TIMEOUT};
use kg_core::{fsutil, log_event, shutdown};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Keygate - gate SSH keys and commit signing behind a vault unlock
#[derive(Parser)]
#[command(name = "keygate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (default: <config_dir>/keygate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent socket to prefer over the built-in candidates
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "human")]
    format: OutputFormat,

    /// Log format on stderr (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the agent endpoint in the foreground until signalled
    Daemon,

    /// Report endpoint, managed agent, daemon and session state
    Status,

    /// Purge served keys and expire the session now
    Lock,

    /// Wait for the vault to unlock and refresh the session
    Unlock(UnlockArgs),

    /// Run the real VCS program behind the gate
    #[command(disable_help_flag = true)]
    Git(PassthroughArgs),

    /// Print the gate decision for a VCS command line without running it
    Classify(PassthroughArgs),

    /// Print the SSH_AUTH_SOCK export line for the canonical endpoint
    Env,

    /// Print the resolved configuration
    Config,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Daemon => "daemon",
            Commands::Status => "status",
            Commands::Lock => "lock",
            Commands::Unlock(_) => "unlock",
            Commands::Git(_) => "git",
            Commands::Classify(_) => "classify",
            Commands::Env => "env",
            Commands::Config => "config",
        }
    }
}

#[derive(Args, Debug)]
struct UnlockArgs {
    /// Maximum seconds to wait for the unlock
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct PassthroughArgs {
    /// Arguments for the VCS program, global options included
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let daemon = matches!(cli.command, Commands::Daemon);
    init_logging(&log_config(&cli.global, daemon));

    if let Err(e) = shutdown::install() {
        warn!(error = %e, "could not install signal handlers");
    }

    let ctx = LogContext::new(generate_run_id(), cli.command.name());
    log_event!(
        ctx,
        DEBUG,
        event_names::RUN_STARTED,
        Stage::Init,
        "starting",
        version = env!("CARGO_PKG_VERSION")
    );

    let code = match run(&cli, &ctx) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e, cli.global.format);
            ExitCode::from(&e).as_i32()
        }
    };

    log_event!(
        ctx,
        DEBUG,
        event_names::RUN_FINISHED,
        Stage::Init,
        "finished",
        exit_code = code as i64
    );
    std::process::exit(code);
}

/// One-shot commands stay quiet unless asked; the daemon logs lifecycle at
/// info with timestamps.
fn log_config(global: &GlobalOpts, daemon: bool) -> LogConfig {
    let explicit = global.verbose > 0 || global.quiet;
    let env_set = std::env::var_os("KEYGATE_LOG").is_some() || std::env::var_os("RUST_LOG").is_some();
    let level = if explicit {
        Some(LogLevel::from_verbosity(global.verbose, global.quiet))
    } else if daemon || env_set {
        None
    } else {
        Some(LogLevel::Warn)
    };
    LogConfig::from_env(level, global.log_format).with_timestamps(daemon)
}

fn run(cli: &Cli, ctx: &LogContext) -> Result<i32> {
    let global = &cli.global;
    let unlock_timeout_secs = match &cli.command {
        Commands::Unlock(args) => args.timeout,
        _ => None,
    };
    let config = load_config(global, unlock_timeout_secs, ctx)?;

    match &cli.command {
        Commands::Daemon => run_daemon(&config, ctx),
        Commands::Status => run_status(global, &config),
        Commands::Lock => run_lock(global, &config, ctx),
        Commands::Unlock(_) => run_unlock(global, &config, ctx),
        Commands::Git(args) => run_git(global, &config, ctx, &args.args),
        Commands::Classify(args) => run_classify(global, &config, &args.args),
        Commands::Env => run_env(global, &config),
        Commands::Config => run_config(global, &config),
    }
}

fn load_config(global: &GlobalOpts, unlock_timeout_secs: Option<u64>, ctx: &LogContext) -> Result<GateConfig> {
    let overrides = CliOverrides {
        config_path: global.config.clone(),
        socket: global.socket.clone(),
        unlock_timeout_secs,
    };
    match GateConfig::load(&overrides) {
        Ok(config) => {
            log_event!(
                ctx,
                DEBUG,
                event_names::CONFIG_LOADED,
                Stage::Init,
                "configuration resolved",
                source = tracing::field::display(config.config_source),
                runtime_dir = tracing::field::display(config.runtime_dir.display())
            );
            Ok(config)
        }
        Err(e) => {
            log_event!(
                ctx,
                ERROR,
                event_names::CONFIG_ERROR,
                Stage::Init,
                "configuration invalid",
                error = tracing::field::display(&e)
            );
            Err(e.into())
        }
    }
}

fn build_supervisor(config: &GateConfig, ctx: &LogContext) -> Result<AgentSupervisor> {
    fsutil::ensure_private_dir(&config.runtime_dir)?;
    let locator = SocketLocator::new(
        config.socket_override.clone(),
        config.native_sockets.clone(),
        Some(config.managed_socket()),
    )
    .with_probe_timeout(config.probe_timeout());
    let vault = CommandVault::new(
        &config.vault_cli,
        config.vault_status_args.clone(),
        config.vault_agent_args.clone(),
        DEFAULT_STATUS_TIMEOUT,
    );
    Ok(AgentSupervisor::new(
        locator,
        Box::new(vault),
        SupervisorPaths::in_dir(&config.runtime_dir),
        ctx.clone(),
    ))
}

fn session_store(config: &GateConfig) -> SessionStore {
    SessionStore::new(
        config.session_file(),
        config.lock_marker(),
        config.session_ttl(),
    )
}

fn build_gatekeeper(global: &GlobalOpts, config: &GateConfig, ctx: &LogContext) -> Result<Gatekeeper> {
    let supervisor = build_supervisor(config, ctx)?;
    let prompt = TerminalPrompt::new(config.focus_command.clone()).quiet(global.quiet);
    Ok(Gatekeeper::new(
        session_store(config),
        Box::new(supervisor),
        Box::new(prompt),
        config.unlock_timeout(),
        ctx.clone(),
    ))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_error(err: &Error, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", StructuredError::from(err).to_json()),
        OutputFormat::Summary => eprintln!("keygate: {err}"),
        OutputFormat::Human => eprintln!("{}", err.format_human()),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn run_daemon(config: &GateConfig, ctx: &LogContext) -> Result<i32> {
    if let Some(pid) = running_daemon(&config.daemon_pid()) {
        if pid != std::process::id() {
            eprintln!("keygate: daemon already running (pid {pid})");
            return Ok(ExitCode::LockError.as_i32());
        }
    }
    let mut supervisor = build_supervisor(config, ctx)?.with_lock_hold(session_store(config));
    supervisor.run()?;
    if let Some(signal) = shutdown::last_signal() {
        debug!(signal, "daemon stopped by signal");
    }
    Ok(ExitCode::Clean.as_i32())
}

fn run_status(global: &GlobalOpts, config: &GateConfig) -> Result<i32> {
    let report = StatusReport::gather(config);
    let rendered = report.render(global.format)?;
    if global.format == OutputFormat::Human {
        print!("{rendered}");
    } else {
        println!("{rendered}");
    }
    let code = if report.unlocked {
        ExitCode::Clean
    } else {
        ExitCode::Locked
    };
    Ok(code.as_i32())
}

fn run_lock(global: &GlobalOpts, config: &GateConfig, ctx: &LogContext) -> Result<i32> {
    let mut gate = build_gatekeeper(global, config, ctx)?;
    let marker = gate.lock()?;
    if global.format == OutputFormat::Json {
        print_json(&serde_json::json!({
            "locked": true,
            "marker": marker.id,
            "locked_at": marker.locked_at,
        }))?;
    }
    Ok(ExitCode::Clean.as_i32())
}

fn run_unlock(global: &GlobalOpts, config: &GateConfig, ctx: &LogContext) -> Result<i32> {
    let mut gate = build_gatekeeper(global, config, ctx)?;
    let outcome = gate.ensure_fresh(true)?;
    let remaining = gate.store().remaining().map(|d| d.as_secs());
    match global.format {
        OutputFormat::Json => {
            let (kind, waited_ms) = match outcome {
                FreshOutcome::FastPath { .. } => ("fast_path", None),
                FreshOutcome::Unlocked { waited } => ("unlocked", Some(waited.as_millis() as u64)),
            };
            print_json(&serde_json::json!({
                "unlocked": true,
                "outcome": kind,
                "waited_ms": waited_ms,
                "remaining_secs": remaining,
            }))?;
        }
        OutputFormat::Summary | OutputFormat::Human => {
            if let FreshOutcome::FastPath { remaining } = outcome {
                if !global.quiet {
                    println!(
                        "keygate: session already fresh ({}s left)",
                        remaining.as_secs()
                    );
                }
            }
        }
    }
    Ok(ExitCode::Clean.as_i32())
}

fn run_git(global: &GlobalOpts, config: &GateConfig, ctx: &LogContext, args: &[String]) -> Result<i32> {
    let gate = build_gatekeeper(global, config, ctx)?;
    let mut interceptor = Interceptor::new(
        &config.git,
        config.canonical_socket(),
        Box::new(gate),
        Box::new(GitConfig::new(&config.git)),
        Box::new(ProcessDelegate),
        ctx.clone(),
    );
    Ok(interceptor.intercept(args)?.exit_code)
}

fn run_classify(global: &GlobalOpts, config: &GateConfig, args: &[String]) -> Result<i32> {
    let decision = decide(&GitConfig::new(&config.git), args)?;
    let operation = split_invocation(args).name;
    match global.format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "operation": operation,
            "required": decision.required,
            "reason": decision.reason,
        }))?,
        OutputFormat::Summary | OutputFormat::Human => {
            let operation = operation.as_deref().unwrap_or("(none)");
            if decision.required {
                println!("{operation}: gate ({})", decision.reason);
            } else {
                println!("{operation}: no gate");
            }
        }
    }
    Ok(ExitCode::Clean.as_i32())
}

fn run_env(global: &GlobalOpts, config: &GateConfig) -> Result<i32> {
    let socket = config.canonical_socket();
    match global.format {
        OutputFormat::Json => print_json(&serde_json::json!({ "SSH_AUTH_SOCK": socket }))?,
        OutputFormat::Summary | OutputFormat::Human => {
            println!("export SSH_AUTH_SOCK={}", shell_quote(&socket.display().to_string()))
        }
    }
    Ok(ExitCode::Clean.as_i32())
}

fn run_config(global: &GlobalOpts, config: &GateConfig) -> Result<i32> {
    match global.format {
        OutputFormat::Json => print_json(config)?,
        OutputFormat::Summary => println!(
            "config: {} ({})",
            config
                .config_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".into()),
            config.config_source
        ),
        OutputFormat::Human => {
            println!("# keygate config ({})", config.config_source);
            if let Some(file) = &config.config_file {
                println!("file:            {}", file.display());
            }
            println!("canonical:       {}", config.canonical_socket().display());
            if let Some(socket) = &config.socket_override {
                println!("socket override: {}", socket.display());
            }
            for socket in &config.native_sockets {
                println!("native:          {}", socket.display());
            }
            println!("vault cli:       {}", config.vault_cli.display());
            println!("git:             {}", config.git.display());
            println!("unlock timeout:  {}s", config.unlock_timeout_secs);
            println!("session ttl:     {}s", config.session_ttl_secs);
            println!("runtime dir:     {}", config.runtime_dir.display());
            println!("state dir:       {}", config.state_dir.display());
        }
    }
    Ok(ExitCode::Clean.as_i32())
}

fn shell_quote(s: &str) -> String {
    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-+:@%".contains(c));
    if safe && !s.is_empty() {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
