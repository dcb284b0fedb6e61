//! shellbridge -- run an interactive shell on a PTY and relay it over
//! stdin/stdout for a host application.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sb_core::config::{BridgeConfig, SessionConfig};
use sb_core::types::TerminalSize;
use sb_session::io::InputChannel;
use sb_session::lifecycle::{install_signal_handlers, LifecycleController};
use sb_session::supervisor::SessionSupervisor;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Bridge a login shell on a pseudo-terminal to stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "shellbridge", version, about)]
struct Cli {
    /// Initial terminal width in columns.
    #[arg(default_value_t = TerminalSize::DEFAULT_COLS, value_parser = clap::value_parser!(u16).range(1..))]
    cols: u16,

    /// Initial terminal height in rows.
    #[arg(default_value_t = TerminalSize::DEFAULT_ROWS, value_parser = clap::value_parser!(u16).range(1..))]
    rows: u16,

    /// Working directory for the shell (defaults to the current directory).
    cwd: Option<PathBuf>,

    /// JSON array of shell lines to run once after each shell starts.
    #[arg(long, value_name = "JSON")]
    startup_commands: Option<String>,

    /// Configuration file (defaults to ~/.shellbridge/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON on stderr.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_error) = match cli.config.as_deref() {
        Some(path) => (
            BridgeConfig::load_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None,
        ),
        None => match BridgeConfig::load() {
            Ok(config) => (config, None),
            Err(e) => (BridgeConfig::default(), Some(e)),
        },
    };

    if cli.log_json || config.logging.json {
        sb_telemetry::logging::init_logging_json("shellbridge", &config.logging.level);
    } else {
        sb_telemetry::logging::init_logging("shellbridge", &config.logging.level);
    }
    if let Some(e) = config_error {
        warn!(error = %e, "failed to load config, using defaults");
    }

    let size = TerminalSize::new(cli.rows, cli.cols)
        .ok_or_else(|| anyhow!("terminal size must be positive"))?;
    let working_dir = match cli.cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let startup_commands = match cli.startup_commands.as_deref() {
        Some(json) => SessionConfig::parse_startup_commands(json)
            .context("invalid --startup-commands")?,
        None => Vec::new(),
    };
    let session = SessionConfig::new(size, working_dir).with_startup_commands(startup_commands);

    info!(
        %size,
        cwd = %session.working_dir.display(),
        startup_commands = session.startup_commands.len(),
        shell = %config.shell.program,
        "shellbridge starting"
    );

    let lifecycle = Arc::new(LifecycleController::new(config.timing.kill_grace()));
    let shutdown = install_signal_handlers(Arc::clone(&lifecycle))
        .context("failed to install signal handlers")?;

    let input = InputChannel::stdin().context("failed to open stdin")?;
    let mut supervisor =
        SessionSupervisor::new(session, config, lifecycle, input, std::io::stdout())
            .context("failed to create session supervisor")?;
    let worker = tokio::task::spawn_blocking(move || supervisor.run());

    tokio::select! {
        signal = shutdown => {
            info!(%signal, "exiting after shutdown signal");
            std::process::exit(0);
        }
        joined = worker => {
            let reason = joined
                .context("supervisor thread panicked")?
                .context("session supervisor failed")?;
            info!(?reason, "shellbridge exiting");
        }
    }

    Ok(())
}
