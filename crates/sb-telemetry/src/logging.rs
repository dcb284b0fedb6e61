use std::io::IsTerminal;

use tracing_subscriber::{fmt, EnvFilter};

/// Output format for diagnostic logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Level used when neither `RUST_LOG` nor the configured level parses.
pub const FALLBACK_LEVEL: &str = "info";

/// Build the filter: `RUST_LOG` wins, then `default_level`, then
/// [`FALLBACK_LEVEL`].
pub fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// Install the global subscriber on stderr.
///
/// Returns `false` when a subscriber was already installed (tests call this
/// repeatedly); the existing one is kept.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) -> bool {
    let filter = build_filter(default_level);
    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Human => builder
            .with_ansi(std::io::stderr().is_terminal())
            .try_init()
            .is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, ?format, "logging initialised");
    }
    installed
}

/// Human-readable logs on stderr.
pub fn init_logging(service_name: &str, default_level: &str) -> bool {
    init(service_name, default_level, LogFormat::Human)
}

/// JSON logs on stderr.
pub fn init_logging_json(service_name: &str, default_level: &str) -> bool {
    init(service_name, default_level, LogFormat::Json)
}
