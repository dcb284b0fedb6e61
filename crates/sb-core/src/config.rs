use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::TerminalSize;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Start parameters for one bridge run.
///
/// Built once from the command line and never mutated afterwards; every
/// shell lifetime (including restarts) is spawned from the same values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub size: TerminalSize,
    pub working_dir: PathBuf,
    /// Shell lines injected once per shell lifetime, shortly after boot.
    pub startup_commands: Vec<String>,
}

impl SessionConfig {
    pub fn new(size: TerminalSize, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            size,
            working_dir: working_dir.into(),
            startup_commands: Vec::new(),
        }
    }

    pub fn with_startup_commands(mut self, commands: Vec<String>) -> Self {
        self.startup_commands = commands;
        self
    }

    /// Parse the `--startup-commands` JSON array. Non-string items are
    /// skipped; anything other than an array is an error.
    pub fn parse_startup_commands(json: &str) -> Result<Vec<String>, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let items = value.as_array().ok_or_else(|| {
            ConfigError::Validation("startup commands must be a JSON array".into())
        })?;
        let commands: Vec<String> = items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect();
        if commands.len() != items.len() {
            tracing::warn!(
                skipped = items.len() - commands.len(),
                "ignoring non-string startup commands"
            );
        }
        Ok(commands)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size.rows == 0 || self.size.cols == 0 {
            return Err(ConfigError::Validation(format!(
                "terminal size must be positive, got {}",
                self.size
            )));
        }
        if self.working_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation("working_dir is empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BridgeConfig
// ---------------------------------------------------------------------------

/// Tunables loaded from `~/.shellbridge/config.toml`.
///
/// Every field has a default, so a missing file or a partial file is fine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = BridgeConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: BridgeConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shell.validate()?;
        self.probe.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shellbridge")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Preferred shell binary.
    #[serde(default = "default_shell_program")]
    pub program: String,
    #[serde(default = "default_shell_args")]
    pub args: Vec<String>,
    /// Tried with the same arguments when `program` cannot be launched.
    #[serde(default = "default_shell_fallback")]
    pub fallback: Option<String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell_program(),
            args: default_shell_args(),
            fallback: default_shell_fallback(),
            term: default_term(),
            env: Vec::new(),
        }
    }
}

impl ShellConfig {
    /// Candidate programs in launch order.
    pub fn candidates(&self) -> Vec<&str> {
        let mut out = vec![self.program.as_str()];
        if let Some(fallback) = self.fallback.as_deref() {
            if fallback != self.program {
                out.push(fallback);
            }
        }
        out
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Validation("shell.program is empty".into()));
        }
        Ok(())
    }
}

fn default_shell_program() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/zsh".into())
}
fn default_shell_args() -> Vec<String> {
    vec!["-l".into(), "-i".into()]
}
fn default_shell_fallback() -> Option<String> {
    Some("/bin/bash".into())
}
fn default_term() -> String {
    "xterm-256color".into()
}

/// Loop cadence. All values are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_startup_command_gap_ms")]
    pub startup_command_gap_ms: u64,
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// How long a possible control-sequence prefix is held back waiting for
    /// the rest of it.
    #[serde(default = "default_escape_hold_ms")]
    pub escape_hold_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            startup_delay_ms: default_startup_delay_ms(),
            startup_command_gap_ms: default_startup_command_gap_ms(),
            restart_backoff_ms: default_restart_backoff_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            escape_hold_ms: default_escape_hold_ms(),
        }
    }
}

impl TimingConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
    pub fn startup_command_gap(&self) -> Duration {
        Duration::from_millis(self.startup_command_gap_ms)
    }
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
    pub fn escape_hold(&self) -> Duration {
        Duration::from_millis(self.escape_hold_ms)
    }
}

fn default_poll_timeout_ms() -> u64 {
    1000
}
fn default_startup_delay_ms() -> u64 {
    1000
}
fn default_startup_command_gap_ms() -> u64 {
    100
}
fn default_restart_backoff_ms() -> u64 {
    1000
}
fn default_kill_grace_ms() -> u64 {
    2000
}
fn default_escape_hold_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_force_cooldown_ms")]
    pub force_cooldown_ms: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_foreground_interval_ms")]
    pub foreground_interval_ms: u64,
    #[serde(default = "default_true")]
    pub report_foreground: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_probe_interval_ms(),
            force_cooldown_ms: default_force_cooldown_ms(),
            max_depth: default_max_depth(),
            batch_size: default_batch_size(),
            command_timeout_ms: default_command_timeout_ms(),
            foreground_interval_ms: default_foreground_interval_ms(),
            report_foreground: true,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
    pub fn force_cooldown(&self) -> Duration {
        Duration::from_millis(self.force_cooldown_ms)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn foreground_interval(&self) -> Duration {
        Duration::from_millis(self.foreground_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Validation("probe.max_depth must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("probe.batch_size must be >= 1".into()));
        }
        Ok(())
    }
}

fn default_probe_interval_ms() -> u64 {
    3000
}
fn default_force_cooldown_ms() -> u64 {
    1500
}
fn default_max_depth() -> usize {
    5
}
fn default_batch_size() -> usize {
    50
}
fn default_command_timeout_ms() -> u64 {
    1000
}
fn default_foreground_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Upper bound on automatic restarts; `None` restarts forever.
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
