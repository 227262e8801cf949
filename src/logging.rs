//! Tracing initialisation.
//!
//! The library only emits `tracing` events: `debug!` for every command and
//! reply, `trace!` for reply parsing, `warn!` when a truncating validator
//! corrects a value or the device reports an error. Binaries call [`init`]
//! once to install a subscriber; `RUST_LOG` directives are added on top of
//! the configured level.
//!
//! ```no_run
//! use daq_props::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), String> {
//! logging::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json))?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LogSettings;

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line with colors, for development
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// JSON objects, for log aggregation
    Json,
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level, extended by `RUST_LOG`
    pub level: Level,
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    /// Show the emitting module, e.g. `daq_props::property`
    pub with_target: bool,
    pub with_source_location: bool,
    /// ANSI colors, pretty format only
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_target: true,
            with_source_location: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[log]` section of the application settings.
    pub fn from_settings(settings: &LogSettings) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&settings.level)?).with_format(settings.format))
    }

    /// Output format, compact by default.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine readable.
///
/// Calling it again after a subscriber is installed is a no-op.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_file(config.with_source_location)
        .with_line_number(config.with_source_location)
        .with_span_events(if config.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(config.filter()))
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing: {e}"))
}

/// Parse a level name, case insensitive.
pub(crate) fn parse_log_level(level: &str) -> Result<Level, String> {
    let name = level.trim();
    // `Level` also parses "1".."5"; settings use names only
    match name.parse::<Level>() {
        Ok(parsed) if !name.chars().all(|c| c.is_ascii_digit()) => Ok(parsed),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}
