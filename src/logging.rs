//! Structured, async-aware logging setup.
//!
//! Uses the `tracing` and `tracing-subscriber` crates. The `RUST_LOG`
//! environment variable overrides the configured level; the format switches
//! between pretty output for interactive use, compact for services and JSON
//! for log aggregation.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// Pretty-printed with colors (development).
    #[default]
    Pretty,
    /// Compact single-line output (services).
    Compact,
    /// JSON for log aggregation.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Include span ENTER/CLOSE events.
    pub with_span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
        }
    }
}

impl LogConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Initialize the global subscriber.
///
/// Idempotent: a second call returns Ok(()) instead of failing, which makes
/// it safe in tests and library consumers.
pub fn init(config: LogConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events)
                    .with_filter(env_filter),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_span_events(span_events)
                    .with_filter(env_filter),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events)
                    .with_filter(env_filter),
            )
            .try_init(),
    };

    // Already initialized is not an error for us.
    match result {
        Ok(()) => Ok(()),
        Err(_) => Ok(()),
    }
}

/// Parse a level string from configuration ("trace" .. "error").
pub fn parse_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!("invalid log level: {other}")),
    }
}
