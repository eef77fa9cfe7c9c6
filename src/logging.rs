//! Tracing infrastructure.
//!
//! Structured logging for every role in the framework, built on `tracing` and
//! `tracing-subscriber`:
//! - pretty, compact or JSON output
//! - `RUST_LOG` overrides the configured level
//! - idempotent initialisation, so tests and embedded peers can call [`init`] freely
//!
//! Peer status messages are forwarded into the same log with [`log_status`],
//! using [`Severity::log_level`] as the threshold mapping.
//!
//! # Example
//! ```no_run
//! use daq_runcontrol::{logging, settings::DaqSettings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = DaqSettings::load()?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!(run = 7, "run started");
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DaqError};
use crate::settings::DaqSettings;
use crate::status::{Severity, Status};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Line layout of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, colored; for an operator terminal.
    Pretty,
    /// One line per record.
    #[default]
    Compact,
    /// One JSON object per record, for log shipping.
    Json,
}

/// How a process logs.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset.
    pub level: Level,
    /// Record layout.
    pub format: LogFormat,
    /// Emit span open and close records (peer and run-loop spans).
    pub spans: bool,
    /// Include file and line.
    pub source_location: bool,
    /// Include the thread name (processor workers are named).
    pub thread_names: bool,
    /// ANSI colors, honoured by [`LogFormat::Pretty`] only.
    pub colors: bool,
}

impl LoggingConfig {
    /// Compact, uncolored records at `level`, with thread names.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: LogFormat::Compact,
            spans: false,
            source_location: false,
            thread_names: true,
            colors: true,
        }
    }

    /// Level taken from `application.log_level`.
    pub fn from_settings(settings: &DaqSettings) -> AppResult<Self> {
        parse_log_level(&settings.application.log_level).map(Self::new)
    }

    /// Use `format`.
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span records.
    pub fn spans(mut self, enabled: bool) -> Self {
        self.spans = enabled;
        self
    }

    /// Toggle ANSI colors.
    pub fn colors(mut self, enabled: bool) -> Self {
        self.colors = enabled;
        self
    }
}

/// Initialise logging from process settings.
pub fn init_from_settings(settings: &DaqSettings) -> AppResult<()> {
    init(LoggingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// A subscriber that is already installed (by an earlier call, a test harness
/// or an embedding application) is kept and `Ok(())` returned.
pub fn init(config: LoggingConfig) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(config.level.as_str().to_ascii_lowercase()),
    };
    let span_records = if config.spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let records = fmt::layer()
        .with_span_events(span_records)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_thread_names(config.thread_names);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => records.pretty().with_ansi(config.colors).with_filter(filter).boxed(),
        LogFormat::Compact => records.compact().with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => records.json().with_filter(filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("has already been set") => {
            tracing::debug!("global subscriber already installed, keeping it");
            Ok(())
        }
        Err(err) => Err(DaqError::Configuration(format!("cannot install log subscriber: {err}"))),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| DaqError::Configuration(format!("unknown log level '{level}'")))
}

/// Forward a peer status message into the log at its severity.
///
/// Statuses at or above `threshold` are logged; `Severity::None` never is.
pub fn log_status(source: &str, status: &Status, threshold: Severity) {
    if status.level() < threshold {
        return;
    }
    let Some(level) = status.level().log_level() else {
        return;
    };
    let state = status.state().name();
    let severity = status.level().name();
    let message = status.message();
    match level {
        Level::ERROR => tracing::error!(source, state, severity, "{message}"),
        Level::WARN => tracing::warn!(source, state, severity, "{message}"),
        Level::INFO => tracing::info!(source, state, severity, "{message}"),
        Level::DEBUG => tracing::debug!(source, state, severity, "{message}"),
        _ => tracing::trace!(source, state, severity, "{message}"),
    }
}
