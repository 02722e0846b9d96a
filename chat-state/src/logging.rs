//! Logging setup for chat state services.
//!
//! # Noise Filtering
//!
//! By default, noisy library modules (redis, tokio_util, mio) are set to
//! `warn` level to reduce log clutter while keeping business logs at the
//! specified level.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::error::ConfigError;

/// Default noisy modules that should be filtered to warn level.
pub const NOISY_MODULES: &[&str] = &["redis", "tokio_util", "mio"];

/// Build the filter directives for `log_level` with noise suppression.
fn build_directives(log_level: &str) -> String {
    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{module}=warn"));
    }
    directives
}

/// Build the default EnvFilter with noise suppression.
///
/// `RUST_LOG` wins when set.
fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(build_directives(log_level)))
}

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, with span and source location
    Json,
    /// Human-readable, coloured lines
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(ConfigError::InvalidValue {
                field: "observability.log_format".to_string(),
                reason: format!("expected \"json\" or \"pretty\", got \"{other}\""),
            }),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Install the global subscriber: `log_level` filtered with noise
/// suppression, written in `format`.
///
/// Calling this more than once keeps the first subscriber.
pub fn init_logging(log_level: &str, format: LogFormat) {
    let json = (format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
    });
    let pretty = (format == LogFormat::Pretty).then(|| tracing_subscriber::fmt::layer().with_ansi(true));

    let installed = tracing_subscriber::registry()
        .with(build_filter(log_level))
        .with(json)
        .with(pretty)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            log_level = %log_level,
            log_format = %format,
            noise_filtered = NOISY_MODULES.len(),
            "Logging initialized"
        );
    }
}

/// Initialize logging from the observability section of the config.
///
/// An unrecognised format falls back to pretty output.
pub fn init_from_config(config: &ObservabilityConfig) {
    init_logging(&config.log_level, config.format().unwrap_or_default());
}
