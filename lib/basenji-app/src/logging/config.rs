use basenji_config::GenericConfiguration;
use basenji_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_log_format_json() -> bool {
    false
}

/// Logging configuration.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Log filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to emit logs as JSON rather than in a human-readable format.
    ///
    /// Defaults to `false`.
    #[serde(default = "default_log_format_json")]
    pub log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        config
            .as_typed()
            .error_context("Failed to parse logging configuration.")
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: default_log_format_json(),
        }
    }
}

/// A log level filter.
#[derive(Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(EnvFilter);

impl LogLevel {
    /// Returns the filter for this level.
    pub fn as_env_filter(&self) -> EnvFilter {
        self.0.clone()
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}
