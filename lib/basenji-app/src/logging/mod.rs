//! Logging.

use basenji_error::GenericError;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer, Registry};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

/// Initializes the logging subsystem for `tracing`.
///
/// Events are filtered by `log_level`, and written to standard output either as JSON or in a human-readable format,
/// depending on `log_format_json`.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), GenericError> {
    let format_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.log_format_json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(format_layer.with_filter(config.log_level.as_env_filter()))
        .try_init()?;

    Ok(())
}
