//! Memory management.

use std::{sync::Arc, time::Duration};

use basenji_config::GenericConfiguration;
use basenji_error::{generic_error, ErrorContext as _, GenericError};
use bytesize::ByteSize;
use memory_accounting::{BoundedAllocator, LimiterConfig, MemoryLimiter};
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::info;

const fn default_memory_limit_mib() -> u64 {
    0
}

const fn default_memory_limiter_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_memory_limiter_max_waiters() -> usize {
    1000
}

const fn default_encoder_memory_limit() -> ByteSize {
    ByteSize::mib(64)
}

/// Configuration for the request memory limiter and the encoder memory budget.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct MemoryLimiterConfiguration {
    /// Maximum amount of request data, in mebibytes, that can be admitted at once.
    ///
    /// There is no sensible default, so this must be set: the default of zero is rejected when the limiter is
    /// initialized.
    #[serde(default = "default_memory_limit_mib")]
    memory_limit_mib: u64,

    /// Maximum time a request will wait to be admitted before being refused, in milliseconds.
    ///
    /// Defaults to 5000.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_memory_limiter_timeout")]
    memory_limiter_timeout: Duration,

    /// Maximum number of requests that can wait to be admitted at once.
    ///
    /// Requests beyond this are refused immediately rather than queued. Defaults to 1000.
    #[serde(default = "default_memory_limiter_max_waiters")]
    memory_limiter_max_waiters: usize,

    /// Maximum amount of memory the encoder can use for its buffers.
    ///
    /// Either an integer number of bytes, or a string with a unit, such as `64MiB`. Defaults to 64 MiB.
    #[serde(default = "default_encoder_memory_limit")]
    encoder_memory_limit: ByteSize,
}

impl MemoryLimiterConfiguration {
    /// Reads the memory limiter configuration from the given configuration.
    ///
    /// ## Errors
    ///
    /// If an error occurs during deserialization, an error will be returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        config
            .as_typed()
            .error_context("Failed to parse memory limiter configuration.")
    }

    /// Returns the validated limiter configuration.
    ///
    /// ## Errors
    ///
    /// If no memory limit is configured, or the limit is invalid, an error will be returned.
    pub fn limiter_config(&self) -> Result<LimiterConfig, GenericError> {
        let config = LimiterConfig {
            memory_limit_mib: self.memory_limit_mib,
            timeout: self.memory_limiter_timeout,
            max_waiters: self.memory_limiter_max_waiters,
        };

        config
            .validate()
            .error_context("Invalid memory limiter configuration. Set `memory_limit_mib` to a positive value.")?;

        Ok(config)
    }

    /// Returns the encoder memory limit, in bytes.
    pub fn encoder_memory_limit(&self) -> ByteSize {
        self.encoder_memory_limit
    }
}

/// Builds and starts the request memory limiter.
///
/// ## Errors
///
/// If the configuration is invalid, an error will be returned.
pub fn initialize_memory_limiter(config: &MemoryLimiterConfiguration) -> Result<MemoryLimiter, GenericError> {
    let limiter_config = config.limiter_config()?;
    let limiter = MemoryLimiter::new(&limiter_config).error_context("Failed to create memory limiter.")?;
    limiter.start().error_context("Failed to start memory limiter.")?;

    info!(
        "Memory limiter initialized. Admitting up to {} of requests at once, with up to {} requests waiting at most {}ms.",
        ByteSize::b(limiter.gate().bytes_limit()),
        limiter.gate().waiters_limit(),
        limiter.timeout().as_millis(),
    );

    Ok(limiter)
}

/// Builds the bounded allocator used by the encoder.
///
/// ## Errors
///
/// If the encoder memory limit is zero, or does not fit in the address space, an error will be returned.
pub fn initialize_encoder_allocator(config: &MemoryLimiterConfiguration) -> Result<Arc<BoundedAllocator>, GenericError> {
    let limit = config.encoder_memory_limit.as_u64();
    if limit == 0 {
        return Err(generic_error!("Encoder memory limit must be greater than zero."));
    }

    let limit = usize::try_from(limit).error_context("Encoder memory limit is too large for this platform.")?;

    info!("Encoder memory budget set to {}.", config.encoder_memory_limit);

    Ok(Arc::new(BoundedAllocator::heap(limit)))
}
