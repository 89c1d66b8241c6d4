use std::{
    collections::HashMap,
    fmt,
    future::Future,
    num::NonZeroU64,
    sync::{
        atomic::{
            AtomicU8,
            Ordering::{AcqRel, Acquire},
        },
        Arc,
    },
    time::Duration,
};

use metrics::{counter, gauge, Counter, Gauge};
use snafu::{OptionExt as _, Snafu};
use tracing::{debug, info, warn};

use crate::{gate::GateObserver, AcquireContext, AdmissionError, AdmissionGate, AdmissionPermit};

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

const REFUSAL_REASONS: [&str; 6] = [
    "size_exceeds_limit",
    "too_many_waiters",
    "canceled",
    "deadline_exceeded",
    "closed",
    "not_started",
];

/// A memory limiter configuration error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum LimiterConfigError {
    /// The memory limit was zero.
    ///
    /// This is the default, and so it means that no limit was configured at all.
    #[snafu(display("Memory limit must be greater than zero. A limit must be configured explicitly."))]
    ZeroLimit,

    /// The memory limit does not fit in a 64-bit byte count.
    #[snafu(display("Memory limit of {} MiB is too large to be represented in bytes.", memory_limit_mib))]
    LimitTooLarge {
        /// The configured memory limit, in mebibytes.
        memory_limit_mib: u64,
    },
}

/// Memory limiter configuration.
///
/// The default configuration is deliberately invalid, as there is no sensible default memory limit: one must be chosen
/// explicitly before a [`MemoryLimiter`] can be built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LimiterConfig {
    /// Maximum number of mebibytes that can be admitted at once.
    pub memory_limit_mib: u64,

    /// Maximum amount of time to wait for memory to become available before refusing a request.
    pub timeout: Duration,

    /// Maximum number of requests that can be blocked waiting for memory at once.
    pub max_waiters: usize,
}

impl LimiterConfig {
    /// Returns the memory limit, in bytes.
    ///
    /// ## Errors
    ///
    /// If the memory limit is zero, or overflows when converted to bytes, an error is returned.
    pub fn limit_bytes(&self) -> Result<NonZeroU64, LimiterConfigError> {
        let limit_bytes = self
            .memory_limit_mib
            .checked_mul(1 << 20)
            .context(LimitTooLarge {
                memory_limit_mib: self.memory_limit_mib,
            })?;

        NonZeroU64::new(limit_bytes).context(ZeroLimit)
    }

    /// Validates the configuration.
    ///
    /// ## Errors
    ///
    /// See [`limit_bytes`][Self::limit_bytes].
    pub fn validate(&self) -> Result<(), LimiterConfigError> {
        self.limit_bytes().map(|_| ())
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            memory_limit_mib: 0,
            timeout: Duration::from_secs(5),
            max_waiters: 1000,
        }
    }
}

/// Extracts the number of bytes a request should be admitted for.
pub trait RequestSizeFn<R>: Send + Sync {
    /// Returns the admission size of `request`.
    fn request_size(&self, request: &R) -> u64;
}

impl<R, F> RequestSizeFn<R> for F
where
    F: Fn(&R) -> u64 + Send + Sync,
{
    fn request_size(&self, request: &R) -> u64 {
        self(request)
    }
}

struct GateGauges {
    bytes_in_use: Gauge,
    waiters: Gauge,
}

impl GateGauges {
    fn new() -> Self {
        Self {
            bytes_in_use: gauge!("memory_limiter_bytes_in_use"),
            waiters: gauge!("memory_limiter_waiters"),
        }
    }
}

impl GateObserver for GateGauges {
    fn observe(&self, bytes_in_use: u64, waiters_in_use: usize) {
        self.bytes_in_use.set(bytes_in_use as f64);
        self.waiters.set(waiters_in_use as f64);
    }
}

struct Telemetry {
    refused: HashMap<&'static str, Counter>,
}

impl Telemetry {
    fn new() -> Self {
        let refused = REFUSAL_REASONS
            .iter()
            .map(|reason| (*reason, counter!("memory_limiter_refused_total", "reason" => *reason)))
            .collect();

        Self { refused }
    }

    fn refused(&self, error: &AdmissionError) {
        if let Some(counter) = self.refused.get(error.reason()) {
            counter.increment(1);
        }
    }
}

struct Inner {
    gate: AdmissionGate,
    timeout: Duration,
    state: AtomicU8,
    telemetry: Telemetry,
}

/// A memory limiter for inbound requests.
///
/// `MemoryLimiter` admits requests based on their size, using an [`AdmissionGate`] to bound both the total number of
/// bytes admitted and the number of requests waiting to be admitted. Unlike the gate itself, the limiter only ever
/// waits up to a configured timeout: requests that cannot be admitted within the timeout are refused, and it is up to
/// the caller (typically an RPC client, by way of a resource-exhausted status) to retry.
///
/// ## Lifecycle
///
/// A limiter must be [started][Self::start] before it will admit anything, and is [shut down][Self::shutdown] once
/// the pipeline is stopping. Shutting down wakes any waiting requests and refuses them.
///
/// `MemoryLimiter` is cheaply cloneable, and all clones share the same state.
#[derive(Clone)]
pub struct MemoryLimiter {
    inner: Arc<Inner>,
}

impl MemoryLimiter {
    /// Creates a new `MemoryLimiter` from the given configuration.
    ///
    /// ## Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn new(config: &LimiterConfig) -> Result<Self, LimiterConfigError> {
        let limit_bytes = config.limit_bytes()?;

        Ok(Self {
            inner: Arc::new(Inner {
                gate: AdmissionGate::with_observer(limit_bytes, config.max_waiters, GateGauges::new()),
                timeout: config.timeout,
                state: AtomicU8::new(STATE_CREATED),
                telemetry: Telemetry::new(),
            }),
        })
    }

    /// Returns the underlying admission gate.
    pub fn gate(&self) -> &AdmissionGate {
        &self.inner.gate
    }

    /// Returns the maximum amount of time a request will wait to be admitted.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Returns `true` if the limiter has been started and not yet shut down.
    pub fn is_running(&self) -> bool {
        self.inner.state.load(Acquire) == STATE_RUNNING
    }

    /// Starts the limiter.
    ///
    /// Starting an already-running limiter has no effect.
    ///
    /// ## Errors
    ///
    /// If the limiter has already been shut down, [`AdmissionError::Closed`] is returned.
    pub fn start(&self) -> Result<(), AdmissionError> {
        match self
            .inner
            .state
            .compare_exchange(STATE_CREATED, STATE_RUNNING, AcqRel, Acquire)
        {
            Ok(_) => {
                info!(
                    limit_bytes = self.inner.gate.bytes_limit(),
                    max_waiters = self.inner.gate.waiters_limit(),
                    timeout_ms = self.inner.timeout.as_millis() as u64,
                    "Memory limiter started."
                );
                Ok(())
            }
            Err(STATE_RUNNING) => Ok(()),
            Err(_) => Err(AdmissionError::Closed),
        }
    }

    /// Shuts down the limiter.
    ///
    /// Any requests waiting to be admitted are refused, as are all subsequent requests. Bytes for requests that were
    /// already admitted can still be released.
    pub fn shutdown(&self) {
        if self.inner.state.swap(STATE_STOPPED, AcqRel) != STATE_STOPPED {
            self.inner.gate.close();
            info!(
                bytes_in_use = self.inner.gate.bytes_in_use(),
                "Memory limiter shut down."
            );
        }
    }

    fn check_running(&self) -> Result<(), AdmissionError> {
        match self.inner.state.load(Acquire) {
            STATE_RUNNING => Ok(()),
            STATE_CREATED => Err(AdmissionError::NotStarted),
            _ => Err(AdmissionError::Closed),
        }
    }

    fn refuse(&self, size: u64, error: AdmissionError) -> AdmissionError {
        self.inner.telemetry.refused(&error);
        warn!(
            size,
            reason = error.reason(),
            bytes_in_use = self.inner.gate.bytes_in_use(),
            waiters = self.inner.gate.waiters_in_use(),
            "Refusing request due to memory limit: {}",
            error
        );
        error
    }

    /// Acquires `size` bytes, waiting up to the configured timeout for them to become available.
    ///
    /// The bytes are released when the returned permit is dropped.
    ///
    /// ## Errors
    ///
    /// If the limiter is not running, or the bytes could not be acquired within the timeout, an error is returned
    /// describing why the request was refused.
    pub async fn acquire(&self, size: u64) -> Result<AdmissionPermit, AdmissionError> {
        if let Err(e) = self.check_running() {
            return Err(self.refuse(size, e));
        }

        let context = AcquireContext::new().with_timeout(self.inner.timeout);
        match self.inner.gate.acquire_permit_with(size, &context).await {
            Ok(permit) => {
                debug!(size, bytes_in_use = self.inner.gate.bytes_in_use(), "Admitted request.");
                Ok(permit)
            }
            Err(e) => Err(self.refuse(size, e)),
        }
    }

    /// Determines whether a request of `size` bytes must be refused.
    ///
    /// This waits up to the configured timeout for the bytes to become available, rather than failing fast. Returns
    /// `true` if the request must be refused, and `false` if it was admitted. Every `false` must be followed by exactly
    /// one call to [`release_memory`][Self::release_memory] with the same size, regardless of how the request is
    /// ultimately handled.
    pub async fn must_refuse(&self, size: u64) -> bool {
        match self.acquire(size).await {
            Ok(permit) => {
                let _ = permit.forget();
                false
            }
            Err(_) => true,
        }
    }

    /// Releases `size` bytes previously admitted by [`must_refuse`][Self::must_refuse].
    ///
    /// ## Errors
    ///
    /// If more bytes are released than are in use, [`AdmissionError::OverRelease`] is returned.
    pub fn release_memory(&self, size: u64) -> Result<(), AdmissionError> {
        self.inner.gate.release(size)
    }

    /// Runs `work` once `size` bytes have been admitted, releasing them when `work` completes.
    ///
    /// The bytes are released on every exit path: when `work` completes, when it panics, and when the returned future
    /// is dropped.
    ///
    /// ## Errors
    ///
    /// If the bytes could not be admitted, `work` is never polled and an error is returned.
    pub async fn admit<F>(&self, size: u64, work: F) -> Result<F::Output, AdmissionError>
    where
        F: Future,
    {
        let _permit = self.acquire(size).await?;
        Ok(work.await)
    }

    /// Runs `handler` with `request` once the request's size, as measured by `size_fn`, has been admitted.
    ///
    /// ## Errors
    ///
    /// If the request could not be admitted, `handler` is never called and an error is returned.
    pub async fn admit_request<R, S, H, Fut>(
        &self, request: R, size_fn: &S, handler: H,
    ) -> Result<Fut::Output, AdmissionError>
    where
        S: RequestSizeFn<R> + ?Sized,
        H: FnOnce(R) -> Fut,
        Fut: Future,
    {
        let size = size_fn.request_size(&request);
        let _permit = self.acquire(size).await?;
        Ok(handler(request).await)
    }
}

impl fmt::Debug for MemoryLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLimiter")
            .field("gate", &self.inner.gate)
            .field("timeout", &self.inner.timeout)
            .field("running", &self.is_running())
            .finish()
    }
}
