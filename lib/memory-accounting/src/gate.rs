//! Byte- and waiter-bounded admission control.

use std::{
    collections::VecDeque,
    fmt,
    future::pending,
    num::NonZeroU64,
    sync::{
        atomic::{
            AtomicU64, AtomicUsize,
            Ordering::{Acquire, Release},
        },
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use snafu::Snafu;
use tokio::{
    select,
    sync::oneshot,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// An admission error.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
pub enum AdmissionError {
    /// The request is larger than the gate's byte limit, and so can never be admitted.
    #[snafu(display("Requested {} bytes, which exceeds the limit of {} bytes.", requested, limit))]
    SizeExceedsLimit {
        /// Number of bytes requested.
        requested: u64,

        /// Byte limit of the gate.
        limit: u64,
    },

    /// The request would have to wait, but the maximum number of waiters are already blocked.
    #[snafu(display("Too many waiters: {} callers are already waiting for capacity.", limit))]
    TooManyWaiters {
        /// Waiter limit of the gate.
        limit: usize,
    },

    /// The request would have to wait, but the caller asked not to.
    #[snafu(display("Requested {} bytes, which are not immediately available.", requested))]
    WouldBlock {
        /// Number of bytes requested.
        requested: u64,
    },

    /// The caller canceled the acquisition before it was granted.
    #[snafu(display("Acquisition was canceled before capacity became available."))]
    Canceled,

    /// The caller's deadline passed before the acquisition was granted.
    #[snafu(display("Deadline exceeded while waiting for capacity."))]
    DeadlineExceeded,

    /// More bytes were released than are currently in use.
    ///
    /// This always indicates a bookkeeping bug in the caller.
    #[snafu(display("Attempted to release {} bytes, but only {} bytes are in use.", released, in_use))]
    OverRelease {
        /// Number of bytes the caller attempted to release.
        released: u64,

        /// Number of bytes in use at the time of the release.
        in_use: u64,
    },

    /// The gate has been closed and is no longer admitting requests.
    #[snafu(display("Admission gate is closed."))]
    Closed,

    /// The owning memory limiter has not been started yet.
    #[snafu(display("Memory limiter has not been started."))]
    NotStarted,
}

impl AdmissionError {
    /// Returns a short identifier for the error, suitable for use as a metric tag.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SizeExceedsLimit { .. } => "size_exceeds_limit",
            Self::TooManyWaiters { .. } => "too_many_waiters",
            Self::WouldBlock { .. } => "would_block",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::OverRelease { .. } => "over_release",
            Self::Closed => "closed",
            Self::NotStarted => "not_started",
        }
    }
}

/// Cancellation and deadline state for a blocking acquisition.
///
/// Dropping the future returned by [`AdmissionGate::acquire`] is always enough to cancel it. `AcquireContext` exists
/// for callers that need to distinguish _why_ an acquisition gave up, by way of [`AdmissionError::Canceled`] and
/// [`AdmissionError::DeadlineExceeded`].
#[derive(Clone, Debug, Default)]
pub struct AcquireContext {
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl AcquireContext {
    /// Creates an empty `AcquireContext`, which never cancels and never expires.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation token to observe.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Sets the deadline after which acquisition gives up.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn check(&self) -> Result<(), AdmissionError> {
        if self.cancellation.as_ref().is_some_and(|token| token.is_cancelled()) {
            return Err(AdmissionError::Canceled);
        }

        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            return Err(AdmissionError::DeadlineExceeded);
        }

        Ok(())
    }

    async fn done(&self) -> AdmissionError {
        let canceled = async {
            match &self.cancellation {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };

        let expired = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        select! {
            biased;
            _ = canceled => AdmissionError::Canceled,
            _ = expired => AdmissionError::DeadlineExceeded,
        }
    }
}

struct Waiter {
    id: u64,
    size: u64,
    grant_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    bytes_in_use: u64,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    closed: bool,
}

enum Admission {
    Granted,
    Queued { id: u64, grant_rx: oneshot::Receiver<()> },
}

/// Receives the gate's counters every time they change.
///
/// Called with the gate's lock held, so implementations must be cheap and must not call back into the gate.
pub(crate) trait GateObserver: Send + Sync {
    fn observe(&self, bytes_in_use: u64, waiters_in_use: usize);
}

struct Inner {
    bytes_limit: u64,
    waiters_limit: usize,
    state: Mutex<State>,

    // Mirrors of the locked counters, so that observers never contend with the admission path.
    bytes_in_use: AtomicU64,
    waiters_in_use: AtomicUsize,

    observer: Option<Box<dyn GateObserver>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        self.bytes_in_use.store(state.bytes_in_use, Release);
        self.waiters_in_use.store(state.waiters.len(), Release);
        if let Some(observer) = &self.observer {
            observer.observe(state.bytes_in_use, state.waiters.len());
        }
    }

    fn check_size(&self, size: u64) -> Result<(), AdmissionError> {
        if size > self.bytes_limit {
            return Err(AdmissionError::SizeExceedsLimit {
                requested: size,
                limit: self.bytes_limit,
            });
        }

        Ok(())
    }

    fn grant_now(&self, state: &mut State, size: u64) -> Result<bool, AdmissionError> {
        if state.closed {
            return Err(AdmissionError::Closed);
        }

        // Nobody may jump ahead of a queued waiter, even when there's room for them right now.
        if state.waiters.is_empty() && size <= self.bytes_limit - state.bytes_in_use {
            state.bytes_in_use += size;
            self.publish(state);
            return Ok(true);
        }

        Ok(false)
    }

    fn try_admit(&self, size: u64) -> Result<(), AdmissionError> {
        self.check_size(size)?;

        let mut state = self.lock_state();
        if self.grant_now(&mut state, size)? {
            Ok(())
        } else {
            Err(AdmissionError::WouldBlock { requested: size })
        }
    }

    fn admit(&self, size: u64) -> Result<Admission, AdmissionError> {
        self.check_size(size)?;

        let mut state = self.lock_state();
        if self.grant_now(&mut state, size)? {
            return Ok(Admission::Granted);
        }

        if state.waiters.len() >= self.waiters_limit {
            return Err(AdmissionError::TooManyWaiters {
                limit: self.waiters_limit,
            });
        }

        let id = state.next_waiter_id;
        state.next_waiter_id += 1;

        let (grant_tx, grant_rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id, size, grant_tx });
        self.publish(&state);

        trace!(
            waiter_id = id,
            size,
            waiters = state.waiters.len(),
            "Queued acquisition behind existing usage."
        );

        Ok(Admission::Queued { id, grant_rx })
    }

    fn grant_waiters(&self, state: &mut State) {
        // Strict FIFO: stop at the first waiter that doesn't fit, even if a later one would.
        while let Some(head) = state.waiters.front() {
            if head.size > self.bytes_limit - state.bytes_in_use {
                break;
            }

            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };

            if waiter.grant_tx.send(()).is_ok() {
                state.bytes_in_use += waiter.size;
                trace!(waiter_id = waiter.id, size = waiter.size, "Granted bytes to waiter.");
            }
        }
    }

    fn release(&self, size: u64) -> Result<(), AdmissionError> {
        let mut state = self.lock_state();
        if size > state.bytes_in_use {
            let in_use = state.bytes_in_use;
            error!(
                released = size,
                in_use, "Attempted to release more bytes than are in use. Memory accounting is out of sync."
            );
            return Err(AdmissionError::OverRelease { released: size, in_use });
        }

        state.bytes_in_use -= size;
        self.grant_waiters(&mut state);
        self.publish(&state);

        Ok(())
    }

    fn abandon(&self, id: u64, size: u64, grant_rx: &mut oneshot::Receiver<()>) {
        let mut state = self.lock_state();
        if let Some(idx) = state.waiters.iter().position(|waiter| waiter.id == id) {
            let _ = state.waiters.remove(idx);
            debug!(waiter_id = id, size, "Waiter gave up before being granted.");
        } else if grant_rx.try_recv().is_ok() {
            // The grant raced with the caller giving up, so the bytes are ours to hand back.
            state.bytes_in_use = state.bytes_in_use.saturating_sub(size);
            debug!(waiter_id = id, size, "Waiter gave up after being granted. Returning bytes.");
        }

        // Whether we were at the head of the queue or were holding granted bytes, the waiters behind us may now fit.
        self.grant_waiters(&mut state);
        self.publish(&state);
    }

    fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;

        // Dropping the senders wakes every waiter with a closed error.
        let abandoned = state.waiters.len();
        state.waiters.clear();
        self.publish(&state);

        debug!(abandoned, "Admission gate closed.");
    }
}

/// A blocked caller's place in the wait queue.
///
/// Dropping this before it observes its grant removes it from the queue, or hands the granted bytes back if the grant
/// and the drop raced.
struct PendingAcquisition<'a> {
    inner: &'a Inner,
    id: u64,
    size: u64,
    grant_rx: oneshot::Receiver<()>,
    finished: bool,
}

impl PendingAcquisition<'_> {
    async fn wait(mut self) -> Result<(), AdmissionError> {
        let result = (&mut self.grant_rx).await.map_err(|_| AdmissionError::Closed);
        self.finished = true;
        result
    }
}

impl Drop for PendingAcquisition<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.abandon(self.id, self.size, &mut self.grant_rx);
        }
    }
}

/// A dual-limit admission gate.
///
/// `AdmissionGate` bounds two things at once: the number of bytes that have been admitted but not yet released, and
/// the number of callers that are blocked waiting for bytes to become available. Bounding the waiters matters as much
/// as bounding the bytes: every blocked caller is typically holding onto a request payload that has already been read
/// into memory.
///
/// ## Ordering
///
/// Waiters are granted in strict FIFO order. When bytes are released, the waiter at the head of the queue must fit
/// before any waiter behind it is considered, even if a later, smaller waiter would fit right now. New callers also
/// queue behind existing waiters rather than barging ahead of them. This trades some throughput for deterministic,
/// starvation-free ordering.
///
/// ## Cancellation
///
/// Dropping an in-progress acquisition removes the caller from the wait queue. If bytes were granted to the caller in
/// the window between it giving up and it being removed, those bytes are handed to the next waiter (or returned to
/// the pool) rather than being lost.
///
/// `AdmissionGate` is cheaply cloneable, and all clones share the same state.
#[derive(Clone)]
pub struct AdmissionGate {
    inner: Arc<Inner>,
}

impl AdmissionGate {
    /// Creates a new `AdmissionGate` that admits up to `max_bytes` bytes at a time, with up to `max_waiters` callers
    /// blocked waiting for capacity.
    ///
    /// A `max_waiters` of zero means that callers never block: any request that cannot be admitted immediately fails
    /// with [`AdmissionError::TooManyWaiters`].
    pub fn new(max_bytes: NonZeroU64, max_waiters: usize) -> Self {
        Self::build(max_bytes, max_waiters, None)
    }

    pub(crate) fn with_observer<O>(max_bytes: NonZeroU64, max_waiters: usize, observer: O) -> Self
    where
        O: GateObserver + 'static,
    {
        Self::build(max_bytes, max_waiters, Some(Box::new(observer)))
    }

    fn build(max_bytes: NonZeroU64, max_waiters: usize, observer: Option<Box<dyn GateObserver>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bytes_limit: max_bytes.get(),
                waiters_limit: max_waiters,
                state: Mutex::new(State::default()),
                bytes_in_use: AtomicU64::new(0),
                waiters_in_use: AtomicUsize::new(0),
                observer,
            }),
        }
    }

    /// Returns the maximum number of bytes that can be admitted at once.
    pub fn bytes_limit(&self) -> u64 {
        self.inner.bytes_limit
    }

    /// Returns the maximum number of callers that can be blocked at once.
    pub fn waiters_limit(&self) -> usize {
        self.inner.waiters_limit
    }

    /// Returns the number of bytes currently admitted.
    pub fn bytes_in_use(&self) -> u64 {
        self.inner.bytes_in_use.load(Acquire)
    }

    /// Returns the number of callers currently blocked waiting for capacity.
    pub fn waiters_in_use(&self) -> usize {
        self.inner.waiters_in_use.load(Acquire)
    }

    /// Returns `true` if the gate has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Attempts to acquire `size` bytes without waiting.
    ///
    /// ## Errors
    ///
    /// If `size` exceeds the byte limit, [`AdmissionError::SizeExceedsLimit`] is returned. If the bytes are not
    /// immediately available, or other callers are already waiting, [`AdmissionError::WouldBlock`] is returned. If the
    /// gate is closed, [`AdmissionError::Closed`] is returned.
    pub fn try_acquire(&self, size: u64) -> Result<(), AdmissionError> {
        self.inner.try_admit(size)
    }

    /// Acquires `size` bytes, waiting for them to become available if necessary.
    ///
    /// The returned future can be dropped at any point to abandon the acquisition. Every successful acquisition must
    /// be paired with exactly one [`release`][Self::release] of the same size.
    ///
    /// ## Errors
    ///
    /// If `size` exceeds the byte limit, [`AdmissionError::SizeExceedsLimit`] is returned immediately. If the caller
    /// would have to wait, but the waiter limit has been reached, [`AdmissionError::TooManyWaiters`] is returned
    /// immediately. If the gate is closed, either before or during the wait, [`AdmissionError::Closed`] is returned.
    pub async fn acquire(&self, size: u64) -> Result<(), AdmissionError> {
        let (id, grant_rx) = match self.inner.admit(size)? {
            Admission::Granted => return Ok(()),
            Admission::Queued { id, grant_rx } => (id, grant_rx),
        };

        let pending = PendingAcquisition {
            inner: &self.inner,
            id,
            size,
            grant_rx,
            finished: false,
        };
        pending.wait().await
    }

    /// Acquires `size` bytes, waiting until they become available or `context` is canceled or expires.
    ///
    /// An already-canceled or already-expired context fails without taking any bytes, even if they are available.
    ///
    /// ## Errors
    ///
    /// In addition to the errors returned by [`acquire`][Self::acquire], [`AdmissionError::Canceled`] is returned if
    /// the context's cancellation token fires, and [`AdmissionError::DeadlineExceeded`] is returned if the context's
    /// deadline passes. In both cases, no bytes are consumed.
    pub async fn acquire_with(&self, size: u64, context: &AcquireContext) -> Result<(), AdmissionError> {
        context.check()?;

        select! {
            biased;
            result = self.acquire(size) => result,
            error = context.done() => Err(error),
        }
    }

    /// Acquires `size` bytes, returning a permit that releases them when dropped.
    ///
    /// ## Errors
    ///
    /// See [`acquire`][Self::acquire].
    pub async fn acquire_permit(&self, size: u64) -> Result<AdmissionPermit, AdmissionError> {
        self.acquire(size).await?;
        Ok(AdmissionPermit::new(self.clone(), size))
    }

    /// Acquires `size` bytes under `context`, returning a permit that releases them when dropped.
    ///
    /// ## Errors
    ///
    /// See [`acquire_with`][Self::acquire_with].
    pub async fn acquire_permit_with(
        &self, size: u64, context: &AcquireContext,
    ) -> Result<AdmissionPermit, AdmissionError> {
        self.acquire_with(size, context).await?;
        Ok(AdmissionPermit::new(self.clone(), size))
    }

    /// Releases `size` bytes, waking any waiters that now fit.
    ///
    /// ## Errors
    ///
    /// If `size` is greater than the number of bytes currently in use, [`AdmissionError::OverRelease`] is returned and
    /// the number of bytes in use is left unchanged.
    pub fn release(&self, size: u64) -> Result<(), AdmissionError> {
        self.inner.release(size)
    }

    /// Closes the gate.
    ///
    /// All blocked callers are woken with [`AdmissionError::Closed`], and all subsequent acquisitions fail with the
    /// same error. Releases continue to work so that outstanding acquisitions can drain.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("bytes_limit", &self.bytes_limit())
            .field("bytes_in_use", &self.bytes_in_use())
            .field("waiters_limit", &self.waiters_limit())
            .field("waiters_in_use", &self.waiters_in_use())
            .finish()
    }
}

/// Bytes acquired from an [`AdmissionGate`].
///
/// The bytes are released back to the gate when the permit is dropped.
#[must_use = "dropping a permit immediately releases its bytes"]
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: AdmissionGate,
    size: u64,
}

impl AdmissionPermit {
    pub(crate) fn new(gate: AdmissionGate, size: u64) -> Self {
        Self { gate, size }
    }

    /// Returns the number of bytes held by this permit.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Consumes the permit without releasing its bytes, returning the number of bytes held.
    ///
    /// The caller takes over responsibility for releasing the bytes via [`AdmissionGate::release`].
    pub fn forget(mut self) -> u64 {
        std::mem::take(&mut self.size)
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.size > 0 {
            // Over-releases are already logged loudly by the gate itself.
            let _ = self.gate.release(self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task::spawn};

    use super::*;

    fn gate(max_bytes: u64, max_waiters: usize) -> AdmissionGate {
        AdmissionGate::new(NonZeroU64::new(max_bytes).expect("limit must be non-zero"), max_waiters)
    }

    #[tokio::test]
    async fn immediate_grant_and_release() {
        let gate = gate(100, 1);

        gate.acquire(60).await.expect("should acquire");
        assert_eq!(gate.bytes_in_use(), 60);

        gate.acquire(40).await.expect("should acquire");
        assert_eq!(gate.bytes_in_use(), 100);

        gate.release(100).expect("should release");
        assert_eq!(gate.bytes_in_use(), 0);
        assert_eq!(gate.waiters_in_use(), 0);
    }

    #[test]
    fn size_exceeding_limit_never_blocks() {
        let gate = gate(10, 5);

        let mut acquire = spawn(gate.acquire(11));
        let error = assert_ready_err!(acquire.poll());
        assert_eq!(
            error,
            AdmissionError::SizeExceedsLimit {
                requested: 11,
                limit: 10
            }
        );
        assert_eq!(gate.waiters_in_use(), 0);
        assert_eq!(gate.bytes_in_use(), 0);
    }

    #[test]
    fn waiters_are_bounded() {
        const LIMIT: u64 = 8;
        let gate = gate(LIMIT, 5);

        for _ in 0..LIMIT {
            gate.try_acquire(1).expect("should acquire");
        }

        let mut blocked = (0..5).map(|_| spawn(gate.acquire(1))).collect::<Vec<_>>();
        for waiter in &mut blocked {
            assert_pending!(waiter.poll());
        }
        assert_eq!(gate.waiters_in_use(), 5);

        // The sixth caller that would block is turned away immediately.
        let mut rejected = spawn(gate.acquire(1));
        let error = assert_ready_err!(rejected.poll());
        assert_eq!(error, AdmissionError::TooManyWaiters { limit: 5 });
        assert_eq!(gate.waiters_in_use(), 5);

        // Releasing a single byte lets exactly one waiter through.
        gate.release(1).expect("should release");
        assert!(blocked[0].is_woken());
        assert_ready_ok!(blocked[0].poll());
        for waiter in &mut blocked[1..] {
            assert_pending!(waiter.poll());
        }
        assert_eq!(gate.bytes_in_use(), LIMIT);
        assert_eq!(gate.waiters_in_use(), 4);
    }

    #[test]
    fn zero_waiter_limit_fails_fast() {
        let gate = gate(10, 0);
        gate.try_acquire(10).expect("should acquire");

        let mut acquire = spawn(gate.acquire(1));
        let error = assert_ready_err!(acquire.poll());
        assert_eq!(error, AdmissionError::TooManyWaiters { limit: 0 });
    }

    #[tokio::test]
    async fn already_canceled_context_fails_fast() {
        let gate = gate(10, 5);
        let token = CancellationToken::new();
        token.cancel();
        let context = AcquireContext::new().with_cancellation(token);

        // Even with bytes available, nothing is taken.
        let started = std::time::Instant::now();
        let error = gate.acquire_with(5, &context).await.unwrap_err();
        assert_eq!(error, AdmissionError::Canceled);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(gate.bytes_in_use(), 0);

        gate.try_acquire(10).expect("should acquire");
        let error = gate.acquire_with(5, &context).await.unwrap_err();
        assert_eq!(error, AdmissionError::Canceled);
        assert_eq!(gate.bytes_in_use(), 10);
        assert_eq!(gate.waiters_in_use(), 0);
    }

    #[tokio::test]
    async fn cancellation_removes_waiter() {
        let gate = gate(10, 5);
        gate.try_acquire(10).expect("should acquire");

        let token = CancellationToken::new();
        let context = AcquireContext::new().with_cancellation(token.clone());
        let mut waiting = spawn(gate.acquire_with(4, &context));
        assert_pending!(waiting.poll());
        assert_eq!(gate.waiters_in_use(), 1);

        token.cancel();
        assert!(waiting.is_woken());
        let error = assert_ready_err!(waiting.poll());
        assert_eq!(error, AdmissionError::Canceled);
        assert_eq!(gate.waiters_in_use(), 0);
        assert_eq!(gate.bytes_in_use(), 10);

        // The canceled waiter never receives bytes that are released afterwards.
        gate.release(10).expect("should release");
        assert_eq!(gate.bytes_in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_while_waiting() {
        let gate = gate(10, 5);
        gate.try_acquire(10).expect("should acquire");

        let context = AcquireContext::new().with_timeout(Duration::from_secs(5));
        let error = gate.acquire_with(1, &context).await.unwrap_err();
        assert_eq!(error, AdmissionError::DeadlineExceeded);
        assert_eq!(gate.waiters_in_use(), 0);
        assert_eq!(gate.bytes_in_use(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn grant_before_deadline_succeeds() {
        let gate = gate(10, 5);
        gate.try_acquire(10).expect("should acquire");

        let releaser = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            releaser.release(10).expect("should release");
        });

        let context = AcquireContext::new().with_timeout(Duration::from_secs(5));
        gate.acquire_with(7, &context).await.expect("should acquire before deadline");
        assert_eq!(gate.bytes_in_use(), 7);
    }

    #[test]
    fn over_release_is_rejected() {
        let gate = gate(10, 1);
        gate.try_acquire(4).expect("should acquire");

        let error = gate.release(5).unwrap_err();
        assert_eq!(error, AdmissionError::OverRelease { released: 5, in_use: 4 });
        assert_eq!(gate.bytes_in_use(), 4);

        gate.release(4).expect("should release");
        assert_eq!(gate.bytes_in_use(), 0);
    }

    #[test]
    fn grants_follow_arrival_order() {
        let gate = gate(10, 5);
        gate.try_acquire(10).expect("should acquire");

        let mut large = spawn(gate.acquire(8));
        let mut small = spawn(gate.acquire(2));
        assert_pending!(large.poll());
        assert_pending!(small.poll());

        // Two free bytes would satisfy the small waiter, but the large waiter arrived first.
        gate.release(2).expect("should release");
        assert_pending!(large.poll());
        assert_pending!(small.poll());
        assert_eq!(gate.bytes_in_use(), 8);
        assert_eq!(gate.waiters_in_use(), 2);

        gate.release(8).expect("should release");
        assert_ready_ok!(large.poll());
        assert_ready_ok!(small.poll());
        assert_eq!(gate.bytes_in_use(), 10);
        assert_eq!(gate.waiters_in_use(), 0);
    }

    #[test]
    fn new_arrivals_queue_behind_waiters() {
        let gate = gate(10, 5);
        gate.try_acquire(6).expect("should acquire");

        let mut large = spawn(gate.acquire(8));
        assert_pending!(large.poll());

        // Four bytes are free, but someone is already waiting.
        let mut small = spawn(gate.acquire(3));
        assert_pending!(small.poll());
        assert_eq!(gate.try_acquire(1), Err(AdmissionError::WouldBlock { requested: 1 }));
        assert_eq!(gate.bytes_in_use(), 6);
    }

    #[test]
    fn abandoned_head_waiter_unblocks_followers() {
        let gate = gate(10, 5);
        gate.try_acquire(6).expect("should acquire");

        let mut large = spawn(gate.acquire(8));
        let mut small = spawn(gate.acquire(4));
        assert_pending!(large.poll());
        assert_pending!(small.poll());

        drop(large);
        assert!(small.is_woken());
        assert_ready_ok!(small.poll());
        assert_eq!(gate.bytes_in_use(), 10);
        assert_eq!(gate.waiters_in_use(), 0);
    }

    #[test]
    fn bytes_granted_to_abandoned_waiter_are_handed_on() {
        let gate = gate(10, 5);
        gate.try_acquire(10).expect("should acquire");

        let mut first = spawn(gate.acquire(6));
        let mut second = spawn(gate.acquire(6));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        // The first waiter is granted, but gives up before it ever observes the grant.
        gate.release(10).expect("should release");
        assert_eq!(gate.bytes_in_use(), 6);
        drop(first);

        assert_eq!(gate.bytes_in_use(), 6);
        assert_ready_ok!(second.poll());
        assert_eq!(gate.waiters_in_use(), 0);

        gate.release(6).expect("should release");
        assert_eq!(gate.bytes_in_use(), 0);
    }

    #[test]
    fn close_wakes_waiters() {
        let gate = gate(10, 5);
        gate.try_acquire(10).expect("should acquire");

        let mut waiting = spawn(gate.acquire(1));
        assert_pending!(waiting.poll());

        gate.close();
        assert!(gate.is_closed());
        assert!(waiting.is_woken());
        assert_eq!(assert_ready_err!(waiting.poll()), AdmissionError::Closed);
        assert_eq!(gate.try_acquire(1), Err(AdmissionError::Closed));

        // Outstanding bytes can still drain.
        gate.release(10).expect("should release");
        assert_eq!(gate.bytes_in_use(), 0);
        assert_eq!(gate.waiters_in_use(), 0);
    }

    #[tokio::test]
    async fn permit_releases_on_drop() {
        let gate = gate(10, 1);

        let permit = gate.acquire_permit(7).await.expect("should acquire");
        assert_eq!(permit.size(), 7);
        assert_eq!(gate.bytes_in_use(), 7);
        drop(permit);
        assert_eq!(gate.bytes_in_use(), 0);

        let permit = gate.acquire_permit(3).await.expect("should acquire");
        assert_eq!(permit.forget(), 3);
        assert_eq!(gate.bytes_in_use(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_release_balances() {
        let gate = gate(64, 1024);

        let mut tasks = Vec::new();
        for i in 0..64u64 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                let size = i % 16 + 1;
                for _ in 0..50 {
                    gate.acquire(size).await.expect("should acquire");
                    assert!(gate.bytes_in_use() <= gate.bytes_limit());
                    tokio::task::yield_now().await;
                    gate.release(size).expect("should release");
                }
            }));
        }

        for task in tasks {
            task.await.expect("task should not panic");
        }

        assert_eq!(gate.bytes_in_use(), 0);
        assert_eq!(gate.waiters_in_use(), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Acquire(u64),
        Release(u64),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u64..=150).prop_map(Op::Acquire), (0u64..=150).prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn property_test_bytes_in_use_stays_bounded(ops in prop::collection::vec(arb_op(), 0..64)) {
            let gate = gate(100, 0);
            let mut expected = 0u64;

            for op in ops {
                match op {
                    Op::Acquire(size) => match gate.try_acquire(size) {
                        Ok(()) => expected += size,
                        Err(AdmissionError::SizeExceedsLimit { .. }) => assert!(size > 100),
                        Err(AdmissionError::WouldBlock { .. }) => assert!(expected + size > 100),
                        Err(e) => panic!("unexpected error: {}", e),
                    },
                    Op::Release(size) => match gate.release(size) {
                        Ok(()) => expected -= size,
                        Err(AdmissionError::OverRelease { .. }) => assert!(size > expected),
                        Err(e) => panic!("unexpected error: {}", e),
                    },
                }

                assert_eq!(gate.bytes_in_use(), expected);
                assert!(gate.bytes_in_use() <= gate.bytes_limit());
            }
        }
    }
}
