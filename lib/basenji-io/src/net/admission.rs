//! Memory-bounded admission of inbound RPCs.
//!
//! Every inbound request is measured and admitted through a [`MemoryLimiter`] before its handler runs, and the admitted
//! bytes are released once the handler completes, whether it succeeded, failed, or panicked. Requests that cannot be
//! admitted are refused with a `ResourceExhausted` status, which clients treat as retryable, and the handler is never
//! invoked.
//!
//! Unary calls are covered by [`UnaryAdmissionLayer`] (for `tower` stacks whose errors can carry a refusal),
//! [`GrpcAdmissionLayer`] (for wrapping a gRPC server's HTTP routes) and [`admit_unary`] (for use directly inside a
//! generated service implementation). Streaming calls are covered by [`admit_stream`].
//!
//! ## Streaming calls
//!
//! A stream's size isn't known up front, so admission is based on its first message: the message is read, measured,
//! and if admitted, replayed to the handler as the first item of an [`AdmittedStream`]. Subsequent messages are not
//! metered.

use std::{
    error::Error,
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use futures::{future::BoxFuture, Stream, StreamExt as _};
use http_body::Body;
use memory_accounting::{AdmissionError, AdmissionPermit, MemoryLimiter, RequestSizeFn};
use tonic::Status;
use tower::{Layer, Service};
use tracing::debug;

/// A request was refused admission.
#[derive(Debug)]
pub struct RequestRefused {
    size: u64,
    source: AdmissionError,
}

impl RequestRefused {
    /// Creates a new `RequestRefused` for a request of `size` bytes.
    pub fn new(size: u64, source: AdmissionError) -> Self {
        Self { size, source }
    }

    /// Returns the size of the refused request, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the reason the request was refused.
    pub fn reason(&self) -> &AdmissionError {
        &self.source
    }
}

impl fmt::Display for RequestRefused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request of {} bytes refused: {}", self.size, self.source)
    }
}

impl Error for RequestRefused {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

impl From<RequestRefused> for Status {
    fn from(refused: RequestRefused) -> Self {
        Status::resource_exhausted(refused.to_string())
    }
}

/// Returns the size of an HTTP request's body.
///
/// The `Content-Length` header is used when present and valid, and the body's size hint otherwise.
pub fn http_body_size<B: Body>(request: &http::Request<B>) -> u64 {
    request
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| {
            let hint = request.body().size_hint();
            hint.exact().unwrap_or_else(|| hint.lower())
        })
}

/// Returns the encoded size of a gRPC request's message.
pub fn message_size<T: prost::Message>(request: &tonic::Request<T>) -> u64 {
    request.get_ref().encoded_len() as u64
}

/// Admits a unary gRPC request before running `handler` on it.
///
/// ## Errors
///
/// If the request is refused, a `ResourceExhausted` status is returned and `handler` is never called. Otherwise,
/// the result of `handler` is returned as-is.
pub async fn admit_unary<T, R, H, Fut>(
    limiter: &MemoryLimiter, request: tonic::Request<T>, handler: H,
) -> Result<tonic::Response<R>, Status>
where
    T: prost::Message,
    H: FnOnce(tonic::Request<T>) -> Fut,
    Fut: Future<Output = Result<tonic::Response<R>, Status>>,
{
    let size = message_size(&request);
    let _permit = limiter
        .acquire(size)
        .await
        .map_err(|e| RequestRefused::new(size, e))?;

    handler(request).await
}

/// A layer that admits each request through a [`MemoryLimiter`] before passing it to the inner service.
///
/// Requests are measured with a [`RequestSizeFn`], such as [`http_body_size`] or [`message_size`].
pub struct UnaryAdmissionLayer<F> {
    limiter: MemoryLimiter,
    size_fn: Arc<F>,
}

impl<F> UnaryAdmissionLayer<F> {
    /// Creates a new `UnaryAdmissionLayer`.
    pub fn new(limiter: MemoryLimiter, size_fn: F) -> Self {
        Self {
            limiter,
            size_fn: Arc::new(size_fn),
        }
    }
}

impl<F> Clone for UnaryAdmissionLayer<F> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            size_fn: Arc::clone(&self.size_fn),
        }
    }
}

impl<S, F> Layer<S> for UnaryAdmissionLayer<F> {
    type Service = UnaryAdmission<S, F>;

    fn layer(&self, inner: S) -> Self::Service {
        UnaryAdmission {
            inner,
            limiter: self.limiter.clone(),
            size_fn: Arc::clone(&self.size_fn),
        }
    }
}

/// Admits each request through a [`MemoryLimiter`] before passing it to the inner service.
///
/// See [`UnaryAdmissionLayer`] for more information.
pub struct UnaryAdmission<S, F> {
    inner: S,
    limiter: MemoryLimiter,
    size_fn: Arc<F>,
}

impl<S: Clone, F> Clone for UnaryAdmission<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            size_fn: Arc::clone(&self.size_fn),
        }
    }
}

impl<S, F, R> Service<R> for UnaryAdmission<S, F>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: From<RequestRefused> + Send + 'static,
    F: RequestSizeFn<R>,
    R: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        let size = self.size_fn.request_size(&req);
        let limiter = self.limiter.clone();

        // The instance we drove to readiness is the one we have to call, so take it and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let _permit = limiter
                .acquire(size)
                .await
                .map_err(|e| S::Error::from(RequestRefused::new(size, e)))?;

            inner.call(req).await
        })
    }
}

/// A layer that admits gRPC requests at the HTTP level, answering refusals with a gRPC status response.
///
/// Unlike [`UnaryAdmissionLayer`], this places no requirements on the inner service's error type, so it can wrap a
/// tonic server's routes directly. Requests are measured with [`http_body_size`], and a refused request gets a
/// response carrying `grpc-status: 8` (`ResourceExhausted`) instead of reaching the inner service.
#[derive(Clone)]
pub struct GrpcAdmissionLayer {
    limiter: MemoryLimiter,
}

impl GrpcAdmissionLayer {
    /// Creates a new `GrpcAdmissionLayer`.
    pub fn new(limiter: MemoryLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for GrpcAdmissionLayer {
    type Service = GrpcAdmission<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcAdmission {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Admits gRPC requests at the HTTP level.
///
/// See [`GrpcAdmissionLayer`] for more information.
#[derive(Clone)]
pub struct GrpcAdmission<S> {
    inner: S,
    limiter: MemoryLimiter,
}

impl<S, B, ResBody> Service<http::Request<B>> for GrpcAdmission<S>
where
    S: Service<http::Request<B>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Body + Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let size = http_body_size(&req);
        let limiter = self.limiter.clone();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let _permit = match limiter.acquire(size).await {
                Ok(permit) => permit,
                Err(e) => return Ok(Status::from(RequestRefused::new(size, e)).into_http()),
            };

            inner.call(req).await
        })
    }
}

/// Observable state of an [`AdmittedStream`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandoffState {
    /// The first message has not been received yet.
    AwaitingFirstMessage,

    /// The first message has been received and is waiting to be replayed.
    Buffered,

    /// The first message has been replayed, and further messages come straight from the underlying stream.
    Draining,

    /// The underlying stream has ended, or failed before producing its first message.
    Closed,
}

enum Slot<T> {
    AwaitingFirstMessage,
    Buffered(T),
    Draining,
    Closed,
}

/// A stream whose first message was read early for admission purposes.
///
/// The first message is replayed as the first item, so consumers observe the same sequence of items as the underlying
/// stream would have produced.
pub struct AdmittedStream<S, T> {
    inner: S,
    slot: Slot<T>,
}

// `T` is only ever moved in and out of the slot, never pinned.
impl<S: Unpin, T> Unpin for AdmittedStream<S, T> {}

impl<S, T, E> AdmittedStream<S, T>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    fn new(inner: S) -> Self {
        Self {
            inner,
            slot: Slot::AwaitingFirstMessage,
        }
    }

    async fn receive_first(&mut self) -> Result<Option<&T>, E> {
        match self.inner.next().await {
            Some(Ok(message)) => self.slot = Slot::Buffered(message),
            Some(Err(e)) => {
                self.slot = Slot::Closed;
                return Err(e);
            }
            None => self.slot = Slot::Closed,
        }

        match &self.slot {
            Slot::Buffered(message) => Ok(Some(message)),
            _ => Ok(None),
        }
    }
}

impl<S, T> AdmittedStream<S, T> {
    /// Returns the current handoff state.
    pub fn state(&self) -> HandoffState {
        match self.slot {
            Slot::AwaitingFirstMessage => HandoffState::AwaitingFirstMessage,
            Slot::Buffered(_) => HandoffState::Buffered,
            Slot::Draining => HandoffState::Draining,
            Slot::Closed => HandoffState::Closed,
        }
    }

    /// Returns the buffered first message, if it has not been replayed yet.
    pub fn buffered(&self) -> Option<&T> {
        match &self.slot {
            Slot::Buffered(message) => Some(message),
            _ => None,
        }
    }
}

impl<S, T, E> Stream for AdmittedStream<S, T>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.slot, Slot::Draining) {
            Slot::Buffered(message) => Poll::Ready(Some(Ok(message))),
            Slot::Closed => {
                this.slot = Slot::Closed;
                Poll::Ready(None)
            }
            Slot::AwaitingFirstMessage | Slot::Draining => match ready!(this.inner.poll_next_unpin(cx)) {
                Some(item) => Poll::Ready(Some(item)),
                None => {
                    this.slot = Slot::Closed;
                    Poll::Ready(None)
                }
            },
        }
    }
}

/// Admits a streaming gRPC request before running `handler` on it.
///
/// The first message is read from `stream` and measured with `size_fn`, and admission is attempted for that many
/// bytes. A stream that ends before producing any message is admitted for zero bytes. Once admitted, `handler` is
/// called with an [`AdmittedStream`] that replays the first message, and the admitted bytes are held until `handler`
/// completes.
///
/// ## Errors
///
/// If reading the first message fails, that error is returned. If the stream is refused, a `ResourceExhausted` status
/// is returned. In both cases, `handler` is never called.
pub async fn admit_stream<S, T, E, F, H, Fut, R>(
    limiter: &MemoryLimiter, stream: S, size_fn: &F, handler: H,
) -> Result<R, Status>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: Into<Status>,
    F: RequestSizeFn<T> + ?Sized,
    H: FnOnce(AdmittedStream<S, T>) -> Fut,
    Fut: Future<Output = Result<R, Status>>,
{
    let (stream, _permit) = admit_first_message(limiter, stream, size_fn).await?;
    handler(stream).await
}

async fn admit_first_message<S, T, E, F>(
    limiter: &MemoryLimiter, stream: S, size_fn: &F,
) -> Result<(AdmittedStream<S, T>, AdmissionPermit), Status>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: Into<Status>,
    F: RequestSizeFn<T> + ?Sized,
{
    let mut stream = AdmittedStream::new(stream);
    let size = match stream.receive_first().await {
        Ok(Some(message)) => size_fn.request_size(message),
        Ok(None) => 0,
        Err(e) => {
            let status: Status = e.into();
            debug!(error = %status.message(), "Stream failed before its first message was received.");
            return Err(status);
        }
    };

    let permit = limiter
        .acquire(size)
        .await
        .map_err(|e| RequestRefused::new(size, e))?;

    Ok((stream, permit))
}
