//! Per-method network byte counters.
//!
//! Stats are recorded independently of admission: a request refused by the memory limiter is still counted as
//! received if it passes through [`NetStatsLayer`] first.
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{ready, Context, Poll},
};

use http::{Request, Response};
use http_body::Body;
use metrics::{counter, Counter};
use pin_project_lite::pin_project;
use tower::{Layer, Service};

/// Sizes of a single sent or received RPC.
#[derive(Clone, Copy, Debug)]
pub struct SizesRecord<'a> {
    /// Fully-qualified method name, such as `/package.Service/Method`.
    pub method: &'a str,

    /// Uncompressed size of the payload, in bytes.
    pub length: u64,

    /// Size of the payload on the wire, in bytes, if known.
    pub wire_length: Option<u64>,
}

/// Records network statistics.
pub trait NetStatsReporter: Send + Sync {
    /// Records a sent payload.
    fn count_send(&self, record: &SizesRecord<'_>);

    /// Records a received payload.
    fn count_receive(&self, record: &SizesRecord<'_>);
}

/// A reporter that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNetStats;

impl NetStatsReporter for NoopNetStats {
    fn count_send(&self, _: &SizesRecord<'_>) {}

    fn count_receive(&self, _: &SizesRecord<'_>) {}
}

struct MethodCounters {
    sent: Counter,
    wire_sent: Counter,
    received: Counter,
    wire_received: Counter,
}

impl MethodCounters {
    fn new(method: &str) -> Self {
        let method = method.to_string();
        Self {
            sent: counter!("rpc_bytes_sent_total", "method" => method.clone()),
            wire_sent: counter!("rpc_wire_bytes_sent_total", "method" => method.clone()),
            received: counter!("rpc_bytes_received_total", "method" => method.clone()),
            wire_received: counter!("rpc_wire_bytes_received_total", "method" => method),
        }
    }
}

/// A reporter that emits byte counters through the `metrics` facade.
///
/// ## Metrics
///
/// All metrics are tagged with `method`.
///
/// - `rpc_bytes_sent_total` / `rpc_bytes_received_total`: payload bytes.
/// - `rpc_wire_bytes_sent_total` / `rpc_wire_bytes_received_total`: bytes on the wire. Only incremented when the wire
///   length is known.
///
/// Counters are registered the first time a method is seen, against whichever recorder is installed at that point.
#[derive(Default)]
pub struct MetricsNetStats {
    methods: Mutex<HashMap<String, Arc<MethodCounters>>>,
}

impl MetricsNetStats {
    /// Creates a new `MetricsNetStats`.
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, method: &str) -> Arc<MethodCounters> {
        let mut methods = self.methods.lock().unwrap_or_else(PoisonError::into_inner);
        match methods.get(method) {
            Some(counters) => Arc::clone(counters),
            None => {
                let counters = Arc::new(MethodCounters::new(method));
                methods.insert(method.to_string(), Arc::clone(&counters));
                counters
            }
        }
    }
}

impl NetStatsReporter for MetricsNetStats {
    fn count_send(&self, record: &SizesRecord<'_>) {
        let counters = self.counters(record.method);
        counters.sent.increment(record.length);
        if let Some(wire_length) = record.wire_length {
            counters.wire_sent.increment(wire_length);
        }
    }

    fn count_receive(&self, record: &SizesRecord<'_>) {
        let counters = self.counters(record.method);
        counters.received.increment(record.length);
        if let Some(wire_length) = record.wire_length {
            counters.wire_received.increment(wire_length);
        }
    }
}

/// Records the body sizes of HTTP requests and responses.
///
/// The request path is used as the method name. Body sizes are taken from [`Body::size_hint`], and are only recorded
/// when the hint is exact. Responses are only recorded when the inner service succeeds.
#[derive(Clone)]
pub struct NetStatsLayer {
    reporter: Arc<dyn NetStatsReporter>,
}

impl NetStatsLayer {
    /// Creates a new `NetStatsLayer` that reports to the given reporter.
    pub fn new<R>(reporter: R) -> Self
    where
        R: NetStatsReporter + 'static,
    {
        Self {
            reporter: Arc::new(reporter),
        }
    }

    /// Creates a new `NetStatsLayer` from a shared reporter.
    pub fn from_shared(reporter: Arc<dyn NetStatsReporter>) -> Self {
        Self { reporter }
    }
}

impl<S> Layer<S> for NetStatsLayer {
    type Service = NetStats<S>;

    fn layer(&self, service: S) -> Self::Service {
        NetStats {
            service,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

/// Records the body sizes of HTTP requests and responses.
///
/// See [`NetStatsLayer`] for more information.
#[derive(Clone)]
pub struct NetStats<S> {
    service: S,
    reporter: Arc<dyn NetStatsReporter>,
}

impl<B, B2, S> Service<Request<B>> for NetStats<S>
where
    S: Service<Request<B>, Response = Response<B2>>,
    B: Body,
    B2: Body,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = NetStatsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let method = req.uri().path().to_string();
        if let Some(length) = req.body().size_hint().exact() {
            self.reporter.count_receive(&SizesRecord {
                method: &method,
                length,
                wire_length: None,
            });
        }

        NetStatsFuture {
            reporter: Arc::clone(&self.reporter),
            method,
            fut: self.service.call(req),
        }
    }
}

pin_project! {
    /// Response future from [`NetStats`] services.
    pub struct NetStatsFuture<F> {
        reporter: Arc<dyn NetStatsReporter>,
        method: String,

        #[pin]
        fut: F,
    }
}

impl<F, B, E> Future for NetStatsFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.fut.poll(cx));
        if let Ok(response) = &result {
            if let Some(length) = response.body().size_hint().exact() {
                this.reporter.count_send(&SizesRecord {
                    method: this.method,
                    length,
                    wire_length: None,
                });
            }
        }

        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use metrics::{SharedString, Unit};
    use metrics_util::{
        debugging::{DebugValue, DebuggingRecorder},
        CompositeKey,
    };
    use tower::{service_fn, ServiceExt as _};

    use super::*;

    type MetricEntry = (CompositeKey, Option<Unit>, Option<SharedString>, DebugValue);

    fn get_counter_value(metrics: &[MetricEntry], name: &str, method: &str) -> Option<u64> {
        metrics
            .iter()
            .find(|(k, _, _, _)| {
                k.key().name() == name && k.key().labels().any(|l| l.key() == "method" && l.value() == method)
            })
            .and_then(|(_, _, _, value)| match value {
                DebugValue::Counter(value) => Some(*value),
                _ => None,
            })
    }

    #[test]
    fn counters_are_tracked_per_method() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let stats = MetricsNetStats::new();

        metrics::with_local_recorder(&recorder, || {
            stats.count_receive(&SizesRecord {
                method: "/logs.Service/Export",
                length: 100,
                wire_length: Some(40),
            });
            stats.count_receive(&SizesRecord {
                method: "/logs.Service/Export",
                length: 50,
                wire_length: None,
            });
            stats.count_send(&SizesRecord {
                method: "/traces.Service/Export",
                length: 7,
                wire_length: None,
            });
        });

        let metrics = snapshotter.snapshot().into_vec();
        let logs = "/logs.Service/Export";
        let traces = "/traces.Service/Export";
        assert_eq!(get_counter_value(&metrics, "rpc_bytes_received_total", logs), Some(150));
        assert_eq!(get_counter_value(&metrics, "rpc_wire_bytes_received_total", logs), Some(40));
        assert_eq!(get_counter_value(&metrics, "rpc_bytes_sent_total", traces), Some(7));
        assert_eq!(get_counter_value(&metrics, "rpc_wire_bytes_sent_total", traces).unwrap_or_default(), 0);
        assert_eq!(get_counter_value(&metrics, "rpc_bytes_sent_total", logs).unwrap_or_default(), 0);
    }

    #[derive(Default)]
    struct Captured {
        sent: Mutex<Vec<(String, u64)>>,
        received: Mutex<Vec<(String, u64)>>,
    }

    impl NetStatsReporter for Captured {
        fn count_send(&self, record: &SizesRecord<'_>) {
            self.sent.lock().unwrap().push((record.method.to_string(), record.length));
        }

        fn count_receive(&self, record: &SizesRecord<'_>) {
            self.received
                .lock()
                .unwrap()
                .push((record.method.to_string(), record.length));
        }
    }

    #[tokio::test]
    async fn layer_records_request_and_response_bodies() {
        let captured = Arc::new(Captured::default());
        let layer = NetStatsLayer::from_shared(Arc::clone(&captured) as Arc<dyn NetStatsReporter>);

        let service = layer.layer(service_fn(|req: Request<String>| async move {
            Ok::<_, std::convert::Infallible>(Response::new(req.into_body().repeat(2)))
        }));

        let request = Request::builder()
            .uri("/metrics.Service/Export")
            .body(String::from("hello"))
            .expect("should build request");
        let response = service.oneshot(request).await.expect("should succeed");
        assert_eq!(response.body(), "hellohello");

        assert_eq!(
            *captured.received.lock().unwrap(),
            vec![("/metrics.Service/Export".to_string(), 5)]
        );
        assert_eq!(
            *captured.sent.lock().unwrap(),
            vec![("/metrics.Service/Export".to_string(), 10)]
        );
    }

    #[tokio::test]
    async fn failed_responses_are_not_counted_as_sent() {
        let captured = Arc::new(Captured::default());
        let layer = NetStatsLayer::from_shared(Arc::clone(&captured) as Arc<dyn NetStatsReporter>);

        let service = layer.layer(service_fn(|_: Request<String>| async { Err::<Response<String>, _>("boom") }));

        let request = Request::builder()
            .uri("/metrics.Service/Export")
            .body(String::from("abc"))
            .expect("should build request");
        assert!(service.oneshot(request).await.is_err());

        assert_eq!(captured.received.lock().unwrap().len(), 1);
        assert!(captured.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn noop_reporter_accepts_records() {
        let record = SizesRecord {
            method: "/noop",
            length: 1,
            wire_length: Some(1),
        };
        NoopNetStats.count_send(&record);
        NoopNetStats.count_receive(&record);
    }
}
