//! Metrics middleware for dispatched queue records.
//!
//! Wraps each dispatch in a `dispatch` span and reports duration and outcome
//! through the `metrics` facade. Without an installed recorder the metric
//! calls are no-ops.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::event::QueueRecord;
use crate::service::operation::{DispatchError, DispatchOutcome};

/// Dispatch counter, labelled by `outcome`.
pub const DISPATCH_TOTAL: &str = "triage_dispatch_total";

/// Dispatch duration histogram.
pub const DISPATCH_DURATION: &str = "triage_dispatch_duration_seconds";

/// Registers dispatch metric descriptions.
///
/// Call once at start-up after installing a metrics recorder.
pub fn register_metrics() {
    describe_counter!(DISPATCH_TOTAL, "Queue records dispatched, by outcome");
    describe_histogram!(DISPATCH_DURATION, "Duration of one dispatch in seconds");
}

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments dispatches with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records dispatch duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<QueueRecord> for MetricsService<S>
where
    S: Service<QueueRecord, Response = DispatchOutcome, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = DispatchOutcome;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, record: QueueRecord) -> Self::Future {
        let receive_count = record.receive_count();
        let span = info_span!(
            "dispatch",
            message_id = %record.message_id,
            receive_count,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(record);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(outcome) => outcome.as_str(),
                    Err(e) => e.kind(),
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                counter!(DISPATCH_TOTAL, "outcome" => outcome).increment(1);
                histogram!(DISPATCH_DURATION).record(elapsed.as_secs_f64());

                match &result {
                    Ok(_) => tracing::info!(duration_ms, outcome, "dispatch complete"),
                    Err(e) => tracing::warn!(duration_ms, outcome, error = %e, "dispatch failed"),
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;

    /// Immediately-completing service for metrics testing.
    struct ImmediateService {
        fail: bool,
    }

    impl Service<QueueRecord> for ImmediateService {
        type Response = DispatchOutcome;
        type Error = DispatchError;
        type Future =
            Pin<Box<dyn Future<Output = Result<DispatchOutcome, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, record: QueueRecord) -> Self::Future {
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(DispatchError::UnknownMethod {
                        service: "x".into(),
                        method: record.message_id,
                    })
                } else {
                    Ok(DispatchOutcome::Completed)
                }
            })
        }
    }

    fn record() -> QueueRecord {
        serde_json::from_str(r#"{"messageId": "m-1", "receiptHandle": "r-1", "body": "{}"}"#)
            .unwrap()
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let svc = MetricsLayer.layer(ImmediateService { fail: false });
        let outcome = svc.oneshot(record()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_error() {
        register_metrics();
        let svc = MetricsLayer.layer(ImmediateService { fail: true });
        let err = svc.oneshot(record()).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownMethod { method, .. } if method == "m-1"));
    }
}
