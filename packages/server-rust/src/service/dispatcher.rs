//! Queue-message dispatcher: the single entry point per delivered message.
//!
//! One record is handled as:
//!
//! 1. decode the body into an [`Instruction`];
//! 2. re-enqueue and stop if its `not_before` has not passed;
//! 3. rebuild the target service through the [`ServiceRegistry`];
//! 4. resolve the method in the service's dispatch table (unknown method
//!    fails fast, no local retry);
//! 5. invoke it; errors propagate unchanged;
//! 6. enqueue the continuation, or run the finish hook;
//! 7. delete the message, only after everything above succeeded.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service, ServiceExt};
use tracing::{info_span, Instrument};
use triage_core::Instruction;

use super::middleware::MetricsLayer;
use super::operation::{DispatchError, DispatchOutcome, Step};
use super::registry::{ServiceContext, ServiceRegistry};
use crate::event::{InvocationContext, QueueEvent, QueueRecord};

/// Turns queue records into method invocations.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    ctx: ServiceContext,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, ctx: ServiceContext) -> Self {
        Self { registry, ctx }
    }

    /// Same registry, different context.
    #[must_use]
    pub fn with_context(&self, ctx: ServiceContext) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            ctx,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Platform entry point: `event` must carry exactly one record.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::RecordCount`] for any other batch size, or
    /// the error of dispatching the record. The message is left on the queue
    /// whenever an error is returned.
    pub async fn handle(
        &self,
        event: QueueEvent,
        context: &InvocationContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        let count = event.records.len();
        let [record] = <[QueueRecord; 1]>::try_from(event.records)
            .map_err(|_| DispatchError::RecordCount { count })?;

        MetricsLayer
            .layer(self.clone())
            .oneshot(record)
            .instrument(info_span!("invocation", request_id = %context.request_id))
            .await
    }

    /// Handles one record.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]; the message is not deleted on any error.
    pub async fn dispatch(&self, record: QueueRecord) -> Result<DispatchOutcome, DispatchError> {
        let queue = record
            .queue_name()
            .unwrap_or(&self.ctx.config.queue)
            .to_string();
        let instruction = Instruction::decode(&record.body).map_err(DispatchError::Malformed)?;
        let now = self.ctx.now();

        if let Some(not_before) = instruction.not_before.filter(|at| *at > now) {
            tracing::info!(%not_before, method = %instruction.method, "not due yet, deferring");
            self.ctx
                .enqueue_to(&queue, instruction, not_before)
                .await
                .map_err(DispatchError::External)?;
            self.acknowledge(&queue, &record).await?;
            return Ok(DispatchOutcome::Deferred { not_before });
        }

        let service_type = instruction.service_type().unwrap_or_default().to_string();
        let mut service = self
            .registry
            .construct(&self.ctx.catalog, instruction.service.clone())
            .map_err(|source| DispatchError::Decode {
                service: service_type.clone(),
                source,
            })?;

        if !service.has_method(&instruction.method) {
            return Err(DispatchError::UnknownMethod {
                service: service_type,
                method: instruction.method,
            });
        }

        tracing::debug!(service = %service.id().key(), method = %instruction.method, "invoking");
        let step = service
            .invoke(&self.ctx, &instruction.method, instruction.invocation())
            .await?;

        let outcome = match step {
            Step::Continue(callback) => {
                let resume_at = callback.resume_at(now);
                let method = callback.method.clone();
                let snapshot = service
                    .snapshot()
                    .map_err(|e| DispatchError::Handler(e.into()))?;
                self.ctx
                    .enqueue_to(&queue, Instruction::continuation(snapshot, callback), resume_at)
                    .await
                    .map_err(DispatchError::External)?;
                DispatchOutcome::Continued { method, resume_at }
            }
            Step::Done => {
                service
                    .finish(&self.ctx)
                    .await
                    .map_err(DispatchError::External)?;
                DispatchOutcome::Completed
            }
        };

        self.acknowledge(&queue, &record).await?;
        Ok(outcome)
    }

    async fn acknowledge(&self, queue: &str, record: &QueueRecord) -> Result<(), DispatchError> {
        self.ctx
            .queue
            .remove(queue, &record.receipt_handle)
            .await
            .map_err(DispatchError::External)
    }
}

impl Service<QueueRecord> for Dispatcher {
    type Response = DispatchOutcome;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: QueueRecord) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { dispatcher.dispatch(record).await })
    }
}
