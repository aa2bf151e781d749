//! Triage server: queue-driven analysis dispatch, execution shells for
//! analysis modules and collectors, and storage adapters.

pub mod clock;
pub mod event;
pub mod modules;
pub mod observability;
pub mod queue;
pub mod runner;
pub mod service;
pub mod storage;
pub mod traits;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use event::{InvocationContext, QueueEvent, QueueRecord};
pub use observability::{init_logging, LogFormat};
pub use queue::{MemoryQueue, QueueMessage, MAX_DELAY_SECONDS};
pub use runner::{LocalRunner, RunReport};
pub use service::{
    AnalysisModule, Analyzer, Collected, Collector, CollectorModule, Config, DispatchError, DispatchOutcome,
    Dispatchable, Dispatcher, MethodTable, ModuleEnv, ServiceContext, ServiceRegistry, Step,
};
pub use traits::{Database, KeyValueStore, MessageQueue, ObjectStore, SecretStore};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Value;
    use triage_core::{AnalysisRecord, Catalog, Submission};

    use crate::clock::ManualClock;
    use crate::queue::MemoryQueue;
    use crate::service::{Config, ServiceContext};
    use crate::storage::MemoryDatabase;
    use crate::traits::Database;

    /// In-memory surfaces behind a [`ServiceContext`], with the concrete
    /// handles kept for assertions.
    pub(crate) struct Harness {
        pub ctx: ServiceContext,
        pub queue: Arc<MemoryQueue>,
        pub database: Arc<MemoryDatabase>,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            Self::with_config(Config::default())
        }

        /// Harness whose `Config.modules` is the given JSON object.
        pub(crate) fn with_modules(modules: Value) -> Self {
            let config = Config {
                modules: serde_json::from_value(modules).unwrap(),
                ..Config::default()
            };
            Self::with_config(config)
        }

        pub(crate) fn with_config(config: Config) -> Self {
            let clock = Arc::new(ManualClock::new(start()));
            let queue = Arc::new(MemoryQueue::new(clock.clone()));
            let database = Arc::new(MemoryDatabase::new());
            let ctx = ServiceContext::new(
                config,
                Catalog::with_builtins().unwrap(),
                queue.clone(),
                database.clone(),
                clock.clone(),
            );
            Self {
                ctx,
                queue,
                database,
                clock,
            }
        }

        /// Makes the next `failures` submission submits fail before they
        /// reach [`Harness::database`].
        pub(crate) fn failing_submissions(mut self, failures: usize) -> Self {
            self.ctx.database = Arc::new(FlakyDatabase {
                inner: self.database.clone(),
                failures: AtomicUsize::new(failures),
            });
            self
        }
    }

    struct FlakyDatabase {
        inner: Arc<MemoryDatabase>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Database for FlakyDatabase {
        async fn submit_analysis(&self, record: &AnalysisRecord) -> anyhow::Result<()> {
            self.inner.submit_analysis(record).await
        }

        async fn submit_submission(&self, submission: &Submission) -> anyhow::Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("database unavailable");
            }
            self.inner.submit_submission(submission).await
        }
    }
}
