//! Single-process run of the dispatch loop.
//!
//! [`LocalRunner`] stands in for the hosted pieces: it plays the queue
//! trigger (one record per invocation), fast-forwards a [`ManualClock`] over
//! queue delays, and fans configured analysis modules out onto every new
//! observable that reaches the database.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use triage_core::{AnalysisRecord, Catalog, Observable, ServiceId, Submission};

use crate::clock::ManualClock;
use crate::event::{InvocationContext, QueueEvent, QueueRecord};
use crate::queue::MemoryQueue;
use crate::service::{Config, Dispatcher, ServiceContext, ServiceRegistry};
use crate::storage::MemoryDatabase;
use crate::traits::MessageQueue;

/// Deliveries after which a failing message is dropped.
pub const DEFAULT_MAX_RECEIVES: u32 = 3;

/// What a run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub analyses: Vec<AnalysisRecord>,
    pub submissions: Vec<Submission>,
    /// Records dispatched without error.
    pub dispatched: usize,
    /// Dispatches that returned an error (the message was retried).
    pub failures: usize,
    /// Messages dropped after [`LocalRunner::with_max_receives`] deliveries.
    pub dead_lettered: usize,
}

/// In-process runner over memory backends.
#[derive(Debug)]
pub struct LocalRunner {
    dispatcher: Dispatcher,
    queue: Arc<MemoryQueue>,
    database: Arc<MemoryDatabase>,
    clock: Arc<ManualClock>,
    modules: Vec<ServiceId>,
    max_receives: u32,
    seen: HashSet<(String, String)>,
    analyses_scanned: usize,
    submissions_scanned: usize,
}

impl LocalRunner {
    /// Creates a runner that starts every module in `modules` on each new
    /// observable.
    ///
    /// # Errors
    ///
    /// Returns an error if a module is not registered as a service type.
    pub fn new(
        config: Config,
        registry: ServiceRegistry,
        modules: Vec<ServiceId>,
    ) -> anyhow::Result<Self> {
        if let Some(unknown) = modules.iter().find(|id| !registry.contains(&id.kind)) {
            anyhow::bail!("module `{}` is not registered", unknown.key());
        }

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        let database = Arc::new(MemoryDatabase::new());
        let ctx = ServiceContext::new(
            config,
            Catalog::with_builtins()?,
            queue.clone(),
            database.clone(),
            clock.clone(),
        );
        Ok(Self {
            dispatcher: Dispatcher::new(Arc::new(registry), ctx),
            queue,
            database,
            clock,
            modules,
            max_receives: DEFAULT_MAX_RECEIVES,
            seen: HashSet::new(),
            analyses_scanned: 0,
            submissions_scanned: 0,
        })
    }

    #[must_use]
    pub fn with_max_receives(mut self, max_receives: u32) -> Self {
        self.max_receives = max_receives.max(1);
        self
    }

    /// Rewrites the service context, e.g. to swap the object store or
    /// install extensions. `queue`, `database` and `clock` must be left as
    /// they are: the runner drives them directly.
    #[must_use]
    pub fn map_context(mut self, f: impl FnOnce(ServiceContext) -> ServiceContext) -> Self {
        let ctx = f(self.dispatcher.context().clone());
        self.dispatcher = self.dispatcher.with_context(ctx);
        self
    }

    #[must_use]
    pub fn context(&self) -> &ServiceContext {
        self.dispatcher.context()
    }

    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    fn queue_name(&self) -> &str {
        &self.context().config.queue
    }

    /// Starts every configured module on `observable`. An observable already
    /// seen in this run is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid observable or a queue failure.
    pub async fn seed(&mut self, observable: Observable) -> anyhow::Result<usize> {
        let observable = self.context().catalog.resolve_observable(observable)?;
        if !self
            .seen
            .insert((observable.kind.clone(), observable.value.clone()))
        {
            return Ok(0);
        }

        let now = self.context().now();
        for module in &self.modules {
            let instruction = self.dispatcher.registry().spawn_analysis(
                &module.kind,
                module.instance.as_deref(),
                observable.clone(),
            )?;
            self.dispatcher.context().enqueue(instruction, now).await?;
        }
        tracing::debug!(
            kind = %observable.kind,
            value = %observable.value,
            modules = self.modules.len(),
            "observable seeded"
        );
        Ok(self.modules.len())
    }

    /// Enqueues one `run` of collector `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the collector is not registered or the queue fails.
    pub async fn collect(&self, kind: &str, instance: Option<&str>) -> anyhow::Result<()> {
        let instruction = self.dispatcher.registry().spawn_collector(kind, instance)?;
        let now = self.context().now();
        self.context().enqueue(instruction, now).await?;
        Ok(())
    }

    /// Dispatches until the queue is empty, jumping the clock over delays.
    ///
    /// # Errors
    ///
    /// Returns an error only for queue or seeding failures; dispatch errors
    /// are counted in the report and retried like a hosted queue would.
    pub async fn run_until_idle(&mut self) -> anyhow::Result<RunReport> {
        let queue = self.queue_name().to_string();
        let visibility = self.context().config.visibility_timeout_seconds;
        let mut report = RunReport::default();

        loop {
            let Some(message) = self.queue.receive(&queue, 1, visibility).await?.pop() else {
                match self.queue.next_visible_at(&queue) {
                    Some(at) => {
                        self.clock.advance_to(at);
                        continue;
                    }
                    None => break,
                }
            };

            if message.receive_count > self.max_receives {
                tracing::warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "giving up on message"
                );
                self.queue.remove(&queue, &message.receipt_handle).await?;
                report.dead_lettered += 1;
                continue;
            }

            let event = QueueEvent::single(QueueRecord::from_message(&queue, message));
            match self
                .dispatcher
                .handle(event, &InvocationContext::default())
                .await
            {
                Ok(_) => report.dispatched += 1,
                Err(e) => {
                    tracing::debug!(error = %e, "dispatch failed, message will be redelivered");
                    report.failures += 1;
                }
            }
            self.fan_out().await?;
        }

        report.analyses = self.database.analyses();
        report.submissions = self.database.submissions();
        Ok(report)
    }

    /// Seeds observables of records that reached the database since the
    /// last call.
    async fn fan_out(&mut self) -> anyhow::Result<()> {
        let analyses = self.database.analyses();
        let submissions = self.database.submissions();

        let mut found: Vec<Observable> = Vec::new();
        for record in &analyses[self.analyses_scanned..] {
            found.extend(record.observables.iter().cloned());
        }
        for submission in &submissions[self.submissions_scanned..] {
            found.extend(submission.observables.iter().cloned());
        }
        self.analyses_scanned = analyses.len();
        self.submissions_scanned = submissions.len();

        for observable in found {
            self.seed(observable).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use triage_core::{Analysis, Callback, Fqdn, Ipv4, Status};

    use super::*;
    use crate::service::{Analyzer, ModuleEnv, Step};

    /// Resolves `fqdn` targets to a fixed address after a 20 minute wait.
    #[derive(Default)]
    struct SlowDns;

    #[async_trait]
    impl Analyzer for SlowDns {
        const TYPE: &'static str = "slow_dns";
        type Settings = ();

        async fn should_run(&self, analysis: &Analysis, _env: &ModuleEnv<'_, ()>) -> anyhow::Result<bool> {
            Ok(analysis.target.is::<Fqdn>())
        }

        async fn execute(&self, _analysis: &mut Analysis, _env: &ModuleEnv<'_, ()>) -> anyhow::Result<Step> {
            Ok(Callback::new("answer").after(Duration::from_secs(1200)).into())
        }

        fn continuations(
            table: crate::service::MethodTable<crate::service::AnalysisModule<Self>>,
        ) -> crate::service::MethodTable<crate::service::AnalysisModule<Self>> {
            table.method("answer", |module, _ctx, _inv| {
                Box::pin(async move {
                    let (_, analysis) = module.parts();
                    analysis.add::<Ipv4>("192.0.2.53")?;
                    analysis.add::<Fqdn>("cname.example")?;
                    Ok(Step::Done)
                })
            })
        }
    }

    /// Always fails.
    #[derive(Default)]
    struct Broken;

    #[async_trait]
    impl Analyzer for Broken {
        const TYPE: &'static str = "broken";
        type Settings = ();

        async fn should_run(&self, _analysis: &Analysis, _env: &ModuleEnv<'_, ()>) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn execute(&self, _analysis: &mut Analysis, _env: &ModuleEnv<'_, ()>) -> anyhow::Result<Step> {
            Err(anyhow::anyhow!("backend unavailable"))
        }
    }

    fn runner(modules: &[&str]) -> LocalRunner {
        let mut registry = ServiceRegistry::new();
        registry.register_analyzer::<SlowDns>().unwrap();
        registry.register_analyzer::<Broken>().unwrap();
        let modules = modules
            .iter()
            .map(|kind| ServiceId::new(*kind, None))
            .collect();
        LocalRunner::new(Config::default(), registry, modules).unwrap()
    }

    #[tokio::test]
    async fn long_waits_and_fan_out() {
        let mut runner = runner(&["slow_dns"]);
        let start = runner.context().now();
        runner
            .seed(Observable::new::<Fqdn>("www.example").unwrap())
            .await
            .unwrap();

        let report = runner.run_until_idle().await.unwrap();
        assert!(runner.context().now() - start >= chrono::TimeDelta::seconds(2400));

        let targets: Vec<_> = report
            .analyses
            .iter()
            .map(|r| (r.target.value.as_str(), r.status))
            .collect();
        assert_eq!(
            targets,
            vec![
                ("www.example", Status::Complete),
                ("192.0.2.53", Status::Ignored),
                ("cname.example", Status::Complete),
            ]
        );
        assert_eq!(report.failures, 0);
        assert_eq!(report.dead_lettered, 0);
    }

    #[tokio::test]
    async fn failing_message_is_dead_lettered() {
        let mut runner = runner(&["broken"]).with_max_receives(2);
        runner
            .seed(Observable::new::<Ipv4>("198.51.100.1").unwrap())
            .await
            .unwrap();
        let report = runner.run_until_idle().await.unwrap();
        assert_eq!(report.failures, 2);
        assert_eq!(report.dead_lettered, 1);
        assert!(report.analyses.is_empty());
    }

    #[tokio::test]
    async fn repeated_seed_is_skipped() {
        let mut runner = runner(&["slow_dns", "broken"]);
        let target = Observable::new::<Fqdn>("dup.example").unwrap();
        assert_eq!(runner.seed(target.clone()).await.unwrap(), 2);
        assert_eq!(runner.seed(target).await.unwrap(), 0);
    }

    #[test]
    fn unknown_module_is_rejected() {
        let err = LocalRunner::new(
            Config::default(),
            ServiceRegistry::new(),
            vec![ServiceId::new("whois", None)],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "module `whois` is not registered");
    }

    #[test]
    fn report_serializes() {
        let value = serde_json::to_value(RunReport::default()).unwrap();
        assert_eq!(value["dispatched"], json!(0));
    }
}
