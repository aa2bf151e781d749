//! Analysis execution shell.
//!
//! An [`Analyzer`] supplies the module logic: whether to run on a target and
//! what to do. [`AnalysisModule`] wraps it as a dispatchable service that
//! carries the [`Analysis`] through every hop:
//!
//! ```text
//! run ──should_run == false──▶ ignored ──▶ submit
//!  │
//!  └──▶ execute ──Step::Continue──▶ (re-enqueued) ──▶ continuation ──▶ …
//!          │
//!          └──Step::Done──▶ complete ──▶ submit
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use triage_core::{Analysis, Catalog, Fields, Invocation, Observable, ServiceId, Status};

use super::operation::Step;
use super::registry::{Dispatchable, MethodTable, ServiceContext};
use crate::storage::ScopedState;

/// Module identity, settings, and shared surfaces handed to module logic.
pub struct ModuleEnv<'a, T> {
    pub id: ServiceId,
    pub settings: T,
    pub ctx: &'a ServiceContext,
}

impl<'a, T: DeserializeOwned + Default> ModuleEnv<'a, T> {
    /// Loads the settings configured for `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if configured settings do not decode as `T`.
    pub fn load(ctx: &'a ServiceContext, id: ServiceId) -> anyhow::Result<Self> {
        let settings = ctx.settings(&id)?;
        Ok(Self { id, settings, ctx })
    }
}

impl<T> ModuleEnv<'_, T> {
    /// Persisted state of this module (watermarks, cursors).
    #[must_use]
    pub fn state(&self) -> ScopedState {
        self.ctx.state(&self.id)
    }
}

/// Logic of one analysis module.
///
/// Implementations hold no per-analysis data: everything that must survive a
/// hop goes into [`Analysis::state`].
#[async_trait]
pub trait Analyzer: Default + Send + Sync + 'static {
    /// Service type, unique among registered services.
    const TYPE: &'static str;

    /// Settings read from `Config.modules`.
    type Settings: DeserializeOwned + Default + Send + Sync;

    /// Whether this module applies to the analysis target.
    async fn should_run(
        &self,
        analysis: &Analysis,
        env: &ModuleEnv<'_, Self::Settings>,
    ) -> anyhow::Result<bool>;

    /// First hop of the work.
    async fn execute(
        &self,
        analysis: &mut Analysis,
        env: &ModuleEnv<'_, Self::Settings>,
    ) -> anyhow::Result<Step>;

    /// Adds continuation methods to the module's table.
    fn continuations(table: MethodTable<AnalysisModule<Self>>) -> MethodTable<AnalysisModule<Self>> {
        table
    }
}

/// Dispatchable wrapper carrying one analysis between hops.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = "A: Default"))]
pub struct AnalysisModule<A> {
    #[serde(default)]
    pub instance: Option<String>,
    pub analysis: Analysis,
    #[serde(skip)]
    analyzer: A,
}

/// Snapshot of a fresh analysis of `target` for module `kind`.
pub(crate) fn analysis_snapshot(
    kind: &str,
    instance: Option<&str>,
    target: Observable,
) -> triage_core::Result<Fields> {
    let mut fields = Fields::new();
    fields.insert("type".to_string(), Value::from(kind));
    fields.insert(
        "instance".to_string(),
        instance.map_or(Value::Null, Value::from),
    );
    fields.insert(
        "analysis".to_string(),
        serde_json::to_value(Analysis::new(target))?,
    );
    Ok(fields)
}

impl<A: Analyzer> AnalysisModule<A> {
    #[must_use]
    pub fn new(instance: Option<String>, target: Observable) -> Self {
        Self {
            instance,
            analysis: Analysis::new(target),
            analyzer: A::default(),
        }
    }

    /// Method table: `run`, the analyzer's continuations, and the
    /// submit-on-finish hook.
    #[must_use]
    pub fn table() -> MethodTable<Self> {
        let table = MethodTable::new()
            .method("run", |module: &mut Self, ctx, inv| Box::pin(module.run(ctx, inv)))
            .on_finish(|module: &mut Self, ctx| Box::pin(module.finish(ctx)));
        A::continuations(table)
    }

    /// Module logic and the analysis, borrowed together.
    pub fn parts(&mut self) -> (&A, &mut Analysis) {
        (&self.analyzer, &mut self.analysis)
    }

    /// Environment for the current hop.
    ///
    /// # Errors
    ///
    /// Returns an error if configured settings do not decode.
    pub fn env<'a>(&self, ctx: &'a ServiceContext) -> anyhow::Result<ModuleEnv<'a, A::Settings>> {
        ModuleEnv::load(ctx, self.id())
    }

    async fn run(&mut self, ctx: &ServiceContext, _inv: Invocation) -> anyhow::Result<Step> {
        let env = self.env(ctx)?;
        if !self.analyzer.should_run(&self.analysis, &env).await? {
            tracing::info!(
                module = %env.id.key(),
                analysis = %self.analysis.id,
                target = %self.analysis.target.value,
                "module does not apply, ignoring"
            );
            self.analysis.ignore()?;
            return Ok(Step::Done);
        }
        self.analyzer.execute(&mut self.analysis, &env).await
    }

    async fn finish(&mut self, ctx: &ServiceContext) -> anyhow::Result<()> {
        if self.analysis.status == Status::Running {
            self.analysis.complete()?;
        }
        let record = self.analysis.record(self.id());
        ctx.database.submit_analysis(&record).await?;
        tracing::info!(
            module = %record.module.key(),
            analysis = %record.id,
            status = %record.status,
            observables = record.observables.len(),
            "analysis submitted"
        );
        Ok(())
    }
}

impl<A: Analyzer> Dispatchable for AnalysisModule<A> {
    const TYPE: &'static str = A::TYPE;

    fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    fn resolve(&mut self, catalog: &Catalog) -> triage_core::Result<()> {
        catalog.resolve_analysis(&mut self.analysis)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use triage_core::{Callback, Fqdn, Instruction, Ipv4, Tag};

    use super::*;
    use crate::service::registry::{HostedService, ServiceRegistry};
    use crate::testing::Harness;

    /// Resolves nothing; adds a fixed child and asks for one follow-up.
    #[derive(Default)]
    struct Resolver;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct ResolverSettings {
        skip: Vec<String>,
    }

    #[async_trait]
    impl Analyzer for Resolver {
        const TYPE: &'static str = "resolver";
        type Settings = ResolverSettings;

        async fn should_run(
            &self,
            analysis: &Analysis,
            env: &ModuleEnv<'_, ResolverSettings>,
        ) -> anyhow::Result<bool> {
            Ok(analysis.target.is::<Fqdn>() && !env.settings.skip.contains(&analysis.target.value))
        }

        async fn execute(
            &self,
            analysis: &mut Analysis,
            _env: &ModuleEnv<'_, ResolverSettings>,
        ) -> anyhow::Result<Step> {
            analysis.add::<Ipv4>("192.0.2.10")?.add::<Tag>("resolved");
            analysis.set_state("attempt", 1)?;
            Ok(Callback::new("verify").after(Duration::from_secs(2)).into())
        }

        fn continuations(
            table: MethodTable<AnalysisModule<Self>>,
        ) -> MethodTable<AnalysisModule<Self>> {
            table.method("verify", |module, _ctx, _inv| {
                Box::pin(async move {
                    let (_, analysis) = module.parts();
                    analysis.summary = Some("verified".to_string());
                    Ok(Step::Done)
                })
            })
        }
    }

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register_analyzer::<Resolver>().unwrap();
        registry
    }

    async fn run(harness: &Harness, instruction: Instruction) -> (Step, Box<dyn HostedService>) {
        let mut service = registry()
            .construct(&harness.ctx.catalog, instruction.service.clone())
            .unwrap();
        let step = service
            .invoke(&harness.ctx, &instruction.method, instruction.invocation())
            .await
            .unwrap();
        (step, service)
    }

    #[tokio::test]
    async fn run_executes_and_requests_continuation() {
        let harness = Harness::new();
        let target = Observable::new::<Fqdn>("a.example").unwrap();
        let spawn = registry().spawn_analysis("resolver", None, target).unwrap();

        let (step, service) = run(&harness, spawn).await;
        assert!(matches!(step, Step::Continue(ref cb) if cb.method == "verify"));

        let module = service
            .as_any()
            .downcast_ref::<AnalysisModule<Resolver>>()
            .unwrap();
        assert_eq!(module.analysis.status, Status::Running);
        assert_eq!(module.analysis.state::<u32>("attempt"), Some(1));
        assert_eq!(module.analysis.observables[0].tags(), vec!["resolved"]);
    }

    #[tokio::test]
    async fn ignored_analysis_is_submitted_on_finish() {
        let harness = Harness::new();
        let target = Observable::new::<Ipv4>("192.0.2.1").unwrap();
        let spawn = registry().spawn_analysis("resolver", Some("edge"), target).unwrap();

        let (step, mut service) = run(&harness, spawn).await;
        assert_eq!(step, Step::Done);
        service.finish(&harness.ctx).await.unwrap();

        let records = harness.database.analyses();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Ignored);
        assert_eq!(records[0].module, ServiceId::new("resolver", Some("edge".into())));
    }

    #[tokio::test]
    async fn settings_gate_should_run() {
        let harness = Harness::with_modules(serde_json::json!({
            "resolver": {"skip": ["a.example"]}
        }));
        let target = Observable::new::<Fqdn>("a.example").unwrap();
        let spawn = registry().spawn_analysis("resolver", None, target).unwrap();
        let (step, _) = run(&harness, spawn).await;
        assert_eq!(step, Step::Done);
    }

    #[tokio::test]
    async fn finish_completes_running_analysis() {
        let harness = Harness::new();
        let mut module =
            AnalysisModule::<Resolver>::new(None, Observable::new::<Fqdn>("b.example").unwrap());
        module.finish(&harness.ctx).await.unwrap();
        assert_eq!(module.analysis.status, Status::Complete);
        assert_eq!(harness.database.analyses()[0].status, Status::Complete);
    }

    #[test]
    fn snapshot_shape() {
        let fields = analysis_snapshot(
            "resolver",
            None,
            Observable::new::<Fqdn>("c.example").unwrap(),
        )
        .unwrap();
        let module: AnalysisModule<Resolver> =
            serde_json::from_value(Value::Object(fields)).unwrap();
        assert_eq!(module.analysis.target.value, "c.example");
        assert_eq!(module.instance, None);
    }
}
