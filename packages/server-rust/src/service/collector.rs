//! Collector execution shell: one `run` hop that turns upstream events into
//! submissions.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use triage_core::{Invocation, Submission};

use super::analysis::ModuleEnv;
use super::operation::Step;
use super::registry::{Dispatchable, MethodTable, ServiceContext};

/// Output of one collection pass.
#[derive(Debug)]
pub struct Collected<P> {
    pub submissions: Vec<Submission>,
    /// Handed to [`Collector::commit`] once every submission is stored.
    pub progress: P,
}

/// Logic of one collector.
#[async_trait]
pub trait Collector: Default + Send + Sync + 'static {
    /// Service type, unique among registered services.
    const TYPE: &'static str;

    /// Settings read from `Config.modules`.
    type Settings: DeserializeOwned + Default + Send + Sync;

    /// How far a pass got upstream, e.g. a watermark.
    type Progress: Send;

    /// Gathers new upstream events without recording progress.
    async fn collect(
        &self,
        env: &ModuleEnv<'_, Self::Settings>,
    ) -> anyhow::Result<Collected<Self::Progress>>;

    /// Records `progress` through [`ModuleEnv::state`]. Runs only after
    /// every submission of the pass reached the database; a pass that fails
    /// earlier is collected again on redelivery.
    async fn commit(
        &self,
        _env: &ModuleEnv<'_, Self::Settings>,
        _progress: Self::Progress,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Dispatchable wrapper around a [`Collector`].
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = "C: Default"))]
pub struct CollectorModule<C> {
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(skip)]
    collector: C,
}

impl<C: Collector> CollectorModule<C> {
    #[must_use]
    pub fn new(instance: Option<String>) -> Self {
        Self {
            instance,
            collector: C::default(),
        }
    }

    #[must_use]
    pub fn table() -> MethodTable<Self> {
        MethodTable::new().method("run", |module: &mut Self, ctx, inv| Box::pin(module.run(ctx, inv)))
    }

    async fn run(&mut self, ctx: &ServiceContext, _inv: Invocation) -> anyhow::Result<Step> {
        let env = ModuleEnv::<C::Settings>::load(ctx, self.id())?;
        let Collected {
            submissions,
            progress,
        } = self.collector.collect(&env).await?;
        let count = submissions.len();
        for mut submission in submissions {
            ctx.catalog.resolve_submission(&mut submission)?;
            ctx.database.submit_submission(&submission).await?;
        }
        self.collector.commit(&env, progress).await?;
        tracing::info!(collector = %env.id.key(), submissions = count, "collection finished");
        Ok(Step::Done)
    }
}

impl<C: Collector> Dispatchable for CollectorModule<C> {
    const TYPE: &'static str = C::TYPE;

    fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }
}
