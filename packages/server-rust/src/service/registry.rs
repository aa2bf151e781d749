use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use triage_core::{
    tag_of, Catalog, Family, Fields, Instruction, Invocation, ModelError, Observable, ServiceId,
    TypeRegistry, TYPE_FIELD,
};

use super::analysis::{analysis_snapshot, AnalysisModule, Analyzer};
use super::collector::{Collector, CollectorModule};
use super::config::Config;
use super::operation::{DispatchError, Step};
use crate::clock::ClockSource;
use crate::storage::{EnvSecrets, LocalObjectStore, MemoryStore, ScopedState};
use crate::traits::{Database, KeyValueStore, MessageQueue, ObjectStore, SecretStore};

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Everything a service may touch while handling one message.
///
/// Cheap to clone; all surfaces are shared.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub queue: Arc<dyn MessageQueue>,
    pub database: Arc<dyn Database>,
    pub clock: Arc<dyn ClockSource>,
    pub store: Arc<dyn KeyValueStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub secrets: Arc<dyn SecretStore>,
    /// Process-wide handles keyed by type (e.g. injected API clients).
    extensions: Arc<DashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceContext {
    /// Creates a context with in-memory watermarks, environment secrets, and
    /// an object store under the system temp directory.
    #[must_use]
    pub fn new(
        config: Config,
        catalog: Catalog,
        queue: Arc<dyn MessageQueue>,
        database: Arc<dyn Database>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            queue,
            database,
            clock,
            store: Arc::new(MemoryStore::new()),
            objects: Arc::new(LocalObjectStore::new(
                std::env::temp_dir().join("triage-objects"),
            )),
            secrets: Arc::new(EnvSecrets::default()),
            extensions: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = objects;
        self
    }

    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Installs a shared handle retrievable with [`extension`](Self::extension).
    #[must_use]
    pub fn with_extension<T: Any + Send + Sync>(self, value: T) -> Self {
        self.extensions.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Retrieve a handle installed with [`with_extension`](Self::with_extension).
    #[must_use]
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persisted key/value state owned by service `id`.
    #[must_use]
    pub fn state(&self, id: &ServiceId) -> ScopedState {
        ScopedState::new(Arc::clone(&self.store), id)
    }

    /// Typed settings for service `id` from [`Config::modules`].
    ///
    /// # Errors
    ///
    /// Returns an error if configured settings do not decode as `T`.
    pub fn settings<T: DeserializeOwned + Default>(&self, id: &ServiceId) -> anyhow::Result<T> {
        self.config.settings(id)
    }

    /// Enqueues `instruction` on the configured queue to become visible at
    /// `resume_at`.
    ///
    /// Waits beyond the queue's maximum delay are enqueued with the maximum
    /// and carry `not_before`, so the dispatcher defers them again on arrival.
    ///
    /// # Errors
    ///
    /// Returns the queue's error, or an encode error for the instruction.
    pub async fn enqueue(
        &self,
        instruction: Instruction,
        resume_at: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        self.enqueue_to(&self.config.queue, instruction, resume_at).await
    }

    /// Like [`enqueue`](Self::enqueue), onto the named queue.
    ///
    /// # Errors
    ///
    /// Returns the queue's error, or an encode error for the instruction.
    pub async fn enqueue_to(
        &self,
        queue: &str,
        mut instruction: Instruction,
        resume_at: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let wait_ms = (resume_at - self.now()).num_milliseconds().max(0);
        let wait = u64::try_from(wait_ms).unwrap_or(0).div_ceil(1000);
        let max = self.config.max_delay_seconds;
        let delay = if wait > max {
            instruction.not_before = Some(resume_at);
            max
        } else {
            instruction.not_before = None;
            wait
        };
        let body = instruction.encode()?;
        self.queue.add(queue, body, delay).await
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("config", &self.config)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Method tables
// ---------------------------------------------------------------------------

/// Boxed future returned by handlers and finish hooks.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

type Handler<S> = Box<
    dyn for<'a> Fn(&'a mut S, &'a ServiceContext, Invocation) -> HandlerFuture<'a, Step>
        + Send
        + Sync,
>;

type FinishHook<S> =
    Box<dyn for<'a> Fn(&'a mut S, &'a ServiceContext) -> HandlerFuture<'a, ()> + Send + Sync>;

/// Dispatch table of one service type: method name to handler, built once at
/// start-up.
pub struct MethodTable<S> {
    handlers: HashMap<&'static str, Handler<S>>,
    finish: Option<FinishHook<S>>,
}

impl<S> MethodTable<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            finish: None,
        }
    }

    /// Adds (or replaces) the handler for `name`.
    #[must_use]
    pub fn method<F>(mut self, name: &'static str, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a ServiceContext, Invocation) -> HandlerFuture<'a, Step>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name, Box::new(handler));
        self
    }

    /// Sets the hook run when a handler returns [`Step::Done`].
    #[must_use]
    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a ServiceContext) -> HandlerFuture<'a, ()>
            + Send
            + Sync
            + 'static,
    {
        self.finish = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl<S> Default for MethodTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// A service type that can travel through the queue.
///
/// The serialized form is the snapshot carried in every [`Instruction`];
/// `type` and `instance` are stamped onto it by the registry.
pub trait Dispatchable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator, unique within the service family.
    const TYPE: &'static str;

    /// Named configuration slot, if any.
    fn instance(&self) -> Option<&str>;

    /// Validates embedded values after decoding.
    ///
    /// # Errors
    ///
    /// Returns the catalog's error for invalid embedded values.
    fn resolve(&mut self, _catalog: &Catalog) -> triage_core::Result<()> {
        Ok(())
    }

    fn id(&self) -> ServiceId {
        ServiceId::new(Self::TYPE, self.instance().map(str::to_string))
    }
}

/// A reconstructed service, ready to have a method invoked on it.
#[async_trait]
pub trait HostedService: Send + Sync {
    fn id(&self) -> ServiceId;

    /// Serialized form of the current state, `type` and `instance` included.
    fn snapshot(&self) -> triage_core::Result<Fields>;

    fn has_method(&self, method: &str) -> bool;

    async fn invoke(
        &mut self,
        ctx: &ServiceContext,
        method: &str,
        invocation: Invocation,
    ) -> Result<Step, DispatchError>;

    /// Runs the finish hook, if the service type has one.
    async fn finish(&mut self, ctx: &ServiceContext) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// A registered service paired with its type's method table.
pub struct Hosted<S> {
    service: S,
    table: Arc<MethodTable<S>>,
}

fn snapshot_of<S: Dispatchable>(service: &S) -> triage_core::Result<Fields> {
    match serde_json::to_value(service)? {
        Value::Object(mut fields) => {
            fields.insert(TYPE_FIELD.to_string(), Value::from(S::TYPE));
            fields.insert(
                "instance".to_string(),
                service.instance().map_or(Value::Null, Value::from),
            );
            Ok(fields)
        }
        other => Err(ModelError::invalid(
            S::TYPE,
            &other.to_string(),
            "service must serialize to an object",
        )),
    }
}

#[async_trait]
impl<S: Dispatchable> HostedService for Hosted<S> {
    fn id(&self) -> ServiceId {
        self.service.id()
    }

    fn snapshot(&self) -> triage_core::Result<Fields> {
        snapshot_of(&self.service)
    }

    fn has_method(&self, method: &str) -> bool {
        self.table.contains(method)
    }

    async fn invoke(
        &mut self,
        ctx: &ServiceContext,
        method: &str,
        invocation: Invocation,
    ) -> Result<Step, DispatchError> {
        let table = Arc::clone(&self.table);
        let Some(handler) = table.handlers.get(method) else {
            return Err(DispatchError::UnknownMethod {
                service: S::TYPE.to_string(),
                method: method.to_string(),
            });
        };
        handler(&mut self.service, ctx, invocation)
            .await
            .map_err(DispatchError::Handler)
    }

    async fn finish(&mut self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let table = Arc::clone(&self.table);
        match &table.finish {
            Some(hook) => hook(&mut self.service, ctx).await,
            None => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        &self.service
    }
}

/// Generic value for a service type this process was not built with.
///
/// Keeps the raw snapshot; it has no methods, so dispatching to it fails with
/// [`DispatchError::UnknownMethod`].
#[derive(Debug, Clone)]
pub struct UnknownService {
    id: ServiceId,
    snapshot: Fields,
}

impl UnknownService {
    /// # Errors
    ///
    /// Returns [`ModelError::MissingTag`] if the snapshot has no `type`.
    pub fn new(snapshot: Fields) -> triage_core::Result<Self> {
        Ok(Self {
            id: ServiceId::from_snapshot(&snapshot)?,
            snapshot,
        })
    }
}

#[async_trait]
impl HostedService for UnknownService {
    fn id(&self) -> ServiceId {
        self.id.clone()
    }

    fn snapshot(&self) -> triage_core::Result<Fields> {
        Ok(self.snapshot.clone())
    }

    fn has_method(&self, _method: &str) -> bool {
        false
    }

    async fn invoke(
        &mut self,
        _ctx: &ServiceContext,
        method: &str,
        _invocation: Invocation,
    ) -> Result<Step, DispatchError> {
        Err(DispatchError::UnknownMethod {
            service: self.id.kind.clone(),
            method: method.to_string(),
        })
    }

    async fn finish(&mut self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Service variant family.
#[derive(Debug)]
pub struct ServiceFamily;

impl Family for ServiceFamily {
    const NAME: &'static str = "service";
    type Raw = Fields;
    type Value = Box<dyn HostedService>;

    fn tag(raw: &Fields) -> Option<&str> {
        tag_of(raw)
    }

    fn fallback(_catalog: &Catalog, raw: Fields) -> triage_core::Result<Box<dyn HostedService>> {
        Ok(Box::new(UnknownService::new(raw)?))
    }
}

/// Registry of dispatchable service types, populated at start-up.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: TypeRegistry<ServiceFamily>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers service type `S` with its method table.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateTag`] if `S::TYPE` is taken.
    pub fn register<S: Dispatchable>(&mut self, table: MethodTable<S>) -> triage_core::Result<()> {
        let table = Arc::new(table);
        self.services.register(S::TYPE, move |catalog, raw: Fields| {
            let mut service: S = serde_json::from_value(Value::Object(raw))
                .map_err(|e| ModelError::malformed(S::TYPE, e))?;
            service.resolve(catalog)?;
            Ok(Box::new(Hosted {
                service,
                table: Arc::clone(&table),
            }) as Box<dyn HostedService>)
        })
    }

    /// Registers analysis module `A`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateTag`] if `A::TYPE` is taken.
    pub fn register_analyzer<A: Analyzer>(&mut self) -> triage_core::Result<()> {
        self.register(AnalysisModule::<A>::table())
    }

    /// Registers collector `C`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateTag`] if `C::TYPE` is taken.
    pub fn register_collector<C: Collector>(&mut self) -> triage_core::Result<()> {
        self.register(CollectorModule::<C>::table())
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.services.contains(kind)
    }

    /// Registered service types, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&'static str> {
        self.services.tags()
    }

    /// Rebuilds a service from its snapshot. Unknown types yield an
    /// [`UnknownService`].
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingTag`] for a snapshot without `type`, or a
    /// decode error when a registered type's fields are invalid.
    pub fn construct(
        &self,
        catalog: &Catalog,
        snapshot: Fields,
    ) -> triage_core::Result<Box<dyn HostedService>> {
        self.services.construct(catalog, snapshot)
    }

    fn ensure_registered(&self, kind: &str) -> triage_core::Result<()> {
        if self.contains(kind) {
            Ok(())
        } else {
            Err(ModelError::invalid(
                ServiceFamily::NAME,
                kind,
                "no service registered under this type",
            ))
        }
    }

    /// Initial `run` instruction for analysis module `kind` on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidValue`] if `kind` is not registered.
    pub fn spawn_analysis(
        &self,
        kind: &str,
        instance: Option<&str>,
        target: Observable,
    ) -> triage_core::Result<Instruction> {
        self.ensure_registered(kind)?;
        let snapshot = analysis_snapshot(kind, instance, target)?;
        Ok(Instruction::new(snapshot, "run"))
    }

    /// Initial `run` instruction for collector `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidValue`] if `kind` is not registered.
    pub fn spawn_collector(
        &self,
        kind: &str,
        instance: Option<&str>,
    ) -> triage_core::Result<Instruction> {
        self.ensure_registered(kind)?;
        let mut snapshot = Fields::new();
        snapshot.insert(TYPE_FIELD.to_string(), Value::from(kind));
        snapshot.insert(
            "instance".to_string(),
            instance.map_or(Value::Null, Value::from),
        );
        Ok(Instruction::new(snapshot, "run"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
