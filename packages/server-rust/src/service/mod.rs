//! Service dispatch framework.
//!
//! 1. **Registry** (`registry`): per-type method tables and the shared
//!    [`ServiceContext`]
//! 2. **Dispatcher** (`dispatcher`): one queue record in, one method
//!    invocation out
//! 3. **Middleware** (`middleware`): Tower layers around the dispatcher
//! 4. **Shells** (`analysis`, `collector`): module logic wrapped as
//!    dispatchable services

pub mod analysis;
pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod middleware;
pub mod operation;
pub mod registry;

// Re-export key types for convenient access.
pub use analysis::{AnalysisModule, Analyzer, ModuleEnv};
pub use collector::{Collected, Collector, CollectorModule};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use operation::{DispatchError, DispatchOutcome, Step};
pub use registry::{
    Dispatchable, HandlerFuture, Hosted, HostedService, MethodTable, ServiceContext,
    ServiceFamily, ServiceRegistry, UnknownService,
};
