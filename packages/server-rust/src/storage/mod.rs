//! Persistence adapters for the external surfaces in [`crate::traits`].
//!
//! - [`MemoryStore`] / [`ScopedState`]: watermark key/value storage
//! - [`MemoryDatabase`] / [`HttpDatabase`]: downstream record sink
//! - [`LocalObjectStore`]: content-addressed file bodies
//! - [`EnvSecrets`]: secrets from environment variables

pub mod database;
pub mod memory;
pub mod objects;
pub mod secrets;

pub use database::{HttpDatabase, MemoryDatabase};
pub use memory::{MemoryStore, ScopedState};
pub use objects::{add_file, LocalObjectStore};
pub use secrets::EnvSecrets;
