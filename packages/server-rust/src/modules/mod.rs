//! Analysis modules and collectors shipped with the server.

pub mod directory;
pub mod file_extension;
pub mod sandbox;

pub use directory::{Directory, DirectorySettings};
pub use file_extension::{FileExtension, FileExtensionSettings};
pub use sandbox::{HttpSandbox, Sandbox, SandboxClient, SandboxReport, SandboxSettings};

use crate::service::ServiceRegistry;

/// Registers every shipped module.
///
/// # Errors
///
/// Returns a duplicate-tag error if a shipped type is already registered.
pub fn register_builtins(registry: &mut ServiceRegistry) -> triage_core::Result<()> {
    registry.register_analyzer::<FileExtension>()?;
    registry.register_analyzer::<Sandbox>()?;
    registry.register_collector::<Directory>()?;
    Ok(())
}
