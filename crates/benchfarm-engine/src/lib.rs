/*!
 * Benchfarm Engine
 *
 * This crate provides the orchestration layer of benchfarm: lifecycle
 * phases and hooks, the plugin contribution interface and the environment
 * resolver that turns an inventory into a ready environment.
 */

#![warn(missing_docs)]

// Re-export core types
pub use benchfarm_core::prelude;

// Re-export types from benchfarm_core for convenience
pub use benchfarm_core::types::{Id, Value};

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod hook;
pub mod phase;
pub mod plugin;
pub mod resolver;

// Re-export main types for convenience
pub use context::{Environment, TeardownReport};
pub use dispatcher::{HookFailure, LifecycleDispatcher, LifecycleEvent, PhaseReport};
pub use error::{EnvironmentSetupError, Error, Result};
pub use hook::{Criticality, FnHook, Hook, HookContext, HookRegistration, HookRegistry, HookSpec, RoleFilter};
pub use phase::LifecyclePhase;
pub use plugin::{CorePlugin, FnPlugin, Plugin, PluginRegistrar};
pub use resolver::{EnvironmentResolver, EnvironmentResolverBuilder};

/// Benchfarm engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("Benchfarm Engine {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
