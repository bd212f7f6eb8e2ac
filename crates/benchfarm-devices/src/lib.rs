/*!
 * Benchfarm Devices
 *
 * This crate provides the device layer of benchfarm: capability templates,
 * inventory descriptors, the connection factory and its transports, plugin
 * binding resolution and the runtime device manager.
 */

#![warn(missing_docs)]

// Re-export core types
pub use benchfarm_core::prelude;

pub mod binding;
pub mod connection;
pub mod descriptor;
pub mod device;
pub mod devices;
pub mod manager;
pub mod requirements;
pub mod template;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use binding::{BindingSpec, BindingSummary, PluginRegistry, Resolution, ResolutionEvent};
pub use connection::{ConnectionFactory, ConnectionParams, ConnectionSession, SessionState, TransportKind};
pub use descriptor::{DeviceDescriptor, Inventory};
pub use device::{Device, DeviceError, DeviceInstance};
pub use manager::{DeviceManager, DeviceSnapshot, RegistryEvent};
pub use requirements::{EnvironmentRequirements, RoleRequirements};
pub use template::{roles, CapabilityContract, TemplateRegistry};

/// Benchfarm devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<(), benchfarm_core::error::Error> {
    tracing::info!("Benchfarm Devices {} initialized", VERSION);
    Ok(())
}

/// Transport kinds the connection factory can open
pub fn available_transports() -> Vec<&'static str> {
    TransportKind::ALL.iter().map(|kind| kind.as_str()).collect()
}
