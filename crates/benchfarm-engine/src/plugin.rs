/*!
 * Plugin contribution interface.
 *
 * A plugin contributes contracts, bindings and hooks through a
 * [`PluginRegistrar`]. Plugins are registered in the order they are given to
 * the resolver builder, so equal-priority overrides are reproducible.
 */
use std::sync::Arc;

use benchfarm_devices::binding::{BindingSpec, BindingSummary, PluginRegistry};
use benchfarm_devices::devices::{LinuxShell, LxdPdu};
use benchfarm_devices::{roles, CapabilityContract};

use crate::error::Result;
use crate::hook::{HookRegistry, HookSpec};

/// A source of bindings and hooks
pub trait Plugin: Send + Sync {
    /// Name recorded as the source of every contribution
    fn name(&self) -> &str;

    /// Contribute bindings and hooks
    fn register(&self, registrar: &mut PluginRegistrar<'_>) -> Result<()>;
}

/// A plugin backed by a closure
pub struct FnPlugin<F> {
    name: String,
    f: F,
}

impl<F> FnPlugin<F>
where
    F: Fn(&mut PluginRegistrar<'_>) -> Result<()> + Send + Sync,
{
    /// Create a plugin called `name` that registers through `f`
    pub fn new<N: Into<String>>(name: N, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Plugin for FnPlugin<F>
where
    F: Fn(&mut PluginRegistrar<'_>) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, registrar: &mut PluginRegistrar<'_>) -> Result<()> {
        (self.f)(registrar)
    }
}

/// Collects one plugin's contributions
#[derive(Debug)]
pub struct PluginRegistrar<'a> {
    source: String,
    bindings: &'a mut PluginRegistry,
    hooks: &'a mut HookRegistry,
}

impl<'a> PluginRegistrar<'a> {
    /// Create a registrar recording contributions as coming from `source`
    pub fn new<S: Into<String>>(source: S, bindings: &'a mut PluginRegistry, hooks: &'a mut HookRegistry) -> Self {
        Self {
            source: source.into(),
            bindings,
            hooks,
        }
    }

    /// Name of the contributing plugin
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Declare a new contract
    pub fn declare_contract<N, O, P>(&mut self, name: N, operations: O, properties: P) -> Result<Arc<CapabilityContract>>
    where
        N: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Ok(self.bindings.declare_contract(name, operations, properties)?)
    }

    /// Offer an implementation for a contract
    pub fn binding(&mut self, spec: BindingSpec) -> Result<BindingSummary> {
        Ok(self.bindings.register_binding(&self.source, spec)?)
    }

    /// Declare a lifecycle hook
    pub fn hook(&mut self, spec: HookSpec) -> u64 {
        self.hooks.register(&self.source, spec)
    }
}

/// Bindings for the built-in roles
///
/// Every shell role is served by [`LinuxShell`] and PDUs by [`LxdPdu`], all
/// at priority 0 so any vendor plugin can override them.
#[derive(Debug, Default)]
pub struct CorePlugin;

impl Plugin for CorePlugin {
    fn name(&self) -> &str {
        "core"
    }

    fn register(&self, registrar: &mut PluginRegistrar<'_>) -> Result<()> {
        for role in [roles::CPE, roles::LAN, roles::WAN, roles::ACS] {
            registrar.binding(BindingSpec::new(role, "linux-shell", LinuxShell::constructor()))?;
        }
        registrar.binding(BindingSpec::new(roles::PDU, "lxd-pdu", LxdPdu::constructor()))?;
        Ok(())
    }
}
