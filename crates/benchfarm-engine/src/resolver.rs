/*!
 * Environment resolver.
 *
 * Turns an inventory and a requirement set into a ready [`Environment`]:
 * each device is resolved, constructed, connected and registered in
 * inventory order, then the setup phases run. Any failure or cancellation
 * runs TEARDOWN and unwinds every acquired device, last acquired first.
 */
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use benchfarm_core::{
    config::{Config, ConnectionConfig, LifecycleConfig},
    event::SharedEventBus,
    logging::device_span,
    types::Id,
};
use benchfarm_devices::connection::ConnectionErrorKind;
use benchfarm_devices::{
    ConnectionFactory, DeviceDescriptor, DeviceError, DeviceInstance, DeviceManager,
    EnvironmentRequirements, Inventory, PluginRegistry, TemplateRegistry,
};

use crate::context::Environment;
use crate::dispatcher::{LifecycleDispatcher, PhaseReport};
use crate::error::{EnvironmentSetupError, Error, Result};
use crate::hook::HookRegistry;
use crate::phase::LifecyclePhase;
use crate::plugin::{CorePlugin, Plugin, PluginRegistrar};

/// Builder for [`EnvironmentResolver`]
pub struct EnvironmentResolverBuilder {
    templates: TemplateRegistry,
    plugins: Vec<Arc<dyn Plugin>>,
    connection: ConnectionConfig,
    lifecycle: LifecycleConfig,
    factory: Option<ConnectionFactory>,
    event_bus: SharedEventBus,
}

impl Default for EnvironmentResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentResolverBuilder {
    /// Start from the built-in templates and the core plugin
    pub fn new() -> Self {
        Self {
            templates: TemplateRegistry::with_builtin_templates(),
            plugins: vec![Arc::new(CorePlugin)],
            connection: ConnectionConfig::default(),
            lifecycle: LifecycleConfig::default(),
            factory: None,
            event_bus: SharedEventBus::new(),
        }
    }

    /// Replace the template registry
    pub fn templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = templates;
        self
    }

    /// Drop the core plugin
    pub fn without_core_plugin(mut self) -> Self {
        self.plugins.clear();
        self
    }

    /// Add a plugin; plugins register in the order added
    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Take connection and lifecycle settings from `config`
    pub fn config(mut self, config: &Config) -> Self {
        self.connection = config.connection.clone();
        self.lifecycle = config.lifecycle.clone();
        self
    }

    /// Use a preconfigured connection factory
    pub fn connection_factory(mut self, factory: ConnectionFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the per-hook deadline
    pub fn hook_timeout(mut self, timeout: Duration) -> Self {
        self.lifecycle.hook_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Publish resolution and lifecycle events on `bus`
    pub fn event_bus(mut self, bus: SharedEventBus) -> Self {
        self.event_bus = bus;
        self
    }

    /// Collect every plugin's contributions
    pub fn build(self) -> Result<EnvironmentResolver> {
        let mut bindings = PluginRegistry::new(self.templates).with_event_bus(self.event_bus.clone());
        let mut hooks = HookRegistry::new();

        for plugin in &self.plugins {
            let mut registrar = PluginRegistrar::new(plugin.name(), &mut bindings, &mut hooks);
            plugin.register(&mut registrar).map_err(|e| Error::Plugin {
                plugin: plugin.name().to_string(),
                reason: e.to_string(),
            })?;
        }
        info!(
            "Registered {} plugin(s) contributing {} hook(s)",
            self.plugins.len(),
            hooks.len()
        );

        Ok(EnvironmentResolver {
            bindings: Arc::new(bindings),
            hooks: Arc::new(hooks),
            factory: self
                .factory
                .unwrap_or_else(|| ConnectionFactory::new(&self.connection)),
            hook_timeout: self.lifecycle.hook_timeout(),
            event_bus: self.event_bus,
        })
    }
}

impl fmt::Debug for EnvironmentResolverBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<&str> = self.plugins.iter().map(|p| p.name()).collect();
        f.debug_struct("EnvironmentResolverBuilder")
            .field("templates", &self.templates.names())
            .field("plugins", &plugins)
            .field("connection", &self.connection)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

/// Builds environments from an inventory and requirements
#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    bindings: Arc<PluginRegistry>,
    hooks: Arc<HookRegistry>,
    factory: ConnectionFactory,
    hook_timeout: Duration,
    event_bus: SharedEventBus,
}

impl EnvironmentResolver {
    /// Create a builder
    pub fn builder() -> EnvironmentResolverBuilder {
        EnvironmentResolverBuilder::new()
    }

    /// Contracts and bindings contributed by the plugins
    pub fn bindings(&self) -> &PluginRegistry {
        &self.bindings
    }

    /// Hooks contributed by the plugins
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Event bus used for resolution and lifecycle events
    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    /// Acquire every inventory device and run the setup phases
    ///
    /// On failure every device that was acquired is closed before the
    /// error is returned, so a failed setup leaves no open sessions.
    pub async fn setup(
        &self,
        inventory: &Inventory,
        requirements: &EnvironmentRequirements,
        cancel: &CancellationToken,
    ) -> Result<Environment> {
        let run_id = Id::new();
        info!("Setting up environment {} with {} device(s)", run_id, inventory.len());

        let manager = Arc::new(DeviceManager::new());
        let mut dispatcher = LifecycleDispatcher::new(run_id, self.hooks.clone(), self.hook_timeout)
            .with_event_bus(self.event_bus.clone())
            .with_cancellation(cancel.clone());

        match self
            .build_up(inventory, requirements, cancel, &manager, &mut dispatcher)
            .await
        {
            Ok(reports) => {
                info!("Environment {} is ready", dispatcher.run_id());
                Ok(Environment::new(requirements.clone(), manager, dispatcher, reports))
            }
            Err(cause) => Err(self.roll_back(cause, &manager, &mut dispatcher).await.into()),
        }
    }

    async fn build_up(
        &self,
        inventory: &Inventory,
        requirements: &EnvironmentRequirements,
        cancel: &CancellationToken,
        manager: &DeviceManager,
        dispatcher: &mut LifecycleDispatcher,
    ) -> Result<Vec<PhaseReport>> {
        self.check_roles(inventory, requirements)?;

        for descriptor in inventory.devices() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let span = device_span(&descriptor.name, &descriptor.role);
            let instance = self
                .acquire(descriptor, requirements, cancel)
                .instrument(span)
                .await?;
            if let Err(e) = manager.register(instance.clone()) {
                instance.close().await;
                return Err(e.into());
            }
        }

        let mut reports = Vec::with_capacity(LifecyclePhase::SETUP.len());
        for phase in LifecyclePhase::SETUP {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let snapshot = manager.snapshot()?;
            reports.push(dispatcher.run_phase(phase, &snapshot).await?);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(reports)
    }

    fn check_roles(&self, inventory: &Inventory, requirements: &EnvironmentRequirements) -> Result<()> {
        let available = inventory.roles();
        for role in requirements.role_names() {
            if !available.contains(role) {
                error!("No inventory device fills role {}", role);
                return Err(DeviceError::NoCandidate {
                    contract: role.to_string(),
                    registered: self.bindings.bindings(role).len(),
                }
                .into());
            }
        }
        Ok(())
    }

    async fn acquire(
        &self,
        descriptor: &Arc<DeviceDescriptor>,
        requirements: &EnvironmentRequirements,
        cancel: &CancellationToken,
    ) -> Result<Arc<DeviceInstance>> {
        let resolution = self.bindings.resolve(&descriptor.role, requirements)?;
        let device = resolution.selected.construct(descriptor)?;
        device.satisfies(&resolution.contract)?;

        let kind = descriptor.connection.kind();
        let session = self
            .factory
            .open(&descriptor.name, &descriptor.connection, cancel)
            .await
            .map_err(|e| match e.kind {
                ConnectionErrorKind::Cancelled => Error::Cancelled,
                _ => DeviceError::connection(&descriptor.name, kind, e).into(),
            })?;

        let instance = DeviceInstance::new(
            descriptor.clone(),
            resolution.contract.clone(),
            resolution.selected.summary().clone(),
            device,
            session,
        )?;
        info!(
            "Acquired {} as {} using {}",
            descriptor.name,
            descriptor.role,
            instance.binding()
        );
        Ok(Arc::new(instance))
    }

    async fn roll_back(
        &self,
        cause: Error,
        manager: &DeviceManager,
        dispatcher: &mut LifecycleDispatcher,
    ) -> EnvironmentSetupError {
        error!("Environment {} setup failed: {}", dispatcher.run_id(), cause);
        let mut causes = vec![cause];

        match manager.snapshot() {
            Ok(snapshot) => {
                if let Some(report) = dispatcher.teardown(&snapshot).await {
                    causes.extend(report.failures.into_iter().map(|failure| Error::HookFailed {
                        hook: failure.hook,
                        phase: LifecyclePhase::Teardown,
                        critical: false,
                        reason: failure.reason,
                    }));
                }
            }
            Err(e) => causes.push(e.into()),
        }

        let rolled_back = match manager.clear().await {
            Ok(closed) => closed,
            Err(e) => {
                causes.push(e.into());
                Vec::new()
            }
        };
        info!("Rolled back {} device(s)", rolled_back.len());

        EnvironmentSetupError { causes, rolled_back }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookSpec;
    use crate::plugin::FnPlugin;
    use benchfarm_devices::binding::BindingSpec;
    use benchfarm_devices::testing::{descriptor, test_connection_config, ScriptedConnector, StubDevice};
    use benchfarm_devices::{roles, RoleRequirements};
    use std::sync::Mutex;
    use tokio_test::assert_ok;

    type Log = Arc<Mutex<Vec<String>>>;

    fn factory(connector: &Arc<ScriptedConnector>) -> ConnectionFactory {
        ConnectionFactory::new(&test_connection_config()).with_connector_for_all(connector.clone())
    }

    fn inventory(devices: &[(&str, &str)]) -> Inventory {
        Inventory::from_descriptors(
            devices
                .iter()
                .map(|(name, role)| descriptor(name, role).with_attribute("hw_model", "rpi4")),
        )
        .unwrap()
    }

    fn recording(log: &Log, name: &str, phase: LifecyclePhase) -> HookSpec {
        let log = log.clone();
        let entry = name.to_string();
        HookSpec::from_fn(name, phase, move |_ctx| {
            let log = log.clone();
            let entry = entry.clone();
            async move {
                log.lock().unwrap().push(entry);
                Ok(())
            }
        })
    }

    fn setup_error(result: Result<Environment>) -> EnvironmentSetupError {
        match result {
            Err(Error::Setup(e)) => e,
            Err(other) => panic!("unexpected error: {}", other),
            Ok(env) => panic!("setup of {} unexpectedly succeeded", env.run_id()),
        }
    }

    #[test]
    fn test_hook_timeout_saturates() {
        let builder = EnvironmentResolver::builder().hook_timeout(Duration::MAX);
        assert_eq!(builder.lifecycle.hook_timeout_ms, u64::MAX);

        let builder = EnvironmentResolver::builder().hook_timeout(Duration::from_secs(90));
        assert_eq!(builder.lifecycle.hook_timeout(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_setup_reaches_ready_and_tears_down() {
        let connector = Arc::new(ScriptedConnector::new());
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .build()
            .unwrap();

        let env = assert_ok!(
            resolver
                .setup(
                    &inventory(&[("board", roles::CPE), ("lan", roles::LAN)]),
                    &EnvironmentRequirements::new(),
                    &CancellationToken::new(),
                )
                .await
        );
        assert_eq!(env.phase(), Some(LifecyclePhase::Ready));
        assert_eq!(env.devices().names().unwrap(), vec!["board", "lan"]);
        assert_eq!(env.primary(roles::CPE).unwrap().binding().implementation, "linux-shell");
        assert_eq!(env.reports().len(), 6);
        assert!(env.warnings().is_empty());

        let report = assert_ok!(env.teardown().await);
        assert_eq!(report.closed, vec!["lan", "board"]);
        assert!(report.phase.is_some());
        assert_eq!(connector.closed(), vec!["lan", "board"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_cpe_lan_scenario_with_vendor_override() {
        let log: Log = Arc::default();
        let hook_log = log.clone();
        let connector = Arc::new(ScriptedConnector::new());
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .plugin(FnPlugin::new("vendor", move |registrar| {
                registrar.binding(
                    BindingSpec::new(
                        roles::CPE,
                        "dual-stack-cpe",
                        StubDevice::constructor("dual-stack-cpe", &["run_command", "get_interface_ipv4"]),
                    )
                    .priority(10)
                    .when(|r| r.requires("provisioning_mode", "dual")),
                )?;
                registrar.hook(recording(&hook_log, "cpe-boot", LifecyclePhase::Boot).role(roles::CPE));
                registrar.hook(recording(&hook_log, "lan-boot", LifecyclePhase::Boot).role(roles::LAN).priority(-1));
                registrar.hook(recording(&hook_log, "acs-boot", LifecyclePhase::Boot).role(roles::ACS));
                Ok(())
            }))
            .build()
            .unwrap();
        let inventory = inventory(&[("board", roles::CPE), ("lan", roles::LAN)]);

        let dual = EnvironmentRequirements::new()
            .with_role(roles::CPE, RoleRequirements::new().with("provisioning_mode", "dual"));
        let env = resolver
            .setup(&inventory, &dual, &CancellationToken::new())
            .await
            .unwrap();
        let board = env.get_by_name("board").unwrap();
        assert_eq!(board.binding().source, "vendor");
        assert_eq!(board.invoke("get_interface_ipv4", &[]).await.unwrap().as_str(), Some("dual-stack-cpe:get_interface_ipv4"));
        assert_eq!(env.get_by_role(roles::LAN).unwrap()[0].binding().source, "core");
        assert_eq!(*log.lock().unwrap(), vec!["cpe-boot", "lan-boot"]);
        env.teardown().await.unwrap();

        let ipv4 = EnvironmentRequirements::new()
            .with_role(roles::CPE, RoleRequirements::new().with("provisioning_mode", "ipv4"));
        let env = resolver
            .setup(&inventory, &ipv4, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(env.get_by_name("board").unwrap().binding().implementation, "linux-shell");
        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_selection_is_deterministic_across_runs() {
        let connector = Arc::new(ScriptedConnector::new());
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .plugin(FnPlugin::new("vendor", |registrar| {
                let constructor = StubDevice::constructor("vendor-lan", &["run_command"]);
                registrar.binding(BindingSpec::new(roles::LAN, "vendor-lan", constructor).priority(0))?;
                Ok(())
            }))
            .build()
            .unwrap();
        let inventory = inventory(&[("lan1", roles::LAN), ("lan2", roles::LAN)]);

        let mut selections = Vec::new();
        for _ in 0..3 {
            let env = resolver
                .setup(&inventory, &EnvironmentRequirements::new(), &CancellationToken::new())
                .await
                .unwrap();
            let bindings: Vec<_> = env
                .get_by_role(roles::LAN)
                .unwrap()
                .iter()
                .map(|d| d.binding().clone())
                .collect();
            selections.push(bindings);
            env.teardown().await.unwrap();
        }
        assert!(selections.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(selections[0][0].implementation, "vendor-lan");
    }

    #[tokio::test]
    async fn test_missing_role_fails_before_connecting() {
        let connector = Arc::new(ScriptedConnector::new());
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .build()
            .unwrap();
        let requirements = EnvironmentRequirements::new().with_role(roles::ACS, RoleRequirements::new());

        let error = setup_error(
            resolver
                .setup(&inventory(&[("board", roles::CPE)]), &requirements, &CancellationToken::new())
                .await,
        );
        assert!(matches!(
            error.primary(),
            Some(Error::Device(DeviceError::NoCandidate { contract, .. })) if contract == "ACS"
        ));
        assert!(error.rolled_back.is_empty());
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_rolls_back_in_reverse() {
        let connector = Arc::new(ScriptedConnector::new().fail_for("wan", ConnectionErrorKind::Unreachable));
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .build()
            .unwrap();

        let error = setup_error(
            resolver
                .setup(
                    &inventory(&[("board", roles::CPE), ("lan", roles::LAN), ("wan", roles::WAN)]),
                    &EnvironmentRequirements::new(),
                    &CancellationToken::new(),
                )
                .await,
        );
        assert!(matches!(
            error.primary(),
            Some(Error::Device(DeviceError::Connection { device, .. })) if device == "wan"
        ));
        assert_eq!(connector.attempts_for("wan"), 3);
        assert_eq!(error.rolled_back, vec!["lan", "board"]);
        assert_eq!(connector.closed(), vec!["lan", "board"]);
    }

    #[tokio::test]
    async fn test_unsatisfied_contract_never_connects() {
        let connector = Arc::new(ScriptedConnector::new());
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .plugin(FnPlugin::new("vendor", |registrar| {
                let constructor = StubDevice::constructor("shell-only", &["run_command"]);
                registrar.binding(BindingSpec::new(roles::CPE, "shell-only", constructor).priority(5))?;
                Ok(())
            }))
            .build()
            .unwrap();

        let error = setup_error(
            resolver
                .setup(
                    &inventory(&[("lan", roles::LAN), ("board", roles::CPE)]),
                    &EnvironmentRequirements::new(),
                    &CancellationToken::new(),
                )
                .await,
        );
        assert!(matches!(
            error.primary(),
            Some(Error::Device(DeviceError::ContractNotSatisfied { device, .. })) if device == "board"
        ));
        assert_eq!(connector.opened(), vec!["lan"]);
        assert_eq!(error.rolled_back, vec!["lan"]);
    }

    #[tokio::test]
    async fn test_cancellation_closes_opened_devices_last_first() {
        let connector = Arc::new(ScriptedConnector::new().hang_for("c"));
        let patient = ConnectionConfig {
            connect_timeout_ms: 10_000,
            ..test_connection_config()
        };
        let resolver = EnvironmentResolver::builder()
            .connection_factory(ConnectionFactory::new(&patient).with_connector_for_all(connector.clone()))
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            let connector = connector.clone();
            tokio::spawn(async move {
                while connector.attempts_for("c") == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                cancel.cancel();
            })
        };

        let error = setup_error(
            resolver
                .setup(
                    &inventory(&[("a", roles::LAN), ("b", roles::WAN), ("c", roles::ACS)]),
                    &EnvironmentRequirements::new(),
                    &cancel,
                )
                .await,
        );
        canceller.await.unwrap();

        assert!(matches!(error.primary(), Some(Error::Cancelled)));
        assert_eq!(connector.attempts_for("c"), 1);
        assert_eq!(error.rolled_back, vec!["b", "a"]);
        assert_eq!(connector.closed(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_cancel_during_ready_hook_rolls_back() {
        let log: Log = Arc::default();
        let hook_log = log.clone();
        let connector = Arc::new(ScriptedConnector::new());
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .plugin(FnPlugin::new("vendor", move |registrar| {
                registrar.hook(HookSpec::from_fn("settle", LifecyclePhase::Ready, |_ctx| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }));
                registrar.hook(recording(&hook_log, "teardown", LifecyclePhase::Teardown));
                Ok(())
            }))
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let started = std::time::Instant::now();
        let error = setup_error(
            resolver
                .setup(
                    &inventory(&[("a", roles::LAN), ("b", roles::WAN)]),
                    &EnvironmentRequirements::new(),
                    &cancel,
                )
                .await,
        );
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(error.primary(), Some(Error::Cancelled)));
        assert_eq!(error.rolled_back, vec!["b", "a"]);
        assert_eq!(connector.closed(), vec!["b", "a"]);
        assert_eq!(*log.lock().unwrap(), vec!["teardown"]);
    }

    #[tokio::test]
    async fn test_cancel_after_last_phase_is_not_ready() {
        let connector = Arc::new(ScriptedConnector::new());
        let cancel = CancellationToken::new();
        let late_cancel = cancel.clone();
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .plugin(FnPlugin::new("vendor", move |registrar| {
                let cancel = late_cancel.clone();
                registrar.hook(HookSpec::from_fn("announce", LifecyclePhase::Ready, move |_ctx| {
                    let cancel = cancel.clone();
                    async move {
                        cancel.cancel();
                        Ok(())
                    }
                }));
                Ok(())
            }))
            .build()
            .unwrap();

        let error = setup_error(
            resolver
                .setup(&inventory(&[("a", roles::LAN)]), &EnvironmentRequirements::new(), &cancel)
                .await,
        );
        assert!(matches!(error.primary(), Some(Error::Cancelled)));
        assert_eq!(error.rolled_back, vec!["a"]);
        assert_eq!(connector.closed(), vec!["a"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_critical_provision_hook_forces_teardown() {
        let log: Log = Arc::default();
        let hook_log = log.clone();
        let connector = Arc::new(ScriptedConnector::new());
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .plugin(FnPlugin::new("vendor", move |registrar| {
                registrar.hook(
                    HookSpec::from_fn("flash", LifecyclePhase::Provision, |_ctx| async {
                        anyhow::bail!("image rejected")
                    })
                    .role(roles::CPE)
                    .critical(),
                );
                registrar.hook(recording(&hook_log, "post-boot", LifecyclePhase::PostBoot));
                registrar.hook(recording(&hook_log, "ready", LifecyclePhase::Ready));
                registrar.hook(recording(&hook_log, "teardown", LifecyclePhase::Teardown));
                Ok(())
            }))
            .build()
            .unwrap();

        let error = setup_error(
            resolver
                .setup(
                    &inventory(&[("board", roles::CPE), ("lan", roles::LAN)]),
                    &EnvironmentRequirements::new(),
                    &CancellationToken::new(),
                )
                .await,
        );
        assert!(matches!(
            error.primary(),
            Some(Error::HookFailed { hook, phase: LifecyclePhase::Provision, critical: true, .. }) if hook == "flash"
        ));
        assert_eq!(*log.lock().unwrap(), vec!["teardown"]);
        assert_eq!(error.rolled_back, vec!["lan", "board"]);
        assert_eq!(connector.closed(), vec!["lan", "board"]);
    }

    #[tokio::test]
    async fn test_advisory_failures_become_warnings() {
        let connector = Arc::new(ScriptedConnector::new());
        let resolver = EnvironmentResolver::builder()
            .connection_factory(factory(&connector))
            .plugin(FnPlugin::new("vendor", |registrar| {
                registrar.hook(HookSpec::from_fn("dhcp-check", LifecyclePhase::PostBoot, |_ctx| async {
                    anyhow::bail!("no lease yet")
                }));
                Ok(())
            }))
            .build()
            .unwrap();

        let env = resolver
            .setup(
                &inventory(&[("lan", roles::LAN)]),
                &EnvironmentRequirements::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(env.phase(), Some(LifecyclePhase::Ready));
        assert_eq!(env.warnings(), vec!["POST_BOOT hook dhcp-check: no lease yet"]);
        env.teardown().await.unwrap();
    }

    #[test]
    fn test_failing_plugin_reported_by_name() {
        let result = EnvironmentResolver::builder()
            .plugin(FnPlugin::new("broken", |registrar| {
                let constructor = StubDevice::constructor("moca", &["scan"]);
                registrar.binding(BindingSpec::new("MoCA", "moca", constructor))?;
                Ok(())
            }))
            .build();
        assert!(matches!(result, Err(Error::Plugin { plugin, .. }) if plugin == "broken"));
    }
}
