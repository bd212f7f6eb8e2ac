/*!
 * Lifecycle hooks.
 *
 * Hooks are declared by plugins before a run starts and invoked by the
 * dispatcher against the devices registered at the time their phase runs.
 */
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use benchfarm_core::types::Id;
use benchfarm_devices::{DeviceInstance, DeviceSnapshot};

use crate::phase::LifecyclePhase;

/// What a hook sees when it runs
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Environment run the hook belongs to
    pub run_id: Id,
    /// Phase being run
    pub phase: LifecyclePhase,
    /// Every registered device
    pub snapshot: DeviceSnapshot,
    /// Devices matching the hook's role filter, in registration order
    pub matching: Vec<Arc<DeviceInstance>>,
}

/// A callable invoked at a lifecycle phase
#[async_trait]
pub trait Hook: Send + Sync {
    /// Run the hook
    async fn run(&self, context: HookContext) -> anyhow::Result<()>;
}

/// A hook backed by an async closure
pub struct FnHook<F> {
    f: F,
}

impl<F, Fut> FnHook<F>
where
    F: Fn(HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    /// Wrap `f`
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnHook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHook")
            .field("f", &"<function>")
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, context: HookContext) -> anyhow::Result<()> {
        (self.f)(context).await
    }
}

/// Which devices a hook applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleFilter {
    /// Any registered device
    Any,
    /// Devices fulfilling the named contract
    Role(String),
}

impl RoleFilter {
    /// Devices in `snapshot` this filter matches
    pub fn select(&self, snapshot: &DeviceSnapshot) -> Vec<Arc<DeviceInstance>> {
        match self {
            RoleFilter::Any => snapshot.devices().to_vec(),
            RoleFilter::Role(role) => snapshot.by_role(role),
        }
    }
}

impl fmt::Display for RoleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleFilter::Any => f.write_str("*"),
            RoleFilter::Role(role) => f.write_str(role),
        }
    }
}

/// How a hook failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// The failure aborts the phase and forces TEARDOWN
    Critical,
    /// The failure is reported and the phase continues
    Advisory,
}

/// A hook as declared by a plugin, before registration
pub struct HookSpec {
    name: String,
    phase: LifecyclePhase,
    filter: RoleFilter,
    priority: i32,
    criticality: Criticality,
    hook: Arc<dyn Hook>,
}

impl HookSpec {
    /// Declare `hook` for `phase`, applying to any device, advisory, priority 0
    pub fn new<N: Into<String>, H: Hook + 'static>(name: N, phase: LifecyclePhase, hook: H) -> Self {
        Self {
            name: name.into(),
            phase,
            filter: RoleFilter::Any,
            priority: 0,
            criticality: Criticality::Advisory,
            hook: Arc::new(hook),
        }
    }

    /// Declare an async closure as a hook
    pub fn from_fn<N, F, Fut>(name: N, phase: LifecyclePhase, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, phase, FnHook::new(f))
    }

    /// Only run when a device fulfils `role`
    pub fn role<R: Into<String>>(mut self, role: R) -> Self {
        self.filter = RoleFilter::Role(role.into());
        self
    }

    /// Set the ordering priority (higher runs first)
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Abort the run when this hook fails
    pub fn critical(mut self) -> Self {
        self.criticality = Criticality::Critical;
        self
    }
}

/// A registered hook
#[derive(Clone)]
pub struct HookRegistration {
    /// Hook name
    pub name: String,
    /// Plugin that declared the hook
    pub source: String,
    /// Phase the hook runs in
    pub phase: LifecyclePhase,
    /// Devices the hook applies to
    pub filter: RoleFilter,
    /// Ordering priority
    pub priority: i32,
    /// Failure handling
    pub criticality: Criticality,
    /// Registration sequence number
    pub sequence: u64,
    hook: Arc<dyn Hook>,
}

impl HookRegistration {
    /// The callable
    pub fn hook(&self) -> &Arc<dyn Hook> {
        &self.hook
    }

    /// Whether a failure aborts the run
    pub fn is_critical(&self) -> bool {
        self.criticality == Criticality::Critical
    }
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("phase", &self.phase)
            .field("filter", &self.filter)
            .field("priority", &self.priority)
            .field("criticality", &self.criticality)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Every declared hook, in registration order
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<HookRegistration>,
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook on behalf of plugin `source`
    pub fn register(&mut self, source: &str, spec: HookSpec) -> u64 {
        let sequence = self.hooks.len() as u64 + 1;
        self.hooks.push(HookRegistration {
            name: spec.name,
            source: source.to_string(),
            phase: spec.phase,
            filter: spec.filter,
            priority: spec.priority,
            criticality: spec.criticality,
            sequence,
            hook: spec.hook,
        });
        sequence
    }

    /// Hooks for `phase` in execution order: higher priority first, then
    /// registration order
    pub fn for_phase(&self, phase: LifecyclePhase) -> Vec<&HookRegistration> {
        let mut hooks: Vec<&HookRegistration> = self.hooks.iter().filter(|h| h.phase == phase).collect();
        hooks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
        hooks
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hook is registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
