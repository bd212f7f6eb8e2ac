/*!
 * Plugin registry and resolution engine.
 *
 * Plugins offer implementations for contracts as bindings. Resolution picks
 * exactly one applicable binding per contract: the highest priority wins,
 * and among equal priorities the most recently registered one. Losing
 * candidates are reported as an override, never as an error.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use benchfarm_core::event::SharedEventBus;

use crate::descriptor::DeviceDescriptor;
use crate::device::{Device, DeviceConstructor, DeviceError, Result};
use crate::requirements::{EnvironmentRequirements, RoleRequirements};
use crate::template::{CapabilityContract, TemplateRegistry};

/// Predicate deciding whether a binding applies to a role's requirements
pub type Applicability = Arc<dyn Fn(&RoleRequirements) -> bool + Send + Sync>;

/// A binding as offered by a plugin, before registration
pub struct BindingSpec {
    contract: String,
    implementation: String,
    constructor: DeviceConstructor,
    priority: i32,
    applicability: Option<Applicability>,
}

impl BindingSpec {
    /// Offer `constructor` as an implementation of `contract`
    pub fn new<C, I>(contract: C, implementation: I, constructor: DeviceConstructor) -> Self
    where
        C: Into<String>,
        I: Into<String>,
    {
        Self {
            contract: contract.into(),
            implementation: implementation.into(),
            constructor,
            priority: 0,
            applicability: None,
        }
    }

    /// Set the priority (higher wins)
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict the binding to environments whose role requirements satisfy `predicate`
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RoleRequirements) -> bool + Send + Sync + 'static,
    {
        self.applicability = Some(Arc::new(predicate));
        self
    }

    /// Contract this binding targets
    pub fn contract(&self) -> &str {
        &self.contract
    }
}

impl fmt::Debug for BindingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingSpec")
            .field("contract", &self.contract)
            .field("implementation", &self.implementation)
            .field("priority", &self.priority)
            .field("conditional", &self.applicability.is_some())
            .finish()
    }
}

/// Read-only view of a registered binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSummary {
    /// Contract name
    pub contract: String,
    /// Implementation name
    pub implementation: String,
    /// Plugin that registered the binding
    pub source: String,
    /// Selection priority
    pub priority: i32,
    /// Registration sequence number, unique per registry
    pub sequence: u64,
}

impl fmt::Display for BindingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {} (priority {}, #{})",
            self.implementation, self.source, self.priority, self.sequence
        )
    }
}

/// A registered binding
#[derive(Clone)]
pub struct ImplementationBinding {
    summary: BindingSummary,
    constructor: DeviceConstructor,
    applicability: Option<Applicability>,
}

impl ImplementationBinding {
    /// Summary of the binding
    pub fn summary(&self) -> &BindingSummary {
        &self.summary
    }

    /// Whether the binding applies to `requirements`
    pub fn applies_to(&self, requirements: &RoleRequirements) -> bool {
        self.applicability
            .as_ref()
            .map_or(true, |predicate| predicate(requirements))
    }

    /// Build a device for `descriptor`
    pub fn construct(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Device>> {
        (self.constructor)(descriptor)
    }

    fn selection_key(&self) -> (i32, u64) {
        (self.summary.priority, self.summary.sequence)
    }
}

impl fmt::Debug for ImplementationBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationBinding")
            .field("summary", &self.summary)
            .field("conditional", &self.applicability.is_some())
            .finish()
    }
}

/// Outcome of resolving one contract
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The contract that was resolved
    pub contract: Arc<CapabilityContract>,
    /// The winning binding
    pub selected: ImplementationBinding,
    /// Applicable candidates that lost, best first
    pub discarded: Vec<BindingSummary>,
}

/// Events published by the resolution engine
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionEvent {
    /// Several bindings applied and one overrode the others
    Override {
        /// Contract name
        contract: String,
        /// The selected binding
        selected: BindingSummary,
        /// The candidates that lost
        discarded: Vec<BindingSummary>,
    },
}

/// Registry of contracts and their bindings
#[derive(Debug, Default)]
pub struct PluginRegistry {
    templates: TemplateRegistry,
    bindings: BTreeMap<String, Vec<ImplementationBinding>>,
    next_sequence: u64,
    event_bus: Option<SharedEventBus>,
}

impl PluginRegistry {
    /// Create a registry over `templates`
    pub fn new(templates: TemplateRegistry) -> Self {
        Self {
            templates,
            ..Self::default()
        }
    }

    /// Publish override events on `bus`
    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// The contract registry
    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Declare a contract
    pub fn declare_contract<N, O, P>(&mut self, name: N, operations: O, properties: P) -> Result<Arc<CapabilityContract>>
    where
        N: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        self.templates.declare(name, operations, properties)
    }

    /// Register a binding on behalf of plugin `source`
    ///
    /// The contract must already be declared.
    pub fn register_binding(&mut self, source: &str, spec: BindingSpec) -> Result<BindingSummary> {
        self.templates.lookup(&spec.contract)?;

        self.next_sequence += 1;
        let summary = BindingSummary {
            contract: spec.contract,
            implementation: spec.implementation,
            source: source.to_string(),
            priority: spec.priority,
            sequence: self.next_sequence,
        };
        debug!("Registered binding {} for {}", summary, summary.contract);

        self.bindings
            .entry(summary.contract.clone())
            .or_default()
            .push(ImplementationBinding {
                summary: summary.clone(),
                constructor: spec.constructor,
                applicability: spec.applicability,
            });
        Ok(summary)
    }

    /// Bindings registered for `contract`, in registration order
    pub fn bindings(&self, contract: &str) -> Vec<BindingSummary> {
        self.bindings
            .get(contract)
            .map(|list| list.iter().map(|b| b.summary.clone()).collect())
            .unwrap_or_default()
    }

    /// Select the binding for `contract` under `requirements`
    pub fn resolve(&self, contract: &str, requirements: &EnvironmentRequirements) -> Result<Resolution> {
        let declared = self.templates.lookup(contract)?;
        let role = requirements.role(contract);
        let registered = self.bindings.get(contract).map(Vec::as_slice).unwrap_or_default();

        let mut candidates: Vec<&ImplementationBinding> =
            registered.iter().filter(|b| b.applies_to(&role)).collect();
        // best first: highest priority, then latest registration
        candidates.sort_by(|a, b| b.selection_key().cmp(&a.selection_key()));

        let (selected, losers) = match candidates.split_first() {
            Some((selected, losers)) => (*selected, losers),
            None => {
                return Err(DeviceError::NoCandidate {
                    contract: contract.to_string(),
                    registered: registered.len(),
                })
            }
        };
        let discarded: Vec<BindingSummary> = losers.iter().map(|b| b.summary.clone()).collect();

        if discarded.is_empty() {
            debug!("Resolved {} to {}", contract, selected.summary);
        } else {
            let names: Vec<String> = discarded.iter().map(ToString::to_string).collect();
            info!(
                "Resolved {} to {}, overriding {}",
                contract,
                selected.summary,
                names.join(", ")
            );
            if let Some(bus) = &self.event_bus {
                let event = ResolutionEvent::Override {
                    contract: contract.to_string(),
                    selected: selected.summary.clone(),
                    discarded: discarded.clone(),
                };
                if let Err(e) = bus.publish(event) {
                    warn!("Could not publish override event: {}", e);
                }
            }
        }

        Ok(Resolution {
            contract: declared,
            selected: selected.clone(),
            discarded,
        })
    }
}
