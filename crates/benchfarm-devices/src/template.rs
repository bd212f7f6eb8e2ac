/*!
 * Device templates.
 *
 * A template is a named capability contract: the operations and properties
 * any implementation of an abstract role must provide. Templates carry no
 * behavior.
 */
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{DeviceError, Result};

/// Well-known role names
pub mod roles {
    /// Customer premises equipment: the board under test
    pub const CPE: &str = "CPE";
    /// LAN-side client
    pub const LAN: &str = "LAN";
    /// WAN-side server
    pub const WAN: &str = "WAN";
    /// TR-069 auto-configuration server
    pub const ACS: &str = "ACS";
    /// Power distribution unit
    pub const PDU: &str = "PDU";
}

/// Abstract role description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityContract {
    name: String,
    operations: BTreeSet<String>,
    properties: BTreeSet<String>,
}

impl CapabilityContract {
    /// Create a new contract
    pub fn new<N, O, P>(name: N, operations: O, properties: P) -> Self
    where
        N: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            name: name.into(),
            operations: operations.into_iter().map(Into::into).collect(),
            properties: properties.into_iter().map(Into::into).collect(),
        }
    }

    /// Get the contract name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the required operations
    pub fn operations(&self) -> &BTreeSet<String> {
        &self.operations
    }

    /// Get the required properties
    pub fn properties(&self) -> &BTreeSet<String> {
        &self.properties
    }

    /// Whether the contract requires the given operation
    pub fn requires_operation(&self, operation: &str) -> bool {
        self.operations.contains(operation)
    }

    fn same_shape(&self, other: &CapabilityContract) -> bool {
        self.operations == other.operations && self.properties == other.properties
    }
}

/// Registry of declared contracts
#[derive(Debug, Default, Clone)]
pub struct TemplateRegistry {
    contracts: BTreeMap<String, Arc<CapabilityContract>>,
}

impl TemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the standard lab roles
    pub fn with_builtin_templates() -> Self {
        let mut registry = Self::new();
        for contract in builtin_templates() {
            registry
                .contracts
                .insert(contract.name().to_string(), Arc::new(contract));
        }
        registry
    }

    /// Declare a contract
    ///
    /// Declaring the same name twice is accepted when the shape is identical.
    pub fn declare<N, O, P>(&mut self, name: N, operations: O, properties: P) -> Result<Arc<CapabilityContract>>
    where
        N: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        let contract = CapabilityContract::new(name, operations, properties);

        if let Some(existing) = self.contracts.get(contract.name()) {
            if existing.same_shape(&contract) {
                return Ok(existing.clone());
            }
            return Err(DeviceError::DuplicateContract(contract.name().to_string()));
        }

        debug!(
            "Declared contract {} ({} operations, {} properties)",
            contract.name(),
            contract.operations().len(),
            contract.properties().len()
        );
        let contract = Arc::new(contract);
        self.contracts
            .insert(contract.name().to_string(), contract.clone());
        Ok(contract)
    }

    /// Look up a contract by name
    pub fn lookup(&self, name: &str) -> Result<Arc<CapabilityContract>> {
        self.contracts
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownContract(name.to_string()))
    }

    /// Whether a contract has been declared
    pub fn contains(&self, name: &str) -> bool {
        self.contracts.contains_key(name)
    }

    /// Names of all declared contracts, sorted
    pub fn names(&self) -> Vec<&str> {
        self.contracts.keys().map(String::as_str).collect()
    }
}

fn builtin_templates() -> Vec<CapabilityContract> {
    let no_properties: [&str; 0] = [];
    vec![
        CapabilityContract::new(
            roles::CPE,
            ["run_command", "get_interface_ipv4"],
            ["hw_model"],
        ),
        CapabilityContract::new(roles::LAN, ["run_command"], no_properties),
        CapabilityContract::new(roles::WAN, ["run_command"], no_properties),
        CapabilityContract::new(roles::ACS, ["run_command"], no_properties),
        CapabilityContract::new(
            roles::PDU,
            ["power_on", "power_off", "power_cycle"],
            no_properties,
        ),
    ]
}
