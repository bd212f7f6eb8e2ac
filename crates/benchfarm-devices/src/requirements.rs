/*!
 * Environment requirements.
 *
 * Maps each role to the capability attributes a run needs from it, e.g.
 * `{"roles": {"CPE": {"provisioning_mode": "dual"}}}`. Binding
 * applicability predicates are evaluated against the role's entry.
 */
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use benchfarm_core::types::{Metadata, Value};

use crate::device::{DeviceError, Result};

/// Requirements for one role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleRequirements(Metadata);

impl RoleRequirements {
    /// Create an empty requirement set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required attribute
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Get a required attribute
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether the requirement `key` equals `value` (or lists it)
    pub fn requires(&self, key: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        self.0.get(key).is_some_and(|v| v.contains(&value))
    }

    /// Whether nothing is required
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All attributes
    pub fn attributes(&self) -> &Metadata {
        &self.0
    }
}

/// Requirements for a whole environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRequirements {
    /// Requirements keyed by role name
    #[serde(default)]
    pub roles: BTreeMap<String, RoleRequirements>,
}

impl EnvironmentRequirements {
    /// Create an empty requirement set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add requirements for a role
    pub fn with_role<R: Into<String>>(mut self, role: R, requirements: RoleRequirements) -> Self {
        self.roles.insert(role.into(), requirements);
        self
    }

    /// Requirements for `role`; roles not mentioned have none
    pub fn role(&self, role: &str) -> RoleRequirements {
        self.roles.get(role).cloned().unwrap_or_default()
    }

    /// Roles the environment asks for
    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    /// Parse requirements from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DeviceError::InvalidDescriptor(format!("requirements: {}", e)))
    }

    /// Load requirements from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| DeviceError::Core(e.into()))?;
        Self::from_json_str(&text)
    }
}
