/*!
 * Inventory descriptors.
 *
 * The inventory lists the devices of one lab environment: name, role,
 * optional primary marker, free-form attributes and connection parameters.
 * It is parsed and validated once at load time and never changes afterwards.
 */
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use benchfarm_core::types::{Metadata, Value};

use crate::connection::ConnectionParams;
use crate::device::{DeviceError, Result};

/// One inventory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device name, unique within the inventory
    pub name: String,
    /// Role (contract name) the device fills
    pub role: String,
    /// Preferred instance among devices sharing a role
    #[serde(default)]
    pub primary: bool,
    /// Free-form device attributes (hardware model, container name, ...)
    #[serde(default)]
    pub attributes: Metadata,
    /// Transport parameters
    pub connection: ConnectionParams,
}

impl DeviceDescriptor {
    /// Create a descriptor without attributes
    pub fn new<N: Into<String>, R: Into<String>>(name: N, role: R, connection: ConnectionParams) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            primary: false,
            attributes: Metadata::new(),
            connection,
        }
    }

    /// Mark the descriptor as the primary for its role
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Add an attribute
    pub fn with_attribute<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Check the record on its own
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DeviceError::InvalidDescriptor("device name must not be empty".to_string()));
        }
        if self.role.trim().is_empty() {
            return Err(DeviceError::InvalidDescriptor(format!("device {} has no role", self.name)));
        }
        self.connection
            .validate()
            .map_err(|e| DeviceError::InvalidDescriptor(format!("device {}: {}", self.name, e)))
    }
}

#[derive(Deserialize)]
struct InventoryFile {
    devices: Vec<DeviceDescriptor>,
}

/// Validated, immutable device inventory
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    devices: Vec<Arc<DeviceDescriptor>>,
}

impl Inventory {
    /// Build an inventory, rejecting invalid records and duplicate names
    pub fn from_descriptors<I: IntoIterator<Item = DeviceDescriptor>>(descriptors: I) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut devices = Vec::new();

        for descriptor in descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.name.clone()) {
                return Err(DeviceError::InvalidDescriptor(format!(
                    "duplicate device name {}",
                    descriptor.name
                )));
            }
            devices.push(Arc::new(descriptor));
        }

        debug!("Loaded inventory with {} devices", devices.len());
        Ok(Self { devices })
    }

    /// Parse an inventory from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: InventoryFile = serde_json::from_str(json)
            .map_err(|e| DeviceError::InvalidDescriptor(format!("inventory: {}", e)))?;
        Self::from_descriptors(file.devices)
    }

    /// Load an inventory from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DeviceError::Core(e.into()))?;
        Self::from_json_str(&text)
    }

    /// Devices in declared order
    pub fn devices(&self) -> &[Arc<DeviceDescriptor>] {
        &self.devices
    }

    /// Find a device by name
    pub fn get(&self, name: &str) -> Option<&Arc<DeviceDescriptor>> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the inventory is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Roles present in the inventory
    pub fn roles(&self) -> BTreeSet<&str> {
        self.devices.iter().map(|d| d.role.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportKind;
    use std::io::Write;

    const INVENTORY: &str = r#"{
        "devices": [
            {
                "name": "board",
                "role": "CPE",
                "attributes": {"hw_model": "rpi4"},
                "connection": {"transport": "serial", "device_command": "cu -l /dev/ttyUSB0 -s 115200"}
            },
            {
                "name": "lan",
                "role": "LAN",
                "primary": true,
                "connection": {"transport": "ssh", "host": "10.64.38.2", "username": "root", "password": "bigfoot1", "port": 4001}
            },
            {
                "name": "lan2",
                "role": "LAN",
                "connection": {"transport": "ssh", "host": "10.64.38.2", "username": "root", "password": "bigfoot1", "port": 4002}
            }
        ]
    }"#;

    #[test]
    fn test_parse_inventory() -> Result<()> {
        let inventory = Inventory::from_json_str(INVENTORY)?;
        assert_eq!(inventory.len(), 3);

        let names: Vec<&str> = inventory.devices().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["board", "lan", "lan2"]);

        let board = inventory.get("board").unwrap();
        assert_eq!(board.connection.kind(), TransportKind::Serial);
        assert_eq!(board.attributes.get("hw_model").and_then(|v| v.as_str()), Some("rpi4"));
        assert!(!board.primary);
        assert!(inventory.get("lan").unwrap().primary);

        assert_eq!(inventory.roles().into_iter().collect::<Vec<_>>(), vec!["CPE", "LAN"]);
        Ok(())
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"{"devices": [
            {"name": "wan", "role": "WAN", "connection": {"transport": "cli-exec", "executable": "/bin/sh"}},
            {"name": "wan", "role": "WAN", "connection": {"transport": "cli-exec", "executable": "/bin/sh"}}
        ]}"#;
        assert!(matches!(
            Inventory::from_json_str(json),
            Err(DeviceError::InvalidDescriptor(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_connection_parameters_validated_at_load() {
        let json = r#"{"devices": [
            {"name": "acs", "role": "ACS", "connection": {"transport": "ssh", "host": "acs", "username": "admin", "port": 22}}
        ]}"#;
        assert!(matches!(
            Inventory::from_json_str(json),
            Err(DeviceError::InvalidDescriptor(msg)) if msg.contains("acs")
        ));
    }

    #[test]
    fn test_from_json_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(INVENTORY.as_bytes()).unwrap();

        let inventory = Inventory::from_json_file(file.path())?;
        assert_eq!(inventory.len(), 3);
        Ok(())
    }
}
