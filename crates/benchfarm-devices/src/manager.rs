/*!
 * Device manager.
 *
 * The runtime table of live device instances for one environment. Writers
 * are serialized and readers never overlap a writer. Lookups return
 * instances in registration order.
 */
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::device::{DeviceError, DeviceInstance, Result};

/// Event types for the device manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device became visible to lookups
    DeviceRegistered {
        /// Device name
        name: String,
        /// Device role
        role: String,
    },
    /// A device was removed from the table
    DeviceUnregistered {
        /// Device name
        name: String,
    },
}

/// Immutable copy of the device table
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    devices: Vec<Arc<DeviceInstance>>,
}

impl DeviceSnapshot {
    /// All devices in registration order
    pub fn devices(&self) -> &[Arc<DeviceInstance>] {
        &self.devices
    }

    /// Devices for `role`, in registration order
    pub fn by_role(&self, role: &str) -> Vec<Arc<DeviceInstance>> {
        self.devices.iter().filter(|d| d.role() == role).cloned().collect()
    }

    /// Device called `name`
    pub fn by_name(&self, name: &str) -> Option<Arc<DeviceInstance>> {
        self.devices.iter().find(|d| d.name() == name).cloned()
    }

    /// Whether any device fills `role`
    pub fn has_role(&self, role: &str) -> bool {
        self.devices.iter().any(|d| d.role() == role)
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Table of live device instances
#[derive(Debug)]
pub struct DeviceManager {
    devices: RwLock<Vec<Arc<DeviceInstance>>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    /// Create an empty manager
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(Vec::new()),
            event_sender,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Arc<DeviceInstance>>>> {
        self.devices.read().map_err(|_| DeviceError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Arc<DeviceInstance>>>> {
        self.devices.write().map_err(|_| DeviceError::LockPoisoned)
    }

    /// Add a live instance
    pub fn register(&self, instance: Arc<DeviceInstance>) -> Result<()> {
        let mut devices = self.write()?;
        if devices.iter().any(|d| d.name() == instance.name()) {
            return Err(DeviceError::DuplicateDevice(instance.name().to_string()));
        }

        let event = RegistryEvent::DeviceRegistered {
            name: instance.name().to_string(),
            role: instance.role().to_string(),
        };
        debug!("Registered device {} as {}", instance.name(), instance.role());
        devices.push(instance);
        drop(devices);

        let _ = self.event_sender.send(event);
        Ok(())
    }

    /// Remove and return the instance called `name`
    pub fn unregister(&self, name: &str) -> Result<Arc<DeviceInstance>> {
        let mut devices = self.write()?;
        let index = devices
            .iter()
            .position(|d| d.name() == name)
            .ok_or_else(|| DeviceError::NotFound(format!("device {}", name)))?;
        let instance = devices.remove(index);
        drop(devices);

        debug!("Unregistered device {}", name);
        let _ = self.event_sender.send(RegistryEvent::DeviceUnregistered {
            name: name.to_string(),
        });
        Ok(instance)
    }

    /// Get the instance called `name`
    pub fn get_by_name(&self, name: &str) -> Result<Arc<DeviceInstance>> {
        self.read()?
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(format!("device {}", name)))
    }

    /// Get every instance fulfilling `role`, in registration order
    pub fn get_by_role(&self, role: &str) -> Result<Vec<Arc<DeviceInstance>>> {
        Ok(self
            .read()?
            .iter()
            .filter(|d| d.role() == role)
            .cloned()
            .collect())
    }

    /// Get the primary instance for `role`
    ///
    /// Falls back to the only instance when none is marked primary.
    pub fn primary(&self, role: &str) -> Result<Arc<DeviceInstance>> {
        let candidates = self.get_by_role(role)?;
        if let Some(marked) = candidates.iter().find(|d| d.is_primary()) {
            return Ok(marked.clone());
        }
        match candidates.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(DeviceError::NotFound(format!("no device for role {}", role))),
            many => Err(DeviceError::NotFound(format!(
                "{} devices for role {} and none marked primary",
                many.len(),
                role
            ))),
        }
    }

    /// Copy the table
    pub fn snapshot(&self) -> Result<DeviceSnapshot> {
        Ok(DeviceSnapshot {
            devices: self.read()?.clone(),
        })
    }

    /// Names in registration order
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.read()?.iter().map(|d| d.name().to_string()).collect())
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Whether no instance is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to registration events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Unregister and close every instance, last registered first
    pub async fn clear(&self) -> Result<Vec<String>> {
        let names = self.names()?;
        let mut closed = Vec::with_capacity(names.len());
        for name in names.iter().rev() {
            let instance = self.unregister(name)?;
            instance.close().await;
            closed.push(name.clone());
        }
        if !closed.is_empty() {
            info!("Closed {} devices", closed.len());
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stub_instance;
    use std::thread;

    #[tokio::test]
    async fn test_register_and_lookup() -> Result<()> {
        let manager = DeviceManager::new();
        manager.register(stub_instance("board", "CPE", false).await?)?;
        manager.register(stub_instance("lan", "LAN", false).await?)?;

        assert_eq!(manager.get_by_name("board")?.role(), "CPE");
        assert_eq!(manager.len(), 2);
        assert!(matches!(manager.get_by_name("wan"), Err(DeviceError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() -> Result<()> {
        let manager = DeviceManager::new();
        manager.register(stub_instance("lan", "LAN", false).await?)?;
        let result = manager.register(stub_instance("lan", "LAN", false).await?);
        assert!(matches!(result, Err(DeviceError::DuplicateDevice(name)) if name == "lan"));
        assert_eq!(manager.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_role_lookup_keeps_registration_order() -> Result<()> {
        let manager = DeviceManager::new();
        manager.register(stub_instance("lan2", "LAN", false).await?)?;
        manager.register(stub_instance("board", "CPE", false).await?)?;
        manager.register(stub_instance("lan1", "LAN", false).await?)?;

        let names: Vec<String> = manager
            .get_by_role("LAN")?
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["lan2", "lan1"]);
        assert!(manager.get_by_role("ACS")?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_primary_selection() -> Result<()> {
        let manager = DeviceManager::new();
        manager.register(stub_instance("board", "CPE", false).await?)?;
        manager.register(stub_instance("lan1", "LAN", false).await?)?;
        manager.register(stub_instance("lan2", "LAN", true).await?)?;
        manager.register(stub_instance("wan1", "WAN", false).await?)?;
        manager.register(stub_instance("wan2", "WAN", false).await?)?;

        assert_eq!(manager.primary("CPE")?.name(), "board");
        assert_eq!(manager.primary("LAN")?.name(), "lan2");
        assert!(matches!(manager.primary("WAN"), Err(DeviceError::NotFound(_))));
        assert!(matches!(manager.primary("ACS"), Err(DeviceError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_unregister_and_events() -> Result<()> {
        let manager = DeviceManager::new();
        let mut events = manager.subscribe();

        manager.register(stub_instance("acs", "ACS", false).await?)?;
        let removed = manager.unregister("acs")?;
        assert_eq!(removed.name(), "acs");
        assert!(manager.is_empty());
        assert!(matches!(manager.unregister("acs"), Err(DeviceError::NotFound(_))));

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::DeviceRegistered {
                name: "acs".to_string(),
                role: "ACS".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::DeviceUnregistered {
                name: "acs".to_string()
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() -> Result<()> {
        let manager = DeviceManager::new();
        manager.register(stub_instance("board", "CPE", false).await?)?;
        let snapshot = manager.snapshot()?;

        manager.register(stub_instance("lan", "LAN", false).await?)?;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.has_role("CPE"));
        assert!(!snapshot.has_role("LAN"));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_readers() -> Result<()> {
        let manager = Arc::new(DeviceManager::new());
        manager.register(stub_instance("board", "CPE", false).await?)?;

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || manager.get_by_name("board").map(|d| d.name().to_string()))
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.join().unwrap()?, "board");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_closes_in_reverse_order() -> Result<()> {
        let manager = DeviceManager::new();
        let first = stub_instance("first", "LAN", false).await?;
        manager.register(first.clone())?;
        manager.register(stub_instance("second", "WAN", false).await?)?;

        let closed = manager.clear().await?;
        assert_eq!(closed, vec!["second", "first"]);
        assert!(manager.is_empty());
        assert!(!first.session().await.is_open());
        Ok(())
    }
}
