/*!
 * Environment context.
 *
 * The object test code receives once setup reaches READY. It scopes the
 * device manager to one run; nothing here is process-wide.
 */
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use benchfarm_core::types::Id;
use benchfarm_devices::{DeviceInstance, DeviceManager, DeviceSnapshot, EnvironmentRequirements};

use crate::dispatcher::{LifecycleDispatcher, PhaseReport};
use crate::error::Result;
use crate::phase::LifecyclePhase;

/// Outcome of dismantling an environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownReport {
    /// TEARDOWN phase report
    pub phase: Option<PhaseReport>,
    /// Devices closed, last acquired first
    pub closed: Vec<String>,
}

/// A ready environment
#[derive(Debug)]
pub struct Environment {
    requirements: EnvironmentRequirements,
    manager: Arc<DeviceManager>,
    dispatcher: LifecycleDispatcher,
    reports: Vec<PhaseReport>,
}

impl Environment {
    pub(crate) fn new(
        requirements: EnvironmentRequirements,
        manager: Arc<DeviceManager>,
        dispatcher: LifecycleDispatcher,
        reports: Vec<PhaseReport>,
    ) -> Self {
        Self {
            requirements,
            manager,
            dispatcher,
            reports,
        }
    }

    /// Identifier of this run
    pub fn run_id(&self) -> &Id {
        self.dispatcher.run_id()
    }

    /// Requirements the environment was built for
    pub fn requirements(&self) -> &EnvironmentRequirements {
        &self.requirements
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Option<LifecyclePhase> {
        self.dispatcher.current()
    }

    /// Reports of the setup phases, in order
    pub fn reports(&self) -> &[PhaseReport] {
        &self.reports
    }

    /// Advisory hook failures collected during setup
    pub fn warnings(&self) -> Vec<String> {
        self.reports
            .iter()
            .flat_map(|report| {
                report
                    .failures
                    .iter()
                    .map(move |f| format!("{} hook {}: {}", report.phase, f.hook, f.reason))
            })
            .collect()
    }

    /// The device manager of this run
    pub fn devices(&self) -> &DeviceManager {
        &self.manager
    }

    /// Get the device called `name`
    pub fn get_by_name(&self, name: &str) -> Result<Arc<DeviceInstance>> {
        Ok(self.manager.get_by_name(name)?)
    }

    /// Get every device fulfilling `role`, in registration order
    pub fn get_by_role(&self, role: &str) -> Result<Vec<Arc<DeviceInstance>>> {
        Ok(self.manager.get_by_role(role)?)
    }

    /// Get the primary device for `role`
    pub fn primary(&self, role: &str) -> Result<Arc<DeviceInstance>> {
        Ok(self.manager.primary(role)?)
    }

    /// Copy of the device table
    pub fn snapshot(&self) -> Result<DeviceSnapshot> {
        Ok(self.manager.snapshot()?)
    }

    /// Run TEARDOWN hooks, then unregister and close every device, last
    /// acquired first
    pub async fn teardown(mut self) -> Result<TeardownReport> {
        info!("Tearing down environment {}", self.run_id());
        let snapshot = self.manager.snapshot()?;
        let phase = self.dispatcher.teardown(&snapshot).await;
        drop(snapshot);

        let closed = self.manager.clear().await?;
        Ok(TeardownReport { phase, closed })
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.manager.is_empty() {
            warn!(
                "Environment {} dropped with {} open device(s); call teardown() to close them",
                self.dispatcher.run_id(),
                self.manager.len()
            );
        }
    }
}
