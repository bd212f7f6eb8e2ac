/*!
 * Lifecycle phases of an environment run.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered phases of an environment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    /// Devices are registered, nothing has been touched yet
    Init,
    /// Preparation before boot (power, images)
    PreBoot,
    /// Boot the devices
    Boot,
    /// Provision the devices
    Provision,
    /// Checks after provisioning
    PostBoot,
    /// Environment handed to tests
    Ready,
    /// Environment is being dismantled
    Teardown,
}

impl LifecyclePhase {
    /// Phases of a successful setup, in order
    pub const SETUP: [LifecyclePhase; 6] = [
        LifecyclePhase::Init,
        LifecyclePhase::PreBoot,
        LifecyclePhase::Boot,
        LifecyclePhase::Provision,
        LifecyclePhase::PostBoot,
        LifecyclePhase::Ready,
    ];

    /// The phase that follows this one in a successful run
    pub fn next(&self) -> Option<LifecyclePhase> {
        match self {
            LifecyclePhase::Init => Some(LifecyclePhase::PreBoot),
            LifecyclePhase::PreBoot => Some(LifecyclePhase::Boot),
            LifecyclePhase::Boot => Some(LifecyclePhase::Provision),
            LifecyclePhase::Provision => Some(LifecyclePhase::PostBoot),
            LifecyclePhase::PostBoot => Some(LifecyclePhase::Ready),
            LifecyclePhase::Ready => Some(LifecyclePhase::Teardown),
            LifecyclePhase::Teardown => None,
        }
    }

    /// Phase name
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Init => "INIT",
            LifecyclePhase::PreBoot => "PRE_BOOT",
            LifecyclePhase::Boot => "BOOT",
            LifecyclePhase::Provision => "PROVISION",
            LifecyclePhase::PostBoot => "POST_BOOT",
            LifecyclePhase::Ready => "READY",
            LifecyclePhase::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_phases_chain() {
        for pair in LifecyclePhase::SETUP.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(LifecyclePhase::Ready.next(), Some(LifecyclePhase::Teardown));
        assert_eq!(LifecyclePhase::Teardown.next(), None);
    }

    #[test]
    fn test_serialized_names() {
        let json = serde_json::to_string(&LifecyclePhase::PostBoot).unwrap();
        assert_eq!(json, "\"POST_BOOT\"");
        assert_eq!(LifecyclePhase::PreBoot.to_string(), "PRE_BOOT");
    }
}
