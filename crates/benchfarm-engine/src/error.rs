/*!
 * Error types for the benchfarm engine crate.
 */
use std::fmt;

use thiserror::Error;

use crate::phase::LifecyclePhase;

/// Error type for benchfarm engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// The phase has already been run in this environment run
    #[error("Phase {0} has already been run")]
    PhaseAlreadyRun(LifecyclePhase),

    /// The phase cannot be entered from the current one
    #[error("Cannot enter {to} from {}", origin(.from))]
    InvalidTransition {
        /// Phase the run is in, if any
        from: Option<LifecyclePhase>,
        /// Phase that was requested
        to: LifecyclePhase,
    },

    /// A lifecycle hook failed or timed out
    #[error("Hook {hook} failed in {phase} ({}): {reason}", criticality(.critical))]
    HookFailed {
        /// Hook name
        hook: String,
        /// Phase the hook ran in
        phase: LifecyclePhase,
        /// Whether the failure aborts the run
        critical: bool,
        /// Failure description
        reason: String,
    },

    /// Setup was cancelled by the caller
    #[error("Environment setup cancelled")]
    Cancelled,

    /// A plugin could not register its contributions
    #[error("Plugin {plugin} failed to register: {reason}")]
    Plugin {
        /// Plugin name
        plugin: String,
        /// Failure description
        reason: String,
    },

    /// Environment setup failed and was rolled back
    #[error(transparent)]
    Setup(#[from] EnvironmentSetupError),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] benchfarm_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] benchfarm_core::error::Error),
}

/// Result type for benchfarm engine operations
pub type Result<T> = std::result::Result<T, Error>;

fn origin(from: &Option<LifecyclePhase>) -> &'static str {
    from.map_or("the start of the run", |phase| phase.as_str())
}

fn criticality(critical: &bool) -> &'static str {
    if *critical {
        "critical"
    } else {
        "advisory"
    }
}

/// Aggregate failure of an environment setup
///
/// Carries every cause in the order it was observed and the devices that
/// were rolled back, in the order they were closed.
#[derive(Error, Debug)]
pub struct EnvironmentSetupError {
    /// Everything that went wrong, first cause first
    pub causes: Vec<Error>,
    /// Devices unregistered and closed, last acquired first
    pub rolled_back: Vec<String>,
}

impl EnvironmentSetupError {
    /// The failure that aborted the setup
    pub fn primary(&self) -> Option<&Error> {
        self.causes.first()
    }
}

impl fmt::Display for EnvironmentSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Environment setup failed")?;
        if let Some(first) = self.primary() {
            write!(f, ": {}", first)?;
        }
        if self.causes.len() > 1 {
            write!(f, " (+{} more)", self.causes.len() - 1)?;
        }
        if !self.rolled_back.is_empty() {
            write!(f, "; rolled back {}", self.rolled_back.join(", "))?;
        }
        Ok(())
    }
}
