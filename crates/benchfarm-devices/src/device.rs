/*!
 * Device trait and live device instances.
 *
 * A [`Device`] is the concrete implementation a binding constructs for an
 * inventory entry. A [`DeviceInstance`] pairs that object with the contract
 * it fulfils and the connection session it exclusively owns; it is the unit
 * the device manager stores and test code talks to.
 */
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use benchfarm_core::{
    error::Error as CoreError,
    types::{Metadata, Value},
};

use crate::binding::BindingSummary;
use crate::connection::{
    CommandOutput, ConnectionError, ConnectionSession, PatternMatch, SessionState, TransportKind,
};
use crate::descriptor::DeviceDescriptor;
use crate::template::CapabilityContract;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No contract with this name has been declared
    #[error("Unknown contract: {0}")]
    UnknownContract(String),

    /// A contract with this name exists with a different shape
    #[error("Contract {0} already declared with a different shape")]
    DuplicateContract(String),

    /// No applicable binding exists for the contract
    #[error("No candidate implementation for contract {contract} ({registered} registered, none applicable)")]
    NoCandidate {
        /// The contract being resolved
        contract: String,
        /// Number of bindings registered for the contract
        registered: usize,
    },

    /// A constructed device does not provide what its contract requires
    #[error("Device {device} does not satisfy contract {contract}: missing {missing:?}")]
    ContractNotSatisfied {
        /// The device name
        device: String,
        /// The contract name
        contract: String,
        /// Missing operations and properties
        missing: Vec<String>,
    },

    /// Opening or using a transport failed
    #[error("Connection to {device} over {transport} failed: {source}")]
    Connection {
        /// The device name
        device: String,
        /// The transport kind
        transport: TransportKind,
        /// The underlying connection error
        #[source]
        source: ConnectionError,
    },

    /// A live device with this name is already registered
    #[error("Device {0} is already registered")]
    DuplicateDevice(String),

    /// No live device matches the lookup
    #[error("Not found: {0}")]
    NotFound(String),

    /// An inventory entry is malformed
    #[error("Invalid device descriptor: {0}")]
    InvalidDescriptor(String),

    /// The operation is not offered by this device
    #[error("Operation {operation} not supported by device {device}")]
    OperationNotSupported {
        /// The device name
        device: String,
        /// The requested operation
        operation: String,
    },

    /// The device ran the operation but it did not succeed
    #[error("Operation {operation} on device {device} failed: {reason}")]
    OperationFailed {
        /// The device name
        device: String,
        /// The requested operation
        operation: String,
        /// Why it failed
        reason: String,
    },

    /// The device is in an invalid state for the operation
    #[error("Invalid device state: {0}")]
    InvalidState(String),

    /// The device registry lock was poisoned
    #[error("Device registry lock poisoned")]
    LockPoisoned,

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Wrap a connection error with the device and transport it concerns
    pub fn connection(device: &str, transport: TransportKind, source: ConnectionError) -> Self {
        DeviceError::Connection {
            device: device.to_string(),
            transport,
            source,
        }
    }

    /// Create an operation failure
    pub fn operation_failed<S: Into<String>>(device: &str, operation: &str, reason: S) -> Self {
        DeviceError::OperationFailed {
            device: device.to_string(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error came from a timed-out transport exchange
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Connection { source, .. } if source.is_timeout())
    }
}

/// The core device trait
///
/// Implementations hold no transport of their own: every operation receives
/// the session owned by the instance, so only the owning instance can drive
/// the transport.
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// The inventory record this device was built from
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Get the device name
    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Name of the concrete implementation, for diagnostics
    fn implementation(&self) -> &'static str;

    /// Operations this implementation can execute
    fn operations(&self) -> &[&'static str];

    /// Properties this implementation exposes
    fn properties(&self) -> Metadata {
        self.descriptor().attributes.clone()
    }

    /// Check that this device provides everything `contract` requires
    fn satisfies(&self, contract: &CapabilityContract) -> Result<()> {
        let properties = self.properties();
        let mut missing: Vec<String> = contract
            .operations()
            .iter()
            .filter(|op| !self.operations().contains(&op.as_str()))
            .map(|op| format!("operation {}", op))
            .collect();
        missing.extend(
            contract
                .properties()
                .iter()
                .filter(|prop| !properties.contains_key(prop.as_str()))
                .map(|prop| format!("property {}", prop)),
        );

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DeviceError::ContractNotSatisfied {
                device: self.name().to_string(),
                contract: contract.name().to_string(),
                missing,
            })
        }
    }

    /// Execute an operation over the owning instance's session
    async fn execute(
        &self,
        session: &mut ConnectionSession,
        operation: &str,
        args: &[Value],
    ) -> Result<Value>;

    /// Access the concrete type
    fn as_any(&self) -> &dyn Any;
}

/// Constructor a binding uses to build a device from its inventory record
pub type DeviceConstructor =
    Arc<dyn Fn(&DeviceDescriptor) -> Result<Arc<dyn Device>> + Send + Sync>;

/// Fetch a string argument by position
pub fn string_arg<'a>(device: &str, operation: &str, args: &'a [Value], index: usize) -> Result<&'a str> {
    args.get(index).and_then(Value::as_str).ok_or_else(|| {
        DeviceError::operation_failed(
            device,
            operation,
            format!("expected a string argument at position {}", index),
        )
    })
}

/// A resolved, connected device
///
/// Instances exist only with a session that reached `Open`; the constructor
/// refuses anything else.
#[derive(Debug)]
pub struct DeviceInstance {
    descriptor: Arc<DeviceDescriptor>,
    contract: Arc<CapabilityContract>,
    binding: BindingSummary,
    device: Arc<dyn Device>,
    session: Mutex<ConnectionSession>,
}

impl DeviceInstance {
    /// Create a new instance around an open session
    pub fn new(
        descriptor: Arc<DeviceDescriptor>,
        contract: Arc<CapabilityContract>,
        binding: BindingSummary,
        device: Arc<dyn Device>,
        session: ConnectionSession,
    ) -> Result<Self> {
        if session.state() != SessionState::Open {
            return Err(DeviceError::InvalidState(format!(
                "session for {} is {:?}, expected Open",
                descriptor.name,
                session.state()
            )));
        }
        if session.owner() != descriptor.name {
            return Err(DeviceError::InvalidState(format!(
                "session owned by {} cannot be attached to {}",
                session.owner(),
                descriptor.name
            )));
        }

        Ok(Self {
            descriptor,
            contract,
            binding,
            device,
            session: Mutex::new(session),
        })
    }

    /// Get the device name
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Get the role (contract name) this instance fulfils
    pub fn role(&self) -> &str {
        self.contract.name()
    }

    /// Whether the inventory marks this instance as the primary for its role
    pub fn is_primary(&self) -> bool {
        self.descriptor.primary
    }

    /// Get the inventory record
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Get the fulfilled contract
    pub fn contract(&self) -> &CapabilityContract {
        &self.contract
    }

    /// Get the binding that produced this instance
    pub fn binding(&self) -> &BindingSummary {
        &self.binding
    }

    /// Get the concrete device object
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Downcast the concrete device object
    pub fn device_as<T: 'static>(&self) -> Option<&T> {
        self.device.as_any().downcast_ref::<T>()
    }

    /// Lock the owned session for a sequence of transport operations
    pub async fn session(&self) -> MutexGuard<'_, ConnectionSession> {
        self.session.lock().await
    }

    /// Current session state
    pub async fn session_state(&self) -> SessionState {
        self.session.lock().await.state()
    }

    /// Send raw bytes over the session
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut session = self.session.lock().await;
        session.send(data).await.map_err(|e| self.wrap(e))
    }

    /// Send a line over the session
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        session.send_line(line).await.map_err(|e| self.wrap(e))
    }

    /// Wait until one of `patterns` appears in the session output
    pub async fn await_pattern(&self, patterns: &[Regex], timeout: Option<Duration>) -> Result<PatternMatch> {
        let mut session = self.session.lock().await;
        session
            .await_pattern(patterns, timeout)
            .await
            .map_err(|e| self.wrap(e))
    }

    /// Run a shell command and collect its output and exit status
    pub async fn run_command(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        let mut session = self.session.lock().await;
        session
            .run_command(command, timeout)
            .await
            .map_err(|e| self.wrap(e))
    }

    /// Invoke a contract operation on the device
    pub async fn invoke(&self, operation: &str, args: &[Value]) -> Result<Value> {
        if !self.device.operations().contains(&operation) {
            return Err(DeviceError::OperationNotSupported {
                device: self.name().to_string(),
                operation: operation.to_string(),
            });
        }

        let mut session = self.session.lock().await;
        self.device.execute(&mut session, operation, args).await
    }

    /// Close the owned session; safe to call repeatedly
    pub async fn close(&self) {
        self.session.lock().await.close().await;
    }

    fn wrap(&self, error: ConnectionError) -> DeviceError {
        DeviceError::connection(self.name(), self.descriptor.connection.kind(), error)
    }
}
