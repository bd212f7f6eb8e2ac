/*!
 * Transport connections.
 *
 * The factory opens a [`ConnectionSession`] for any supported transport
 * kind. Sessions expose the same send / await-pattern surface whatever the
 * underlying transport is.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod factory;
pub mod params;
pub mod process;
pub mod session;
pub mod transport;

pub use factory::{ConnectionFactory, Connector};
pub use params::{
    CliExecParams, ConnectionParams, HostKeyPolicy, SerialParams, SnmpParams, SnmpV3Credentials,
    SshParams, TelnetParams,
};
pub use process::ProcessConnector;
pub use session::{CommandOutput, ConnectionSession, SessionState};
pub use transport::{ExpectBuffer, PatternMatch, Transport};

/// Supported transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Serial console
    Serial,
    /// SSH shell
    Ssh,
    /// Telnet shell
    Telnet,
    /// SNMP agent
    Snmp,
    /// Local executable
    CliExec,
}

impl TransportKind {
    /// All transport kinds
    pub const ALL: [TransportKind; 5] = [
        TransportKind::Serial,
        TransportKind::Ssh,
        TransportKind::Telnet,
        TransportKind::Snmp,
        TransportKind::CliExec,
    ];

    /// Name as written in inventory files
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Serial => "serial",
            TransportKind::Ssh => "ssh",
            TransportKind::Telnet => "telnet",
            TransportKind::Snmp => "snmp",
            TransportKind::CliExec => "cli-exec",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of connection failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionErrorKind {
    /// No answer within the deadline
    Timeout,
    /// Credentials were rejected
    AuthFailure,
    /// The peer refused or could not be reached
    Unreachable,
    /// The peer answered with something unexpected, or the stream broke
    ProtocolFault,
    /// The attempt was cancelled by the caller
    Cancelled,
    /// The session is not open
    Closed,
}

impl ConnectionErrorKind {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionErrorKind::Timeout | ConnectionErrorKind::Unreachable)
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionErrorKind::Timeout => "timeout",
            ConnectionErrorKind::AuthFailure => "authentication failure",
            ConnectionErrorKind::Unreachable => "unreachable",
            ConnectionErrorKind::ProtocolFault => "protocol fault",
            ConnectionErrorKind::Cancelled => "cancelled",
            ConnectionErrorKind::Closed => "session closed",
        };
        f.write_str(name)
    }
}

/// A transport-level failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {cause}")]
pub struct ConnectionError {
    /// Failure class
    pub kind: ConnectionErrorKind,
    /// Description of the underlying cause
    pub cause: String,
}

impl ConnectionError {
    /// Create a new connection error
    pub fn new<S: Into<String>>(kind: ConnectionErrorKind, cause: S) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(cause: S) -> Self {
        Self::new(ConnectionErrorKind::Timeout, cause)
    }

    /// Create an authentication failure
    pub fn auth_failure<S: Into<String>>(cause: S) -> Self {
        Self::new(ConnectionErrorKind::AuthFailure, cause)
    }

    /// Create an unreachable error
    pub fn unreachable<S: Into<String>>(cause: S) -> Self {
        Self::new(ConnectionErrorKind::Unreachable, cause)
    }

    /// Create a protocol fault
    pub fn protocol_fault<S: Into<String>>(cause: S) -> Self {
        Self::new(ConnectionErrorKind::ProtocolFault, cause)
    }

    /// Create a cancellation error
    pub fn cancelled() -> Self {
        Self::new(ConnectionErrorKind::Cancelled, "cancelled by caller")
    }

    /// Create a closed-session error
    pub fn closed() -> Self {
        Self::new(ConnectionErrorKind::Closed, "session is not open")
    }

    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        self.kind == ConnectionErrorKind::Timeout
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ConnectionError::timeout(err.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                ConnectionError::unreachable(err.to_string())
            }
            ErrorKind::PermissionDenied => ConnectionError::auth_failure(err.to_string()),
            _ => ConnectionError::protocol_fault(err.to_string()),
        }
    }
}
