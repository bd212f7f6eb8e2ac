/*!
 * Transport parameter sets.
 *
 * One struct per transport kind, selected in inventory files by the
 * `transport` tag. Mandatory/optional combinations that serde cannot
 * express are checked by [`ConnectionParams::validate`].
 */
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::TransportKind;

/// Connection parameters for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum ConnectionParams {
    /// Serial console
    Serial(SerialParams),
    /// SSH shell
    Ssh(SshParams),
    /// Telnet shell
    Telnet(TelnetParams),
    /// SNMP agent
    Snmp(SnmpParams),
    /// Local executable
    CliExec(CliExecParams),
}

/// Serial console parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Command that attaches to the console (e.g. `cu -l /dev/ttyUSB0 -s 115200`)
    #[serde(default)]
    pub device_command: Option<String>,
    /// Serial port path
    #[serde(default)]
    pub com_port: Option<String>,
    /// Serial baud rate
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Shell prompt regular expressions
    #[serde(default)]
    pub prompt_patterns: Vec<String>,
}

/// SSH host key checking behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Refuse unknown or changed host keys
    Strict,
    /// Accept unknown keys, refuse changed ones
    AcceptNew,
    /// Accept any key; lab devices are reflashed often
    #[default]
    Ignore,
}

impl HostKeyPolicy {
    /// Value for ssh's `StrictHostKeyChecking` option
    pub fn ssh_option(&self) -> &'static str {
        match self {
            HostKeyPolicy::Strict => "yes",
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::Ignore => "no",
        }
    }
}

/// SSH parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshParams {
    /// Host name or address
    pub host: String,
    /// Login user
    pub username: String,
    /// Login password
    #[serde(default)]
    pub password: Option<String>,
    /// Private key file
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// TCP port
    pub port: u16,
    /// Shell prompt regular expressions
    #[serde(default)]
    pub prompt_patterns: Vec<String>,
    /// Host key checking policy
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

/// Telnet parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelnetParams {
    /// Host name or address
    pub host: String,
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
    /// TCP port
    pub port: u16,
    /// Shell prompt regular expressions
    #[serde(default)]
    pub prompt_patterns: Vec<String>,
}

/// SNMPv3 user credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnmpV3Credentials {
    /// Security name
    pub user: String,
    /// Security level (`noAuthNoPriv`, `authNoPriv`, `authPriv`)
    #[serde(default = "default_security_level")]
    pub security_level: String,
    /// Authentication protocol (MD5, SHA)
    #[serde(default)]
    pub auth_protocol: Option<String>,
    /// Authentication pass phrase
    #[serde(default)]
    pub auth_password: Option<String>,
    /// Privacy protocol (DES, AES)
    #[serde(default)]
    pub priv_protocol: Option<String>,
    /// Privacy pass phrase
    #[serde(default)]
    pub priv_password: Option<String>,
}

fn default_security_level() -> String {
    "authPriv".to_string()
}

/// SNMP parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnmpParams {
    /// Agent host name or address
    pub host: String,
    /// SNMPv2c community
    #[serde(default)]
    pub community: Option<String>,
    /// SNMPv3 credentials
    #[serde(default)]
    pub v3: Option<SnmpV3Credentials>,
    /// Per-request timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Local executable parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliExecParams {
    /// Executable path
    pub executable: PathBuf,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ConnectionParams {
    /// The transport kind these parameters describe
    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectionParams::Serial(_) => TransportKind::Serial,
            ConnectionParams::Ssh(_) => TransportKind::Ssh,
            ConnectionParams::Telnet(_) => TransportKind::Telnet,
            ConnectionParams::Snmp(_) => TransportKind::Snmp,
            ConnectionParams::CliExec(_) => TransportKind::CliExec,
        }
    }

    /// Human-readable endpoint (host, port or executable)
    pub fn target(&self) -> String {
        match self {
            ConnectionParams::Serial(p) => p
                .com_port
                .clone()
                .or_else(|| p.device_command.clone())
                .unwrap_or_default(),
            ConnectionParams::Ssh(p) => format!("{}:{}", p.host, p.port),
            ConnectionParams::Telnet(p) => format!("{}:{}", p.host, p.port),
            ConnectionParams::Snmp(p) => p.host.clone(),
            ConnectionParams::CliExec(p) => p.executable.display().to_string(),
        }
    }

    /// Configured prompt patterns (uncompiled)
    pub fn prompt_patterns(&self) -> &[String] {
        match self {
            ConnectionParams::Serial(p) => &p.prompt_patterns,
            ConnectionParams::Ssh(p) => &p.prompt_patterns,
            ConnectionParams::Telnet(p) => &p.prompt_patterns,
            ConnectionParams::Snmp(_) | ConnectionParams::CliExec(_) => &[],
        }
    }

    /// Compile the prompt patterns
    pub fn compiled_prompts(&self) -> std::result::Result<Vec<Regex>, String> {
        self.prompt_patterns()
            .iter()
            .map(|p| Regex::new(p).map_err(|e| format!("invalid prompt pattern {:?}: {}", p, e)))
            .collect()
    }

    /// Check the mandatory parameter combinations
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            ConnectionParams::Serial(p) => {
                let has_command = p.device_command.as_deref().is_some_and(|c| !c.trim().is_empty());
                let has_port = p.com_port.is_some() && p.baud_rate.is_some();
                if !has_command && !has_port {
                    return Err("serial requires device_command or com_port with baud_rate".to_string());
                }
            }
            ConnectionParams::Ssh(p) => {
                require_non_empty("host", &p.host)?;
                require_non_empty("username", &p.username)?;
                if p.password.is_none() && p.key_path.is_none() {
                    return Err("ssh requires password or key_path".to_string());
                }
            }
            ConnectionParams::Telnet(p) => {
                require_non_empty("host", &p.host)?;
                require_non_empty("username", &p.username)?;
            }
            ConnectionParams::Snmp(p) => {
                require_non_empty("host", &p.host)?;
                if p.community.is_none() && p.v3.is_none() {
                    return Err("snmp requires community or v3 credentials".to_string());
                }
            }
            ConnectionParams::CliExec(p) => {
                if p.executable.as_os_str().is_empty() {
                    return Err("cli-exec requires an executable".to_string());
                }
            }
        }

        self.compiled_prompts().map(|_| ())
    }
}

fn require_non_empty(field: &str, value: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} must not be empty", field))
    } else {
        Ok(())
    }
}
