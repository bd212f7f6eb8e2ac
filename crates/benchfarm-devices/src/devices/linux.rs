/*!
 * Generic Linux shell device.
 *
 * Fills any role whose contract only needs shell access: CPE boards with a
 * Linux userland, LAN/WAN clients and ACS hosts.
 */
use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use benchfarm_core::types::Value;

use crate::connection::ConnectionSession;
use crate::descriptor::DeviceDescriptor;
use crate::device::{string_arg, Device, DeviceConstructor, DeviceError, Result};

const OPERATIONS: &[&str] = &["run_command", "get_interface_ipv4"];

/// A device driven through a Linux shell
#[derive(Debug)]
pub struct LinuxShell {
    descriptor: DeviceDescriptor,
    inet: Regex,
}

impl LinuxShell {
    /// Create a device for `descriptor`
    pub fn new(descriptor: DeviceDescriptor) -> Result<Self> {
        let inet = Regex::new(r"inet (\d+\.\d+\.\d+\.\d+)")
            .map_err(|e| DeviceError::InvalidState(e.to_string()))?;
        Ok(Self { descriptor, inet })
    }

    /// Constructor for bindings
    pub fn constructor() -> DeviceConstructor {
        Arc::new(|descriptor: &DeviceDescriptor| {
            let device: Arc<dyn Device> = Arc::new(LinuxShell::new(descriptor.clone())?);
            Ok(device)
        })
    }

    async fn shell(&self, session: &mut ConnectionSession, operation: &str, command: &str) -> Result<(String, Option<i32>)> {
        let result = session
            .run_command(command, None)
            .await
            .map_err(|e| DeviceError::connection(self.name(), session.kind(), e))?;
        debug!("{}: {} -> exit {:?}", self.name(), operation, result.exit_code);
        Ok((result.output, result.exit_code))
    }

    fn parse_ipv4(&self, output: &str) -> Option<String> {
        self.inet
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[async_trait]
impl Device for LinuxShell {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn implementation(&self) -> &'static str {
        "linux-shell"
    }

    fn operations(&self) -> &[&'static str] {
        OPERATIONS
    }

    async fn execute(&self, session: &mut ConnectionSession, operation: &str, args: &[Value]) -> Result<Value> {
        match operation {
            "run_command" => {
                let command = string_arg(self.name(), operation, args, 0)?;
                let (output, _) = self.shell(session, operation, command).await?;
                Ok(Value::String(output))
            }
            "get_interface_ipv4" => {
                let interface = string_arg(self.name(), operation, args, 0)?;
                let command = format!("ip -4 addr show dev {}", interface);
                let (output, exit_code) = self.shell(session, operation, &command).await?;
                if exit_code.is_some_and(|code| code != 0) {
                    return Err(DeviceError::operation_failed(self.name(), operation, output));
                }
                self.parse_ipv4(&output).map(Value::String).ok_or_else(|| {
                    DeviceError::operation_failed(
                        self.name(),
                        operation,
                        format!("{} has no IPv4 address", interface),
                    )
                })
            }
            other => Err(DeviceError::OperationNotSupported {
                device: self.name().to_string(),
                operation: other.to_string(),
            }),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportKind;
    use crate::testing::{descriptor, ScriptedTransport};
    use std::time::Duration;

    const IP_ADDR: &str = "3: erouter0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet 10.1.1.20/24 brd 10.1.1.255 scope global erouter0";

    fn session(transport: ScriptedTransport) -> ConnectionSession {
        let mut session = ConnectionSession::new("board", TransportKind::Ssh, Duration::from_secs(1));
        session.begin_connect().unwrap();
        session
            .attach(Box::new(transport), vec![Regex::new(r"[\$#>]\s*$").unwrap()])
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_get_interface_ipv4() -> Result<()> {
        let device = LinuxShell::new(descriptor("board", "CPE"))?;
        let mut session = session(
            ScriptedTransport::new(TransportKind::Ssh).respond("ip -4 addr show dev erouter0", IP_ADDR),
        );

        let ip = device
            .execute(&mut session, "get_interface_ipv4", &[Value::from("erouter0")])
            .await?;
        assert_eq!(ip, Value::from("10.1.1.20"));
        Ok(())
    }

    #[tokio::test]
    async fn test_interface_without_address() -> Result<()> {
        let device = LinuxShell::new(descriptor("board", "CPE"))?;
        let mut session = session(ScriptedTransport::new(TransportKind::Ssh).respond_with_status(
            "ip -4 addr show dev wl0",
            "Device \"wl0\" does not exist.",
            1,
        ));

        let result = device
            .execute(&mut session, "get_interface_ipv4", &[Value::from("wl0")])
            .await;
        assert!(matches!(result, Err(DeviceError::OperationFailed { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_requires_argument() -> Result<()> {
        let device = LinuxShell::new(descriptor("lan", "LAN"))?;
        let mut session = session(ScriptedTransport::new(TransportKind::Ssh));

        let result = device.execute(&mut session, "run_command", &[]).await;
        assert!(matches!(result, Err(DeviceError::OperationFailed { .. })));
        Ok(())
    }
}
