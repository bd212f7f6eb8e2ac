/*!
 * LXD container power control.
 *
 * Powers a containerised lab device by stopping and starting its LXD
 * container. The `lxc` commands run over the device's session, normally a
 * `cli-exec` shell on the lab host.
 *
 * Attributes:
 * - `container`: container name (defaults to the device name)
 * - `cycle_delay_secs`: pause between off and on in a power cycle (5)
 * - `status_timeout_secs`: how long to wait for a state change (30)
 */
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use benchfarm_core::types::Value;

use crate::connection::ConnectionSession;
use crate::descriptor::DeviceDescriptor;
use crate::device::{Device, DeviceConstructor, DeviceError, Result};

const OPERATIONS: &[&str] = &["power_on", "power_off", "power_cycle"];
const STATUS_POLL: Duration = Duration::from_secs(2);

/// PDU backed by an LXD container
#[derive(Debug)]
pub struct LxdPdu {
    descriptor: DeviceDescriptor,
    container: String,
    cycle_delay: Duration,
    status_timeout: Duration,
    poll_interval: Duration,
}

impl LxdPdu {
    /// Create a PDU for `descriptor`
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        let attribute_secs = |key: &str, default: u64| {
            descriptor
                .attributes
                .get(key)
                .and_then(Value::as_integer)
                .and_then(|secs| u64::try_from(secs).ok())
                .map_or(Duration::from_secs(default), Duration::from_secs)
        };
        let container = descriptor
            .attributes
            .get("container")
            .and_then(Value::as_str)
            .unwrap_or(&descriptor.name)
            .to_string();
        let cycle_delay = attribute_secs("cycle_delay_secs", 5);
        let status_timeout = attribute_secs("status_timeout_secs", 30);

        Self {
            descriptor,
            container,
            cycle_delay,
            status_timeout,
            poll_interval: STATUS_POLL,
        }
    }

    /// Constructor for bindings
    pub fn constructor() -> DeviceConstructor {
        Arc::new(|descriptor: &DeviceDescriptor| {
            let device: Arc<dyn Device> = Arc::new(LxdPdu::new(descriptor.clone()));
            Ok(device)
        })
    }

    /// Container this PDU controls
    pub fn container(&self) -> &str {
        &self.container
    }

    async fn lxc(&self, session: &mut ConnectionSession, args: &str) -> Result<(bool, String)> {
        let command = format!("lxc {}", args);
        let result = session
            .run_command(&command, None)
            .await
            .map_err(|e| DeviceError::connection(self.name(), session.kind(), e))?;
        Ok((result.success(), result.output))
    }

    async fn status(&self, session: &mut ConnectionSession) -> Result<String> {
        let (ok, output) = self
            .lxc(session, &format!("list {} --format csv -c s", self.container))
            .await?;
        Ok(if ok { output.trim().to_uppercase() } else { String::new() })
    }

    async fn wait_for(&self, session: &mut ConnectionSession, operation: &str, target: &str) -> Result<()> {
        let deadline = Instant::now() + self.status_timeout;
        loop {
            if self.status(session).await? == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::operation_failed(
                    self.name(),
                    operation,
                    format!("container {} not {} after {:?}", self.container, target, self.status_timeout),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn switch(
        &self,
        session: &mut ConnectionSession,
        operation: &str,
        target: &str,
        args: String,
    ) -> Result<()> {
        if self.status(session).await? == target {
            debug!("Container {} is already {}", self.container, target);
            return Ok(());
        }

        let (ok, output) = self.lxc(session, &args).await?;
        if !ok {
            return Err(DeviceError::operation_failed(self.name(), operation, output));
        }
        self.wait_for(session, operation, target).await?;
        info!("Container {} is {}", self.container, target);
        Ok(())
    }

    async fn power_off(&self, session: &mut ConnectionSession) -> Result<()> {
        let args = format!("stop {} --force", self.container);
        self.switch(session, "power_off", "STOPPED", args).await
    }

    async fn power_on(&self, session: &mut ConnectionSession) -> Result<()> {
        let args = format!("start {}", self.container);
        self.switch(session, "power_on", "RUNNING", args).await
    }
}

#[async_trait]
impl Device for LxdPdu {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn implementation(&self) -> &'static str {
        "lxd-pdu"
    }

    fn operations(&self) -> &[&'static str] {
        OPERATIONS
    }

    async fn execute(&self, session: &mut ConnectionSession, operation: &str, _args: &[Value]) -> Result<Value> {
        match operation {
            "power_off" => self.power_off(session).await?,
            "power_on" => self.power_on(session).await?,
            "power_cycle" => {
                info!("Power cycling container {}", self.container);
                self.power_off(session).await?;
                tokio::time::sleep(self.cycle_delay).await;
                self.power_on(session).await?;
            }
            other => {
                return Err(DeviceError::OperationNotSupported {
                    device: self.name().to_string(),
                    operation: other.to_string(),
                })
            }
        }
        Ok(Value::Bool(true))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CliExecParams, ConnectionParams, TransportKind};
    use crate::testing::ScriptedTransport;

    fn pdu(attributes: &[(&str, Value)]) -> LxdPdu {
        let mut descriptor = DeviceDescriptor::new(
            "rpi-pdu",
            "PDU",
            ConnectionParams::CliExec(CliExecParams {
                executable: "/bin/sh".into(),
                args: Vec::new(),
                working_dir: None,
            }),
        );
        for (key, value) in attributes {
            descriptor.attributes.insert(key.to_string(), value.clone());
        }
        let mut pdu = LxdPdu::new(descriptor);
        pdu.poll_interval = Duration::from_millis(1);
        pdu
    }

    fn session(transport: ScriptedTransport) -> ConnectionSession {
        let mut session = ConnectionSession::new("rpi-pdu", TransportKind::CliExec, Duration::from_secs(1));
        session.begin_connect().unwrap();
        session.attach(Box::new(transport), Vec::new()).unwrap();
        session
    }

    #[test]
    fn test_attributes() {
        let default = pdu(&[]);
        assert_eq!(default.container(), "rpi-pdu");
        assert_eq!(default.cycle_delay, Duration::from_secs(5));

        let custom = pdu(&[("container", Value::from("cpe-1")), ("cycle_delay_secs", Value::from(1))]);
        assert_eq!(custom.container(), "cpe-1");
        assert_eq!(custom.cycle_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_power_off_when_already_stopped() -> Result<()> {
        let pdu = pdu(&[("container", Value::from("cpe-1"))]);
        let mut session = session(
            ScriptedTransport::new(TransportKind::CliExec).respond("lxc list cpe-1 --format csv -c s", "STOPPED"),
        );

        assert_eq!(pdu.execute(&mut session, "power_off", &[]).await?, Value::Bool(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_power_on_times_out() -> Result<()> {
        let pdu = pdu(&[("container", Value::from("cpe-1")), ("status_timeout_secs", Value::from(0))]);
        let mut session = session(
            ScriptedTransport::new(TransportKind::CliExec)
                .respond("lxc list cpe-1 --format csv -c s", "STOPPED")
                .respond("lxc start cpe-1", ""),
        );

        let result = pdu.execute(&mut session, "power_on", &[]).await;
        assert!(matches!(result, Err(DeviceError::OperationFailed { operation, .. }) if operation == "power_on"));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_lxc_command() -> Result<()> {
        let pdu = pdu(&[("container", Value::from("cpe-1"))]);
        let mut session = session(
            ScriptedTransport::new(TransportKind::CliExec)
                .respond("lxc list cpe-1 --format csv -c s", "RUNNING")
                .respond_with_status("lxc stop cpe-1 --force", "Error: not found", 1),
        );

        let result = pdu.execute(&mut session, "power_off", &[]).await;
        assert!(matches!(result, Err(DeviceError::OperationFailed { reason, .. }) if reason.contains("not found")));
        Ok(())
    }
}
