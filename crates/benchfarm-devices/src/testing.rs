/*!
 * In-memory transports and stub devices.
 *
 * Lets the connection factory, resolver and lifecycle engine run without
 * lab hardware. The scripted connector counts attempts and records the
 * order in which transports are closed.
 */
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use regex::Regex;

use benchfarm_core::{config::ConnectionConfig, types::Value};

use crate::binding::BindingSummary;
use crate::connection::factory::session_prompts;
use crate::connection::{
    ConnectionError, ConnectionErrorKind, ConnectionParams, ConnectionSession, Connector, HostKeyPolicy,
    SshParams, Transport, TransportKind,
};
use crate::descriptor::DeviceDescriptor;
use crate::device::{string_arg, Device, DeviceConstructor, DeviceError, DeviceInstance, Result};
use crate::template::CapabilityContract;

/// Shared record of device names, in event order
pub type EventLog = Arc<Mutex<Vec<String>>>;

fn push(log: &EventLog, entry: &str) {
    if let Ok(mut entries) = log.lock() {
        entries.push(entry.to_string());
    }
}

fn entries(log: &EventLog) -> Vec<String> {
    log.lock().map(|entries| entries.clone()).unwrap_or_default()
}

/// Connection settings with millisecond backoff and a short connect timeout
pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
        backoff_multiplier: 2.0,
        connect_timeout_ms: 50,
        command_timeout_ms: 1_000,
    }
}

/// SSH parameters pointing at `host`
pub fn ssh_params(host: &str) -> ConnectionParams {
    ConnectionParams::Ssh(SshParams {
        host: host.to_string(),
        username: "root".to_string(),
        password: Some("bigfoot1".to_string()),
        key_path: None,
        port: 22,
        prompt_patterns: Vec::new(),
        host_key_policy: HostKeyPolicy::Ignore,
    })
}

/// Inventory record reached over SSH
pub fn descriptor(name: &str, role: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(name, role, ssh_params(name))
}

/// Connector producing [`ScriptedTransport`]s
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    attempts: AtomicU32,
    attempts_by_owner: Mutex<HashMap<String, u32>>,
    failure: Option<(ConnectionErrorKind, u32)>,
    fail_owners: HashMap<String, ConnectionErrorKind>,
    hang_owners: HashSet<String>,
    responses: HashMap<String, String>,
    opened: EventLog,
    closed: EventLog,
}

impl ScriptedConnector {
    /// A connector whose attempts all succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `times` attempts, whoever makes them
    pub fn failing(mut self, kind: ConnectionErrorKind, times: u32) -> Self {
        self.failure = Some((kind, times));
        self
    }

    /// Fail every attempt for `owner`
    pub fn fail_for(mut self, owner: &str, kind: ConnectionErrorKind) -> Self {
        self.fail_owners.insert(owner.to_string(), kind);
        self
    }

    /// Never complete attempts for `owner`
    pub fn hang_for(mut self, owner: &str) -> Self {
        self.hang_owners.insert(owner.to_string());
        self
    }

    /// Answer `command` with `output` on every transport
    pub fn respond(mut self, command: &str, output: &str) -> Self {
        self.responses.insert(command.to_string(), output.to_string());
        self
    }

    /// Total attempts made
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Attempts made for `owner`
    pub fn attempts_for(&self, owner: &str) -> u32 {
        self.attempts_by_owner
            .lock()
            .map(|counts| counts.get(owner).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Owners whose transports were opened, in order
    pub fn opened(&self) -> Vec<String> {
        entries(&self.opened)
    }

    /// Owners whose transports were closed, in order
    pub fn closed(&self) -> Vec<String> {
        entries(&self.closed)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        owner: &str,
        params: &ConnectionParams,
        _prompts: &[Regex],
    ) -> std::result::Result<Box<dyn Transport>, ConnectionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut counts) = self.attempts_by_owner.lock() {
            *counts.entry(owner.to_string()).or_insert(0) += 1;
        }

        if self.hang_owners.contains(owner) {
            futures::future::pending::<()>().await;
        }
        if let Some(kind) = self.fail_owners.get(owner) {
            return Err(ConnectionError::new(*kind, format!("scripted failure for {}", owner)));
        }
        if let Some((kind, times)) = self.failure {
            if attempt <= times {
                return Err(ConnectionError::new(kind, format!("scripted failure on attempt {}", attempt)));
            }
        }

        push(&self.opened, owner);
        let mut transport = ScriptedTransport::new(params.kind()).logging_close(owner, self.closed.clone());
        for (command, output) in &self.responses {
            transport = transport.respond(command, output);
        }
        Ok(Box::new(transport))
    }
}

/// Transport that answers commands from a table
///
/// Shell command lines carrying a completion marker are answered with the
/// scripted output, the marker with the scripted status and a `$ ` prompt.
#[derive(Debug)]
pub struct ScriptedTransport {
    kind: TransportKind,
    responses: HashMap<String, (String, i32)>,
    input: BytesMut,
    outbox: BytesMut,
    closed: bool,
    close_log: Option<(String, EventLog)>,
}

impl ScriptedTransport {
    /// Create a transport with no scripted responses
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            responses: HashMap::new(),
            input: BytesMut::new(),
            outbox: BytesMut::new(),
            closed: false,
            close_log: None,
        }
    }

    /// Answer `command` with `output` and status 0
    pub fn respond(self, command: &str, output: &str) -> Self {
        self.respond_with_status(command, output, 0)
    }

    /// Answer `command` with `output` and `status`
    pub fn respond_with_status(mut self, command: &str, output: &str, status: i32) -> Self {
        self.responses
            .insert(command.to_string(), (output.to_string(), status));
        self
    }

    /// Record `label` in `log` when closed
    pub fn logging_close(mut self, label: &str, log: EventLog) -> Self {
        self.close_log = Some((label.to_string(), log));
        self
    }

    fn prompt(&self) -> &'static str {
        match self.kind {
            TransportKind::Snmp => "snmp> ",
            TransportKind::CliExec => "",
            _ => "$ ",
        }
    }

    fn answer(&mut self, line: &str) {
        let reply = match line.split_once("; echo __BF_DONE_") {
            Some((command, marker)) => {
                let (output, status) = self.responses.get(command).cloned().unwrap_or_default();
                let mut reply = format!("{}\r\n", line);
                if !output.is_empty() {
                    reply.push_str(&output);
                    reply.push_str("\r\n");
                }
                reply.push_str("__BF_DONE_");
                reply.push_str(&marker.replace("$?", &status.to_string()));
                reply.push_str("\r\n");
                reply
            }
            None => match self.responses.get(line) {
                Some((output, _)) => format!("{}\n", output),
                None => String::new(),
            },
        };
        let prompt = self.prompt();
        self.outbox.extend_from_slice(reply.as_bytes());
        self.outbox.extend_from_slice(prompt.as_bytes());
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn write(&mut self, data: &[u8]) -> std::result::Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::closed());
        }
        self.input.extend_from_slice(data);
        while let Some(end) = self.input.iter().position(|b| *b == b'\n') {
            let line = self.input.split_to(end + 1);
            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            self.answer(&line);
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut BytesMut) -> std::result::Result<usize, ConnectionError> {
        if !self.outbox.is_empty() {
            let chunk = self.outbox.split();
            buf.extend_from_slice(&chunk);
            return Ok(chunk.len());
        }
        if self.closed {
            return Ok(0);
        }
        futures::future::pending().await
    }

    async fn close(&mut self) -> std::result::Result<(), ConnectionError> {
        if !self.closed {
            self.closed = true;
            if let Some((label, log)) = &self.close_log {
                push(log, label);
            }
        }
        Ok(())
    }
}

/// Device that echoes which implementation handled an operation
#[derive(Debug)]
pub struct StubDevice {
    descriptor: DeviceDescriptor,
    implementation: &'static str,
    operations: &'static [&'static str],
}

impl StubDevice {
    /// Create a stub device
    pub fn new(
        descriptor: DeviceDescriptor,
        implementation: &'static str,
        operations: &'static [&'static str],
    ) -> Self {
        Self {
            descriptor,
            implementation,
            operations,
        }
    }

    /// Constructor for bindings
    pub fn constructor(implementation: &'static str, operations: &'static [&'static str]) -> DeviceConstructor {
        Arc::new(move |descriptor: &DeviceDescriptor| {
            let device: Arc<dyn Device> = Arc::new(StubDevice::new(descriptor.clone(), implementation, operations));
            Ok(device)
        })
    }
}

#[async_trait]
impl Device for StubDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn implementation(&self) -> &'static str {
        self.implementation
    }

    fn operations(&self) -> &[&'static str] {
        self.operations
    }

    async fn execute(&self, session: &mut ConnectionSession, operation: &str, args: &[Value]) -> Result<Value> {
        if operation == "run_command" {
            let command = string_arg(self.name(), operation, args, 0)?;
            let result = session
                .run_command(command, None)
                .await
                .map_err(|e| DeviceError::connection(self.name(), session.kind(), e))?;
            return Ok(Value::String(result.output));
        }
        Ok(Value::String(format!("{}:{}", self.implementation, operation)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A registered-ready instance over an open scripted session
pub async fn stub_instance(name: &str, role: &str, primary: bool) -> Result<Arc<DeviceInstance>> {
    let mut descriptor = descriptor(name, role);
    descriptor.primary = primary;
    let params = descriptor.connection.clone();
    let kind = params.kind();

    let mut session = ConnectionSession::new(name, kind, Duration::from_secs(1));
    let prompts = session_prompts(&params).map_err(|e| DeviceError::connection(name, kind, e))?;
    session
        .begin_connect()
        .and_then(|_| session.attach(Box::new(ScriptedTransport::new(kind)), prompts))
        .map_err(|e| DeviceError::connection(name, kind, e))?;

    let no_properties: [&str; 0] = [];
    let contract = Arc::new(CapabilityContract::new(role, ["run_command"], no_properties));
    let binding = BindingSummary {
        contract: role.to_string(),
        implementation: "stub".to_string(),
        source: "testing".to_string(),
        priority: 0,
        sequence: 0,
    };
    let device: Arc<dyn Device> = Arc::new(StubDevice::new(descriptor.clone(), "stub", &["run_command"]));

    Ok(Arc::new(DeviceInstance::new(
        Arc::new(descriptor),
        contract,
        binding,
        device,
        session,
    )?))
}
