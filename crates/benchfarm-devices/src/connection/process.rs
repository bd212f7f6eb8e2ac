/*!
 * Process-backed transports.
 *
 * Shell transports (serial, ssh, telnet) and local executables run as a
 * child process whose stdio is the byte stream, much like an expect-driven
 * console. SNMP runs one net-snmp command per request line.
 */
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use benchfarm_core::config::ConnectionConfig;

use super::factory::Connector;
use super::params::{ConnectionParams, HostKeyPolicy, SerialParams, SnmpParams, SshParams, TelnetParams};
use super::transport::{ExpectBuffer, Transport};
use super::{ConnectionError, ConnectionErrorKind, TransportKind};

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL: usize = 64;
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// sysDescr, queried once to check an SNMP agent answers
const SNMP_SYSDESCR_OID: &str = "1.3.6.1.2.1.1.1.0";

const PASSWORD_PROMPT: &str = r"(?i)password:\s*$";
const LOGIN_PROMPT: &str = r"(?i)(login|username):\s*$";
const AUTH_REJECTED: &str = r"Permission denied|Login incorrect|Authentication failed|Access denied";
const NOT_REACHED: &str =
    r"Connection refused|No route to host|Could not resolve|Name or service not known|Unable to connect";
const TIMED_OUT: &str = r"Connection timed out|Operation timed out";

/// Connector that drives external programs
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    login_timeout: Duration,
    request_timeout: Duration,
}

impl Default for ProcessConnector {
    fn default() -> Self {
        Self::new(&ConnectionConfig::default())
    }
}

impl ProcessConnector {
    /// Create a connector bounding the login dialog by the connect timeout
    /// and each SNMP request by the command timeout
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            login_timeout: config.connect_timeout(),
            request_timeout: config.command_timeout(),
        }
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(
        &self,
        owner: &str,
        params: &ConnectionParams,
        prompts: &[Regex],
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        match params {
            ConnectionParams::Snmp(snmp) => {
                let transport = SnmpTransport::connect(snmp.clone(), self.request_timeout).await?;
                Ok(Box::new(transport))
            }
            ConnectionParams::CliExec(cli) => {
                let mut command = Command::new(&cli.executable);
                command.args(&cli.args);
                if let Some(dir) = &cli.working_dir {
                    command.current_dir(dir);
                }
                let transport = ProcessTransport::spawn(TransportKind::CliExec, owner, command)?;
                Ok(Box::new(transport))
            }
            ConnectionParams::Ssh(ssh) => {
                let mut transport = ProcessTransport::spawn(TransportKind::Ssh, owner, argv_command(&ssh_argv(ssh))?)?;
                let login = Credentials {
                    username: None,
                    password: ssh.password.as_deref(),
                };
                self.login(&mut transport, login, prompts).await?;
                Ok(Box::new(transport))
            }
            ConnectionParams::Telnet(telnet) => {
                let mut transport =
                    ProcessTransport::spawn(TransportKind::Telnet, owner, argv_command(&telnet_argv(telnet))?)?;
                let login = Credentials {
                    username: Some(&telnet.username),
                    password: Some(&telnet.password),
                };
                self.login(&mut transport, login, prompts).await?;
                Ok(Box::new(transport))
            }
            ConnectionParams::Serial(serial) => {
                let mut transport =
                    ProcessTransport::spawn(TransportKind::Serial, owner, argv_command(&serial_argv(serial))?)?;
                // consoles print nothing until poked
                transport.write(b"\n").await?;
                self.login(&mut transport, Credentials::default(), prompts).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Credentials<'a> {
    username: Option<&'a str>,
    password: Option<&'a str>,
}

impl ProcessConnector {
    /// Answer login and password prompts until a shell prompt shows up
    async fn login(
        &self,
        transport: &mut ProcessTransport,
        credentials: Credentials<'_>,
        prompts: &[Regex],
    ) -> Result<(), ConnectionError> {
        let mut patterns = vec![
            compile(PASSWORD_PROMPT)?,
            compile(LOGIN_PROMPT)?,
            compile(AUTH_REJECTED)?,
            compile(NOT_REACHED)?,
            compile(TIMED_OUT)?,
        ];
        patterns.extend(prompts.iter().cloned());

        let mut buffer = ExpectBuffer::new();
        let mut passwords_sent = 0;
        loop {
            let found = buffer
                .expect(transport, &patterns, self.login_timeout)
                .await
                .map_err(|e| match e.kind {
                    ConnectionErrorKind::ProtocolFault => {
                        ConnectionError::unreachable(format!("{} exited during login: {}", transport.label, e.cause))
                    }
                    _ => e,
                })?;

            match found.index {
                0 => {
                    let password = credentials.password.ok_or_else(|| {
                        ConnectionError::auth_failure("password requested but none configured")
                    })?;
                    if passwords_sent > 0 {
                        return Err(ConnectionError::auth_failure("password rejected"));
                    }
                    passwords_sent += 1;
                    trace!("{}: answering password prompt", transport.label);
                    transport.write(format!("{}\n", password).as_bytes()).await?;
                }
                1 => {
                    let username = credentials.username.ok_or_else(|| {
                        ConnectionError::auth_failure("login requested but no username configured")
                    })?;
                    trace!("{}: answering login prompt", transport.label);
                    transport.write(format!("{}\n", username).as_bytes()).await?;
                }
                2 => return Err(ConnectionError::auth_failure(found.matched)),
                3 => return Err(ConnectionError::unreachable(found.matched)),
                4 => return Err(ConnectionError::timeout(found.matched)),
                _ => {
                    debug!("{}: shell prompt reached", transport.label);
                    return Ok(());
                }
            }
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, ConnectionError> {
    Regex::new(pattern).map_err(|e| ConnectionError::protocol_fault(e.to_string()))
}

fn argv_command(argv: &[String]) -> Result<Command, ConnectionError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ConnectionError::protocol_fault("empty command line"))?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

fn ssh_argv(params: &SshParams) -> Vec<String> {
    let mut argv = vec![
        "ssh".to_string(),
        "-tt".to_string(),
        "-p".to_string(),
        params.port.to_string(),
        "-o".to_string(),
        format!("StrictHostKeyChecking={}", params.host_key_policy.ssh_option()),
    ];
    if params.host_key_policy == HostKeyPolicy::Ignore {
        argv.push("-o".to_string());
        argv.push("UserKnownHostsFile=/dev/null".to_string());
    }
    if let Some(key) = &params.key_path {
        argv.push("-i".to_string());
        argv.push(key.display().to_string());
    }
    argv.push(format!("{}@{}", params.username, params.host));
    argv
}

fn telnet_argv(params: &TelnetParams) -> Vec<String> {
    vec!["telnet".to_string(), params.host.clone(), params.port.to_string()]
}

fn serial_argv(params: &SerialParams) -> Vec<String> {
    match params.device_command.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(command) => command.split_whitespace().map(str::to_string).collect(),
        None => vec![
            "picocom".to_string(),
            "-b".to_string(),
            params.baud_rate.unwrap_or(115_200).to_string(),
            params.com_port.clone().unwrap_or_default(),
        ],
    }
}

/// A child process whose stdin/stdout/stderr form the byte stream
#[derive(Debug)]
pub struct ProcessTransport {
    kind: TransportKind,
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output: mpsc::Receiver<Bytes>,
    forwarders: Vec<JoinHandle<()>>,
}

impl ProcessTransport {
    /// Spawn `command` with piped stdio
    pub fn spawn(kind: TransportKind, label: &str, mut command: Command) -> Result<Self, ConnectionError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            let error = ConnectionError::from(e);
            ConnectionError::new(error.kind, format!("failed to start {} for {}: {}", kind, label, error.cause))
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectionError::protocol_fault("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ConnectionError::protocol_fault("stderr was not captured"))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL);
        let forwarders = vec![forward(stdout, tx.clone()), forward(stderr, tx)];

        debug!("Spawned {} process for {} (pid {:?})", kind, label, child.id());
        Ok(Self {
            kind,
            label: label.to_string(),
            child,
            stdin,
            output: rx,
            forwarders,
        })
    }
}

fn forward<R>(mut reader: R, tx: mpsc::Sender<Bytes>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = BytesMut::with_capacity(READ_CHUNK);
        loop {
            chunk.reserve(READ_CHUNK);
            match reader.read_buf(&mut chunk).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(chunk.split().freeze()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    trace!("Process stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let stdin = self.stdin.as_mut().ok_or_else(ConnectionError::closed)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, ConnectionError> {
        match self.output.recv().await {
            Some(chunk) => {
                buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            trace!("{} process already gone: {}", self.label, e);
        }
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!("{} process for {} exited with {}", self.kind, self.label, status),
            Ok(Err(e)) => warn!("Waiting for {} process failed: {}", self.label, e),
            Err(_) => warn!("{} process did not exit within {:?}", self.label, EXIT_GRACE),
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        Ok(())
    }
}

/// SNMP request transport
///
/// Each line written is one request: `get <oid>...`, `walk <oid>` or
/// `set <oid> <type> <value>`. The reply is the tool output followed by an
/// `snmp> ` prompt.
#[derive(Debug)]
pub struct SnmpTransport {
    params: SnmpParams,
    request_timeout: Duration,
    input: BytesMut,
    replies: VecDeque<Bytes>,
    closed: bool,
}

impl SnmpTransport {
    /// Check that the agent answers, then create the transport
    pub async fn connect(params: SnmpParams, request_timeout: Duration) -> Result<Self, ConnectionError> {
        let (program, args) = snmp_request_argv(&params, &format!("get {}", SNMP_SYSDESCR_OID))
            .map_err(ConnectionError::protocol_fault)?;
        let output = run_request(&program, &args, request_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_snmp_failure(&params.host, &stderr));
        }

        debug!("SNMP agent {} answered the sysDescr query", params.host);
        Ok(Self {
            params,
            request_timeout,
            input: BytesMut::new(),
            replies: VecDeque::new(),
            closed: false,
        })
    }

    async fn request(&self, line: &str) -> Bytes {
        let mut reply = match snmp_request_argv(&self.params, line) {
            Ok((program, args)) => match run_request(&program, &args, self.request_timeout).await {
                Ok(output) => {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    if !output.status.success() {
                        text.push_str(&format!("error: {} exited with {}\n", program, output.status));
                    }
                    text
                }
                Err(e) => format!("error: {}\n", e),
            },
            Err(e) => format!("error: {}\n", e),
        };
        if !reply.ends_with('\n') {
            reply.push('\n');
        }
        reply.push_str("snmp> ");
        Bytes::from(reply)
    }
}

async fn run_request(program: &str, args: &[String], limit: Duration) -> std::io::Result<std::process::Output> {
    let mut command = Command::new(program);
    command.kill_on_drop(true).args(args);
    match tokio::time::timeout(limit, command.output()).await {
        Ok(output) => output,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{} gave no answer within {:?}", program, limit),
        )),
    }
}

fn classify_snmp_failure(host: &str, stderr: &str) -> ConnectionError {
    let cause = format!("{}: {}", host, stderr);
    if stderr.contains("Timeout") {
        ConnectionError::timeout(cause)
    } else if stderr.contains("Unknown host") {
        ConnectionError::unreachable(cause)
    } else if stderr.contains("Authentication failure") || stderr.contains("Unknown user name") {
        ConnectionError::auth_failure(cause)
    } else {
        ConnectionError::protocol_fault(cause)
    }
}

/// Build the net-snmp command line for one request
fn snmp_request_argv(params: &SnmpParams, line: &str) -> Result<(String, Vec<String>), String> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or_else(|| "empty request".to_string())?;
    let operands: Vec<String> = words.map(str::to_string).collect();

    let program = match verb {
        "get" if !operands.is_empty() => "snmpget",
        "walk" if operands.len() == 1 => "snmpwalk",
        "set" if operands.len() == 3 => "snmpset",
        _ => return Err(format!("unsupported request {:?}", line)),
    };

    let mut args = Vec::new();
    match (&params.v3, &params.community) {
        (Some(v3), _) => {
            args.extend(["-v3".to_string(), "-u".to_string(), v3.user.clone()]);
            args.extend(["-l".to_string(), v3.security_level.clone()]);
            if let Some(protocol) = &v3.auth_protocol {
                args.extend(["-a".to_string(), protocol.clone()]);
            }
            if let Some(password) = &v3.auth_password {
                args.extend(["-A".to_string(), password.clone()]);
            }
            if let Some(protocol) = &v3.priv_protocol {
                args.extend(["-x".to_string(), protocol.clone()]);
            }
            if let Some(password) = &v3.priv_password {
                args.extend(["-X".to_string(), password.clone()]);
            }
        }
        (None, Some(community)) => {
            args.extend(["-v2c".to_string(), "-c".to_string(), community.clone()]);
        }
        (None, None) => return Err("no SNMP credentials".to_string()),
    }
    if let Some(timeout) = params.timeout {
        args.extend(["-t".to_string(), timeout.to_string()]);
    }
    args.push(params.host.clone());
    args.extend(operands);

    Ok((program.to_string(), args))
}

#[async_trait]
impl Transport for SnmpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Snmp
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::closed());
        }
        self.input.extend_from_slice(data);
        while let Some(end) = self.input.iter().position(|b| *b == b'\n') {
            let line = self.input.split_to(end + 1);
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if line.is_empty() {
                continue;
            }
            let reply = self.request(&line).await;
            self.replies.push_back(reply);
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, ConnectionError> {
        match self.replies.pop_front() {
            Some(reply) => {
                buf.extend_from_slice(&reply);
                Ok(reply.len())
            }
            None if self.closed => Ok(0),
            // requests are answered on write; nothing else will arrive
            None => futures::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.closed = true;
        self.replies.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::params::SnmpV3Credentials;

    fn ssh(policy: HostKeyPolicy, key: Option<&str>) -> SshParams {
        SshParams {
            host: "10.64.38.2".to_string(),
            username: "root".to_string(),
            password: Some("bigfoot1".to_string()),
            key_path: key.map(Into::into),
            port: 4002,
            prompt_patterns: Vec::new(),
            host_key_policy: policy,
        }
    }

    #[test]
    fn test_ssh_argv() {
        let argv = ssh_argv(&ssh(HostKeyPolicy::Strict, Some("/home/lab/.ssh/id_rsa")));
        assert_eq!(
            argv,
            vec![
                "ssh", "-tt", "-p", "4002", "-o", "StrictHostKeyChecking=yes", "-i",
                "/home/lab/.ssh/id_rsa", "root@10.64.38.2"
            ]
        );

        let argv = ssh_argv(&ssh(HostKeyPolicy::Ignore, None));
        assert!(argv.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(!argv.contains(&"-i".to_string()));
    }

    #[test]
    fn test_serial_argv() {
        let by_command = SerialParams {
            device_command: Some("cu -l /dev/ttyUSB0 -s 115200".to_string()),
            ..Default::default()
        };
        assert_eq!(serial_argv(&by_command), vec!["cu", "-l", "/dev/ttyUSB0", "-s", "115200"]);

        let by_port = SerialParams {
            com_port: Some("/dev/ttyUSB1".to_string()),
            baud_rate: Some(9600),
            ..Default::default()
        };
        assert_eq!(serial_argv(&by_port), vec!["picocom", "-b", "9600", "/dev/ttyUSB1"]);
    }

    #[test]
    fn test_snmp_argv() {
        let v2 = SnmpParams {
            host: "cm".to_string(),
            community: Some("private".to_string()),
            v3: None,
            timeout: Some(5),
        };
        let (program, args) = snmp_request_argv(&v2, "walk 1.3.6.1.2.1.2").unwrap();
        assert_eq!(program, "snmpwalk");
        assert_eq!(args, vec!["-v2c", "-c", "private", "-t", "5", "cm", "1.3.6.1.2.1.2"]);

        let v3 = SnmpParams {
            host: "cm".to_string(),
            community: None,
            v3: Some(SnmpV3Credentials {
                user: "admin".to_string(),
                security_level: "authNoPriv".to_string(),
                auth_protocol: Some("SHA".to_string()),
                auth_password: Some("secret".to_string()),
                priv_protocol: None,
                priv_password: None,
            }),
            timeout: None,
        };
        let (program, args) = snmp_request_argv(&v3, "set 1.3.6.1.2.1.1.5.0 s gw1").unwrap();
        assert_eq!(program, "snmpset");
        assert_eq!(
            args,
            vec!["-v3", "-u", "admin", "-l", "authNoPriv", "-a", "SHA", "-A", "secret", "cm", "1.3.6.1.2.1.1.5.0", "s", "gw1"]
        );

        assert!(snmp_request_argv(&v2, "bulkget 1.3").is_err());
        assert!(snmp_request_argv(&v2, "set 1.3").is_err());
    }

    #[test]
    fn test_snmp_failure_classification() {
        assert_eq!(
            classify_snmp_failure("cm", "Timeout: No Response from cm").kind,
            ConnectionErrorKind::Timeout
        );
        assert_eq!(
            classify_snmp_failure("cm", "snmpget: Unknown host (cm)").kind,
            ConnectionErrorKind::Unreachable
        );
        assert_eq!(
            classify_snmp_failure("cm", "snmpget: Authentication failure (incorrect password, community or key)").kind,
            ConnectionErrorKind::AuthFailure
        );
    }

    #[cfg(unix)]
    async fn login_outcome(output: &str) -> ConnectionError {
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!("echo '{}'; sleep 5", output));
        let mut transport = ProcessTransport::spawn(TransportKind::Ssh, "cpe", command).unwrap();
        let connector = ProcessConnector::default();
        let err = connector
            .login(&mut transport, Credentials::default(), &[])
            .await
            .unwrap_err();
        transport.close().await.unwrap();
        err
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_login_failure_classification() {
        let err = login_outcome("ssh: connect to host 10.64.38.2 port 22: Connection timed out").await;
        assert_eq!(err.kind, ConnectionErrorKind::Timeout);

        let err = login_outcome("ssh: connect to host 10.64.38.2 port 22: Connection refused").await;
        assert_eq!(err.kind, ConnectionErrorKind::Unreachable);

        let err = login_outcome("root@10.64.38.2: Permission denied (publickey,password).").await;
        assert_eq!(err.kind, ConnectionErrorKind::AuthFailure);
    }

    #[test]
    fn test_connector_follows_config() {
        let config = ConnectionConfig {
            connect_timeout_ms: 1_500,
            command_timeout_ms: 250,
            ..ConnectionConfig::default()
        };
        let connector = ProcessConnector::new(&config);
        assert_eq!(connector.login_timeout, Duration::from_millis(1_500));
        assert_eq!(connector.request_timeout, Duration::from_millis(250));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_bounded_by_timeout() {
        let started = std::time::Instant::now();
        let err = run_request("sleep", &["5".to_string()], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_missing_program_is_unreachable() {
        let command = Command::new("/nonexistent/benchfarm-console");
        let err = ProcessTransport::spawn(TransportKind::CliExec, "cpe", command).unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::Unreachable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_exec_round_trip() {
        let mut transport = ProcessTransport::spawn(TransportKind::CliExec, "local", Command::new("cat")).unwrap();
        transport.write(b"hello\n").await.unwrap();

        let mut buffer = ExpectBuffer::new();
        let found = buffer
            .expect(&mut transport, &[Regex::new("hello").unwrap()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found.matched, "hello");
        transport.close().await.unwrap();
    }
}
