/*!
 * Connection sessions.
 *
 * A session is the one live transport to a device. Its state machine is
 * `Closed → Connecting → Open`, with `Faulted` reachable from `Connecting`
 * and `Open`. Going back to `Connecting` is only possible through an
 * explicit reconnect.
 */
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use benchfarm_core::types::Id;

use super::transport::{ExpectBuffer, PatternMatch, Transport};
use super::{ConnectionError, ConnectionErrorKind, TransportKind};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Not connected
    Closed,
    /// A connection attempt is in progress
    Connecting,
    /// Connected and usable
    Open,
    /// The connection failed or broke
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Output of a command run over a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Command output with the echoed command line removed
    pub output: String,
    /// Exit status, when the transport reports one
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Whether the command reported success (or no status at all)
    pub fn success(&self) -> bool {
        self.exit_code.map_or(true, |code| code == 0)
    }
}

/// A transport connection owned by one device
pub struct ConnectionSession {
    id: Id,
    owner: String,
    kind: TransportKind,
    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    buffer: ExpectBuffer,
    prompts: Vec<Regex>,
    default_timeout: Duration,
    command_seq: u64,
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("prompts", &self.prompts.len())
            .finish()
    }
}

impl ConnectionSession {
    /// Create a closed session for `owner`
    pub fn new<S: Into<String>>(owner: S, kind: TransportKind, default_timeout: Duration) -> Self {
        Self {
            id: Id::new(),
            owner: owner.into(),
            kind,
            state: SessionState::Closed,
            transport: None,
            buffer: ExpectBuffer::new(),
            prompts: Vec::new(),
            default_timeout,
            command_seq: 0,
        }
    }

    /// Get the session ID
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Name of the owning device
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Transport kind
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session is open
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Shell prompt patterns used by [`ConnectionSession::await_prompt`]
    pub fn prompts(&self) -> &[Regex] {
        &self.prompts
    }

    /// Timeout used when a call passes `None`
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Enter `Connecting`; allowed from `Closed` and `Faulted` only
    pub fn begin_connect(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            SessionState::Closed | SessionState::Faulted => {
                trace!("Session {} for {}: {} -> Connecting", self.id, self.owner, self.state);
                self.state = SessionState::Connecting;
                self.buffer.clear();
                Ok(())
            }
            other => Err(ConnectionError::protocol_fault(format!(
                "cannot connect session for {} from state {}",
                self.owner, other
            ))),
        }
    }

    /// Bind a connected transport and enter `Open`
    pub fn attach(&mut self, transport: Box<dyn Transport>, prompts: Vec<Regex>) -> Result<(), ConnectionError> {
        if self.state != SessionState::Connecting {
            return Err(ConnectionError::protocol_fault(format!(
                "cannot attach transport to session for {} in state {}",
                self.owner, self.state
            )));
        }

        debug!("Session {} for {} is open over {}", self.id, self.owner, self.kind);
        self.transport = Some(transport);
        self.prompts = prompts;
        self.state = SessionState::Open;
        Ok(())
    }

    /// Release any transport and enter `Faulted`
    pub async fn fault(&mut self) {
        self.release().await;
        self.state = SessionState::Faulted;
    }

    /// Send raw bytes
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let result = match self.transport.as_mut() {
            Some(transport) if self.state == SessionState::Open => transport.write(data).await,
            _ => return Err(ConnectionError::closed()),
        };

        if let Err(e) = &result {
            warn!("Write to {} failed: {}", self.owner, e);
            self.fault().await;
        }
        result
    }

    /// Send a line terminated by a newline
    pub async fn send_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send(&data).await
    }

    /// Wait until one of `patterns` appears in the output
    ///
    /// A timeout leaves the session open; any other failure faults it.
    pub async fn await_pattern(
        &mut self,
        patterns: &[Regex],
        timeout: Option<Duration>,
    ) -> Result<PatternMatch, ConnectionError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let result = match self.transport.as_mut() {
            Some(transport) if self.state == SessionState::Open => {
                self.buffer.expect(transport.as_mut(), patterns, timeout).await
            }
            _ => return Err(ConnectionError::closed()),
        };

        if let Err(e) = &result {
            if e.kind != ConnectionErrorKind::Timeout && e.kind != ConnectionErrorKind::Closed {
                warn!("Session for {} faulted: {}", self.owner, e);
                self.fault().await;
            }
        }
        result
    }

    /// Wait for the shell prompt
    pub async fn await_prompt(&mut self, timeout: Option<Duration>) -> Result<PatternMatch, ConnectionError> {
        if self.prompts.is_empty() {
            return Err(ConnectionError::protocol_fault(format!(
                "no prompt patterns configured for {}",
                self.owner
            )));
        }
        let prompts = self.prompts.clone();
        self.await_pattern(&prompts, timeout).await
    }

    /// Run a command and collect its output
    ///
    /// Shell transports get a completion marker appended to the command so
    /// that the exit status can be read back. SNMP sessions answer each
    /// request line followed by their prompt and report no exit status.
    pub async fn run_command(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::closed());
        }

        if self.kind == TransportKind::Snmp {
            self.send_line(command).await?;
            let reply = self.await_prompt(timeout).await?;
            return Ok(CommandOutput {
                output: clean_output(&reply.before, command),
                exit_code: None,
            });
        }

        self.command_seq += 1;
        let marker = format!("__BF_DONE_{}_", self.command_seq);
        let done = Regex::new(&format!(r"{}(\d+)__", marker))
            .map_err(|e| ConnectionError::protocol_fault(e.to_string()))?;

        debug!("{}: running {:?}", self.owner, command);
        self.send_line(&format!("{}; echo {}$?__", command, marker)).await?;
        let found = self.await_pattern(std::slice::from_ref(&done), timeout).await?;
        let exit_code = found.groups.first().and_then(|code| code.parse().ok());

        if !self.prompts.is_empty() {
            self.await_prompt(timeout).await?;
        }

        Ok(CommandOutput {
            output: clean_output(&found.before, &marker),
            exit_code,
        })
    }

    /// Close the session
    ///
    /// Safe on a closed or faulted session. A faulted session stays faulted.
    pub async fn close(&mut self) {
        self.release().await;
        if self.state != SessionState::Faulted {
            if self.state != SessionState::Closed {
                debug!("Session {} for {} closed", self.id, self.owner);
            }
            self.state = SessionState::Closed;
        }
    }

    async fn release(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Closing transport for {} failed: {}", self.owner, e);
            }
        }
        self.buffer.clear();
    }
}

/// Drop the echoed command line and terminal carriage returns
fn clean_output(raw: &str, echoed: &str) -> String {
    let lines: Vec<&str> = raw
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.contains(echoed))
        .collect();

    let start = lines.iter().position(|l| !l.is_empty()).unwrap_or(lines.len());
    let end = lines.iter().rposition(|l| !l.is_empty()).map_or(start, |i| i + 1);
    lines[start..end].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    fn prompt() -> Vec<Regex> {
        vec![Regex::new(r"[\$#>]\s*$").unwrap()]
    }

    fn open_session(transport: ScriptedTransport) -> ConnectionSession {
        let mut session = ConnectionSession::new("lan", TransportKind::Ssh, Duration::from_secs(1));
        session.begin_connect().unwrap();
        session.attach(Box::new(transport), prompt()).unwrap();
        session
    }

    #[test]
    fn test_state_transitions() {
        let mut session = ConnectionSession::new("cpe", TransportKind::Serial, Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Closed);

        session.begin_connect().unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        // already connecting
        assert!(session.begin_connect().is_err());
    }

    #[tokio::test]
    async fn test_attach_requires_connecting() {
        let mut session = ConnectionSession::new("cpe", TransportKind::Serial, Duration::from_secs(1));
        let result = session.attach(Box::new(ScriptedTransport::new(TransportKind::Serial)), prompt());
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_run_command() {
        let transport = ScriptedTransport::new(TransportKind::Ssh).respond("uname -n", "lan-client");
        let mut session = open_session(transport);

        let result = session.run_command("uname -n", None).await.unwrap();
        assert_eq!(result.output, "lan-client");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.success());

        // a second command uses a fresh marker
        let result = session.run_command("uname -n", None).await.unwrap();
        assert_eq!(result.output, "lan-client");
    }

    #[tokio::test]
    async fn test_send_on_closed_session() {
        let mut session = ConnectionSession::new("wan", TransportKind::Ssh, Duration::from_secs(1));
        let err = session.send_line("true").await.unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_await_timeout_keeps_session_open() {
        let mut session = open_session(ScriptedTransport::new(TransportKind::Ssh));
        let patterns = vec![Regex::new("never").unwrap()];

        let err = session
            .await_pattern(&patterns, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut session = open_session(ScriptedTransport::new(TransportKind::Ssh));
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_keeps_faulted() {
        let mut session = open_session(ScriptedTransport::new(TransportKind::Ssh));
        session.fault().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Faulted);

        // reconnect is allowed from Faulted
        assert!(session.begin_connect().is_ok());
    }

    #[test]
    fn test_clean_output() {
        let raw = "ls; echo __BF_DONE_3_$?__\r\nbin\r\netc\r\n";
        assert_eq!(clean_output(raw, "__BF_DONE_3_"), "bin\netc");
    }
}
