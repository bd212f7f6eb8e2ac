/*!
 * Connection factory.
 *
 * Owns the retry policy and the per-kind connectors. Every attempt is
 * bounded by the connect timeout; transient failures are retried with
 * exponential backoff, and the whole sequence can be cancelled.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use benchfarm_core::{config::ConnectionConfig, utils::{with_backoff, RetryPolicy}};

use super::params::ConnectionParams;
use super::process::ProcessConnector;
use super::session::ConnectionSession;
use super::transport::Transport;
use super::{ConnectionError, TransportKind};

/// Prompt assumed for shell transports without configured patterns
pub const DEFAULT_SHELL_PROMPT: &str = r"[\$#>]\s*$";

/// Prompt printed by the SNMP request transport
pub const SNMP_PROMPT: &str = r"snmp> $";

/// Establishes a transport of one kind
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Make a single connection attempt for `owner`
    ///
    /// `prompts` are the patterns the session will use; connectors that log
    /// in to a shell wait for one of them before returning.
    async fn connect(
        &self,
        owner: &str,
        params: &ConnectionParams,
        prompts: &[Regex],
    ) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// Compile the prompt set a session for `params` uses
pub fn session_prompts(params: &ConnectionParams) -> Result<Vec<Regex>, ConnectionError> {
    let configured = params
        .compiled_prompts()
        .map_err(ConnectionError::protocol_fault)?;
    if !configured.is_empty() {
        return Ok(configured);
    }

    let fallback = match params.kind() {
        TransportKind::CliExec => return Ok(Vec::new()),
        TransportKind::Snmp => SNMP_PROMPT,
        _ => DEFAULT_SHELL_PROMPT,
    };
    Regex::new(fallback)
        .map(|re| vec![re])
        .map_err(|e| ConnectionError::protocol_fault(e.to_string()))
}

/// Opens sessions for any supported transport kind
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    policy: RetryPolicy,
    connect_timeout: Duration,
    command_timeout: Duration,
    connectors: HashMap<TransportKind, Arc<dyn Connector>>,
}

impl ConnectionFactory {
    /// Create a factory with process-backed connectors for every kind
    pub fn new(config: &ConnectionConfig) -> Self {
        let process: Arc<dyn Connector> = Arc::new(ProcessConnector::new(config));
        Self {
            policy: config.retry_policy(),
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
            connectors: TransportKind::ALL
                .iter()
                .map(|kind| (*kind, process.clone()))
                .collect(),
        }
    }

    /// Replace the connector for one transport kind
    pub fn with_connector(mut self, kind: TransportKind, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(kind, connector);
        self
    }

    /// Replace the connector for every transport kind
    pub fn with_connector_for_all(mut self, connector: Arc<dyn Connector>) -> Self {
        for kind in TransportKind::ALL {
            self.connectors.insert(kind, connector.clone());
        }
        self
    }

    /// Get the retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open a new session for `owner`
    pub async fn open(
        &self,
        owner: &str,
        params: &ConnectionParams,
        cancel: &CancellationToken,
    ) -> Result<ConnectionSession, ConnectionError> {
        let mut session = ConnectionSession::new(owner, params.kind(), self.command_timeout);
        self.connect(&mut session, params, cancel).await?;
        Ok(session)
    }

    /// Drive `session` from `Closed` or `Faulted` to `Open`
    ///
    /// On failure the session is left `Faulted`.
    pub async fn connect(
        &self,
        session: &mut ConnectionSession,
        params: &ConnectionParams,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        if session.kind() != params.kind() {
            return Err(ConnectionError::protocol_fault(format!(
                "session for {} is {} but parameters describe {}",
                session.owner(),
                session.kind(),
                params.kind()
            )));
        }
        session.begin_connect()?;

        let outcome = self.establish(session.owner(), params, cancel).await;
        match outcome {
            Ok((transport, prompts)) => session.attach(transport, prompts),
            Err(e) => {
                warn!("Connection for {} to {} failed: {}", session.owner(), params.target(), e);
                session.fault().await;
                Err(e)
            }
        }
    }

    /// Reopen a faulted or closed session with the same retry policy
    pub async fn reconnect(
        &self,
        session: &mut ConnectionSession,
        params: &ConnectionParams,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        info!("Reconnecting {} ({})", session.owner(), session.state());
        self.connect(session, params, cancel).await
    }

    /// Close a session; safe on closed or faulted sessions
    pub async fn close(&self, session: &mut ConnectionSession) {
        session.close().await;
    }

    async fn establish(
        &self,
        owner: &str,
        params: &ConnectionParams,
        cancel: &CancellationToken,
    ) -> Result<(Box<dyn Transport>, Vec<Regex>), ConnectionError> {
        params.validate().map_err(ConnectionError::protocol_fault)?;
        let prompts = session_prompts(params)?;
        let connector = self
            .connectors
            .get(&params.kind())
            .cloned()
            .ok_or_else(|| ConnectionError::unreachable(format!("no connector for {}", params.kind())))?;

        let connect_timeout = self.connect_timeout;
        let attempts = with_backoff(&self.policy, ConnectionError::is_transient, |attempt| {
            let connector = connector.clone();
            let prompts = &prompts;
            async move {
                debug!(
                    "Connecting {} to {} over {} (attempt {})",
                    owner,
                    params.target(),
                    params.kind(),
                    attempt
                );
                match tokio::time::timeout(connect_timeout, connector.connect(owner, params, prompts)).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::timeout(format!(
                        "no connection to {} within {:?}",
                        params.target(),
                        connect_timeout
                    ))),
                }
            }
        });

        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::cancelled()),
            result = attempts => result,
        }?;
        Ok((transport, prompts))
    }
}
