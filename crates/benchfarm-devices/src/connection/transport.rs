/*!
 * Byte-stream transports and expect-style pattern matching.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use regex::Regex;
use tokio::time::Instant;
use tracing::trace;

use super::{ConnectionError, TransportKind};

/// Characters of buffered output quoted in timeout diagnostics
const TAIL_CHARS: usize = 200;

/// A connected byte stream
///
/// All transport kinds are reduced to this surface so that sessions do not
/// need to know what they are talking to.
#[async_trait]
pub trait Transport: Send + Debug {
    /// The transport kind
    fn kind(&self) -> TransportKind;

    /// Write bytes to the peer
    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Append received bytes to `buf`, waiting until at least one arrives
    ///
    /// Returns `Ok(0)` at end of stream.
    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, ConnectionError>;

    /// Release the underlying resource
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Result of a successful pattern wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Index of the pattern that matched
    pub index: usize,
    /// Output preceding the match
    pub before: String,
    /// The matched text
    pub matched: String,
    /// Capture groups of the matching pattern (empty for groups that did not participate)
    pub groups: Vec<String>,
}

/// Output buffer that matches regular expressions against a transport's stream
#[derive(Debug, Default)]
pub struct ExpectBuffer {
    raw: BytesMut,
    pending: String,
}

impl ExpectBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded output not yet consumed by a match
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Drop all buffered output
    pub fn clear(&mut self) {
        self.raw.clear();
        self.pending.clear();
    }

    /// Wait until one of `patterns` appears, consuming output up to the end of the match
    ///
    /// The earliest match in the stream wins; on equal positions the lower
    /// pattern index wins.
    pub async fn expect(
        &mut self,
        transport: &mut dyn Transport,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<PatternMatch, ConnectionError> {
        if patterns.is_empty() {
            return Err(ConnectionError::protocol_fault("await with an empty pattern set"));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.take_match(patterns) {
                trace!("Matched pattern {} ({:?})", found.index, found.matched);
                return Ok(found);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(patterns, timeout));
            }

            match tokio::time::timeout(remaining, transport.read(&mut self.raw)).await {
                Err(_) => return Err(self.timeout_error(patterns, timeout)),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(0)) => {
                    self.decode();
                    if let Some(found) = self.take_match(patterns) {
                        return Ok(found);
                    }
                    return Err(ConnectionError::protocol_fault(format!(
                        "end of stream while waiting for {}; last output: {:?}",
                        describe(patterns),
                        self.tail()
                    )));
                }
                Ok(Ok(_)) => self.decode(),
            }
        }
    }

    fn take_match(&mut self, patterns: &[Regex]) -> Option<PatternMatch> {
        let (index, captures) = patterns
            .iter()
            .enumerate()
            .filter_map(|(i, re)| re.captures(&self.pending).map(|c| (i, c)))
            .min_by_key(|(i, c)| (c.get(0).map_or(usize::MAX, |m| m.start()), *i))?;

        let whole = captures.get(0)?;
        let (start, end) = (whole.start(), whole.end());
        let groups = captures
            .iter()
            .skip(1)
            .map(|g| g.map_or_else(String::new, |m| m.as_str().to_string()))
            .collect();

        let found = PatternMatch {
            index,
            before: self.pending[..start].to_string(),
            matched: self.pending[start..end].to_string(),
            groups,
        };
        self.pending.drain(..end);
        Some(found)
    }

    fn decode(&mut self) {
        loop {
            match std::str::from_utf8(&self.raw) {
                Ok(text) => {
                    self.pending.push_str(text);
                    self.raw.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.pending
                        .push_str(&String::from_utf8_lossy(&self.raw[..valid]));
                    match e.error_len() {
                        // incomplete sequence at the end; wait for the rest
                        None => {
                            self.raw.advance(valid);
                            return;
                        }
                        Some(len) => {
                            self.pending.push(char::REPLACEMENT_CHARACTER);
                            self.raw.advance(valid + len);
                        }
                    }
                }
            }
        }
    }

    fn tail(&self) -> String {
        let count = self.pending.chars().count();
        self.pending.chars().skip(count.saturating_sub(TAIL_CHARS)).collect()
    }

    fn timeout_error(&self, patterns: &[Regex], timeout: Duration) -> ConnectionError {
        ConnectionError::timeout(format!(
            "none of {} seen within {:?}; last output: {:?}",
            describe(patterns),
            timeout,
            self.tail()
        ))
    }
}

fn describe(patterns: &[Regex]) -> String {
    let list: Vec<&str> = patterns.iter().map(Regex::as_str).collect();
    format!("{:?}", list)
}
