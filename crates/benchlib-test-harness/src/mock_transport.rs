//! Mock transport for deterministic testing of the SCPI engine.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! command/reply pairs. This lets you test command generation, reply
//! collection and parsing without an instrument.
//!
//! # Example
//!
//! ```
//! use benchlib_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the engine sends this command, make this reply readable.
//! mock.expect("*IDN?", b"RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04\n");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;

use benchlib_core::error::{Error, Result};
use benchlib_core::transport::Transport;

/// A pre-loaded command/reply pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact command we expect to be sent, without terminator.
    command: String,
    /// Bytes made readable once the command arrives. May be empty.
    reply: Vec<u8>,
}

/// A mock [`Transport`] for testing without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the command
/// is recorded and matched against the next expectation, and its reply is
/// appended to the bytes `read_data()` hands out.
///
/// If the command does not match or the queue is exhausted, an error is
/// returned.
#[derive(Debug)]
pub struct MockTransport {
    expectations: VecDeque<Expectation>,
    /// Reply bytes not yet read.
    pending: VecDeque<u8>,
    connected: bool,
    /// Log of all commands sent through this transport.
    sent_log: Vec<String>,
    /// Report at most this many bytes written per send.
    write_limit: Option<usize>,
    /// Hand out at most this many bytes per read.
    chunk_size: usize,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            expectations: VecDeque::new(),
            pending: VecDeque::new(),
            connected: true,
            sent_log: Vec::new(),
            write_limit: None,
            chunk_size: usize::MAX,
        }
    }

    /// Add an expected command and the reply it produces.
    pub fn expect(&mut self, command: &str, reply: &[u8]) {
        self.expectations.push_back(Expectation {
            command: command.to_string(),
            reply: reply.to_vec(),
        });
    }

    /// Make bytes readable without any command.
    pub fn push_reply(&mut self, reply: &[u8]) {
        self.pending.extend(reply);
    }

    /// All commands sent so far, in order.
    pub fn sent_data(&self) -> &[String] {
        &self.sent_log
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent I/O returns [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Simulate short writes.
    pub fn set_write_limit(&mut self, limit: Option<usize>) {
        self.write_limit = limit;
    }

    /// Simulate a slow link that delivers replies in small pieces.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn terminator(&self) -> &'static str {
        "\n"
    }

    async fn send(&mut self, command: &str) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        self.sent_log.push(command.to_string());

        let Some(expectation) = self.expectations.pop_front() else {
            return Err(Error::Protocol(format!(
                "no more expectations in mock transport (got {command:?})"
            )));
        };
        if command != expectation.command {
            return Err(Error::Protocol(format!(
                "unexpected command: expected {:?}, got {:?}",
                expectation.command, command
            )));
        }
        self.pending.extend(expectation.reply);

        let line_len = command.len() + 1;
        Ok(self.write_limit.map_or(line_len, |limit| limit.min(line_len)))
    }

    async fn read_begin(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        let n = buf.len().min(self.pending.len()).min(self.chunk_size);
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn read_complete(&self) -> bool {
        self.pending.is_empty()
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn description(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_basic_send_receive() {
        let mut mock = MockTransport::new();
        mock.expect(":TIM:SCAL?", b"1.0e-3\n");

        assert_eq!(mock.send(":TIM:SCAL?").await.unwrap(), 11);
        assert_eq!(mock.receive().await.unwrap(), "1.0e-3");
    }

    #[tokio::test]
    async fn mock_transport_tracks_sent_data() {
        let mut mock = MockTransport::new();
        mock.expect(":RUN", b"");
        mock.expect(":STOP", b"");

        mock.send(":RUN").await.unwrap();
        mock.send(":STOP").await.unwrap();

        assert_eq!(mock.sent_data(), &[":RUN".to_string(), ":STOP".to_string()]);
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn mock_transport_wrong_command_errors() {
        let mut mock = MockTransport::new();
        mock.expect(":RUN", b"");

        let result = mock.send(":STOP").await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_no_expectations_errors() {
        let mut mock = MockTransport::new();
        assert!(matches!(mock.send("*RST").await.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_read_without_reply_is_empty() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 64];
        assert_eq!(mock.read_data(&mut buf).await.unwrap(), 0);
        assert!(mock.read_complete());
    }

    #[tokio::test]
    async fn mock_transport_disconnect() {
        let mut mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.close().await.unwrap();
        assert!(!mock.is_connected());
        assert!(matches!(mock.send("*CLS").await.unwrap_err(), Error::NotConnected));

        let mut buf = [0u8; 8];
        assert!(matches!(mock.read_data(&mut buf).await.unwrap_err(), Error::NotConnected));

        mock.open().await.unwrap();
        assert!(mock.is_connected());
    }

    #[tokio::test]
    async fn mock_transport_chunked_reads() {
        let mut mock = MockTransport::new();
        mock.set_chunk_size(2);
        mock.push_reply(&[0xAA, 0xBB, 0xCC]);

        let mut buf = [0u8; 8];
        assert_eq!(mock.read_data(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[0xAA, 0xBB]);
        assert!(!mock.read_complete());
        assert_eq!(mock.read_data(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], 0xCC);
        assert!(mock.read_complete());
    }

    #[tokio::test]
    async fn mock_transport_write_limit() {
        let mut mock = MockTransport::new();
        mock.set_write_limit(Some(2));
        mock.expect(":SING", b"");
        assert_eq!(mock.send(":SING").await.unwrap(), 2);
    }
}
