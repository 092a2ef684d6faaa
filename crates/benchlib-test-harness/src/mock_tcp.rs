//! Mock TCP server for transport-level testing.
//!
//! [`MockTcpServer`] provides a localhost listener pre-loaded with scripted
//! replies, enabling deterministic testing of the TCP transport and of
//! drivers talking to a LAN instrument, without any instrument on the
//! network.
//!
//! # Example
//!
//! ```
//! use benchlib_test_harness::MockTcpServer;
//!
//! # async fn example() -> benchlib_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//!
//! // When the client sends "*IDN?\r\n", answer with an identification line.
//! server.expect("*IDN?", b"RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04\n");
//!
//! // Connect a TcpTransport to this address.
//! let addr = server.addr().to_string();
//! server.start();
//! // ... connect and test ...
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use benchlib_core::error::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A pre-loaded command/reply pair for the mock TCP server.
#[derive(Debug, Clone)]
struct TcpExpectation {
    /// The command line the client must send, without line terminator.
    command: String,
    /// Bytes written back once the command arrives. May be empty.
    reply: Vec<u8>,
}

/// A mock SCPI-over-TCP server.
///
/// The server listens on a random port on localhost. Once started it
/// accepts a single connection and processes expectations in order: for
/// each one it reads a `\n`-terminated line from the client, checks it
/// against the expected command and writes back the reply.
///
/// If the client sends a line that does not match, the server task fails
/// with a description of the mismatch, which [`wait`](MockTcpServer::wait)
/// reports.
pub struct MockTcpServer {
    /// The address the server is listening on (e.g., "127.0.0.1:54321").
    addr: String,
    /// Bound listener, moved into the server task on start.
    listener: Option<TcpListener>,
    expectations: VecDeque<TcpExpectation>,
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockTcpServer {
    /// Create a new mock TCP server listening on a random port.
    ///
    /// No connection is accepted until [`start`](MockTcpServer::start) is
    /// called, so expectations can be loaded first.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {}", e)))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();

        Ok(Self {
            addr,
            listener: Some(listener),
            expectations: VecDeque::new(),
            server_handle: None,
        })
    }

    /// Add an expected command line and the bytes sent back for it.
    pub fn expect(&mut self, command: &str, reply: &[u8]) {
        self.expectations.push_back(TcpExpectation {
            command: command.to_string(),
            reply: reply.to_vec(),
        });
    }

    /// Like [`expect`](MockTcpServer::expect), wrapping the reply in the
    /// 4-byte little-endian length envelope used by Rigol LAN firmware.
    pub fn expect_length_prefixed(&mut self, command: &str, reply: &[u8]) {
        self.expect(command, &length_prefixed(reply));
    }

    /// Get the address the server is listening on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Start the server, accepting a single client connection and
    /// processing all expectations in a background task.
    ///
    /// Call [`wait`](MockTcpServer::wait) afterwards to check that every
    /// expectation was met.
    pub fn start(&mut self) {
        let _ = self.start_with_ready();
    }

    /// Start the server and return a channel that fires once the task is
    /// accepting connections.
    pub fn start_with_ready(&mut self) -> oneshot::Receiver<()> {
        let listener = self.listener.take();
        let expectations: Vec<TcpExpectation> = self.expectations.drain(..).collect();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let listener = listener.ok_or_else(|| "mock TCP server already started".to_string())?;
            let _ = ready_tx.send(());

            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {}", e))?;

            for (i, expectation) in expectations.iter().enumerate() {
                let line = read_line(&mut stream)
                    .await
                    .map_err(|e| format!("expectation {}: {}", i, e))?;

                if line != expectation.command {
                    return Err(format!(
                        "expectation {}: command mismatch: expected {:?}, got {:?}",
                        i, expectation.command, line
                    ));
                }

                stream
                    .write_all(&expectation.reply)
                    .await
                    .map_err(|e| format!("expectation {}: write error: {}", i, e))?;
                stream
                    .flush()
                    .await
                    .map_err(|e| format!("expectation {}: flush error: {}", i, e))?;
            }

            Ok(())
        });

        self.server_handle = Some(handle);
        ready_rx
    }

    /// Wait for the server task to complete and return any errors.
    pub async fn wait(self) -> std::result::Result<(), String> {
        if let Some(handle) = self.server_handle {
            handle
                .await
                .map_err(|e| format!("server task panicked: {}", e))?
        } else {
            Ok(())
        }
    }
}

/// Wrap `reply` in a 4-byte little-endian length envelope.
pub fn length_prefixed(reply: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(reply.len() + 4);
    framed.extend_from_slice(&(reply.len() as u32).to_le_bytes());
    framed.extend_from_slice(reply);
    framed
}

/// Read one `\n`-terminated line, dropping the `\r\n` or `\n`.
async fn read_line(stream: &mut TcpStream) -> std::result::Result<String, String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| format!("read error: {}", e))?;
        if n == 0 {
            return Err(format!(
                "client disconnected after {} bytes of a command",
                line.len()
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
