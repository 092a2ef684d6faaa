//! TCP transport for instrument communication.
//!
//! This module provides [`TcpTransport`], which implements the [`Transport`]
//! trait for LAN instruments that accept raw SCPI over a TCP socket
//! (typically port 5555 or 5025). Commands are terminated with `\r\n`.
//!
//! Two reply framings are supported, selected with [`TcpFraming`]:
//!
//! - [`Raw`](TcpFraming::Raw): no envelope. A reply is considered complete
//!   when a read returns fewer bytes than were asked for.
//! - [`LengthPrefixed`](TcpFraming::LengthPrefixed): every reply is
//!   preceded by a 4-byte little-endian length, as sent by Rigol LAN
//!   firmware. The prefix is stripped and the reply is complete once that
//!   many bytes have arrived.
//!
//! # Example
//!
//! ```no_run
//! use benchlib_transport::{TcpFraming, TcpTransport};
//! use benchlib_core::transport::Transport;
//!
//! # async fn example() -> benchlib_core::Result<()> {
//! let mut transport = TcpTransport::new("192.168.1.50:5555", TcpFraming::Raw);
//! transport.open().await?;
//!
//! transport.send("*IDN?").await?;
//! let idn = transport.receive().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use benchlib_core::error::{Error, Result};
use benchlib_core::transport::{Transport, strip_terminator};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::map_io_error;

/// Default connection timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default budget for a whole [`Transport::receive`] call.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a single `read_data` call waits for bytes.
const READ_WINDOW: Duration = Duration::from_millis(10);

/// Size of the little-endian length envelope in
/// [`TcpFraming::LengthPrefixed`] mode.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Reply framing on a TCP link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpFraming {
    #[default]
    Raw,
    LengthPrefixed,
}

/// TCP transport for instrument communication.
#[derive(Debug)]
pub struct TcpTransport {
    /// The underlying TCP stream, `None` before `open()` and after `close()`.
    stream: Option<TcpStream>,
    /// The address string for logging/debugging.
    addr: String,
    framing: TcpFraming,
    connect_timeout: Duration,
    read_timeout: Duration,
    complete: bool,
    prefix: [u8; LENGTH_PREFIX_SIZE],
    prefix_filled: usize,
    response_length: Option<usize>,
    response_read: usize,
}

impl TcpTransport {
    /// Create an unopened transport for a `host:port` address.
    pub fn new(addr: &str, framing: TcpFraming) -> Self {
        TcpTransport {
            stream: None,
            addr: addr.to_string(),
            framing,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            complete: false,
            prefix: [0; LENGTH_PREFIX_SIZE],
            prefix_filled: 0,
            response_length: None,
            response_read: 0,
        }
    }

    /// Connect to a raw-framed endpoint using the default timeout.
    pub async fn connect(addr: &str) -> Result<Self> {
        let mut transport = Self::new(addr, TcpFraming::Raw);
        transport.open().await?;
        Ok(transport)
    }

    /// Override the connection timeout (default 5 s).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the budget for a single `receive()` (default 1 s).
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Wrap an existing `TcpStream` as a `TcpTransport`.
    ///
    /// This is useful when a TCP connection has already been established
    /// externally (e.g., accepted from a listener in tests).
    pub fn from_stream(stream: TcpStream, addr: String, framing: TcpFraming) -> Self {
        tracing::debug!(addr = %addr, ?framing, "Wrapping existing TCP stream");
        let mut transport = Self::new(&addr, framing);
        transport.stream = Some(stream);
        transport
    }

    /// Get the address string this transport connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn framing(&self) -> TcpFraming {
        self.framing
    }

    /// Read the next chunk of the current reply, honoring the framing.
    async fn read_framed(&mut self, buf: &mut [u8], window: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        match self.framing {
            TcpFraming::Raw => {
                let Some(n) = read_window(stream, buf, window, &self.addr).await? else {
                    return Ok(0);
                };
                self.complete = n < buf.len();
                Ok(n)
            }
            TcpFraming::LengthPrefixed => {
                let length = match self.response_length {
                    Some(length) => length,
                    None => {
                        let filled = self.prefix_filled;
                        let Some(n) =
                            read_window(stream, &mut self.prefix[filled..], window, &self.addr).await?
                        else {
                            return Ok(0);
                        };
                        self.prefix_filled += n;
                        if self.prefix_filled < LENGTH_PREFIX_SIZE {
                            return Ok(0);
                        }
                        let length = u32::from_le_bytes(self.prefix) as usize;
                        tracing::trace!(addr = %self.addr, length, "Received length prefix");
                        self.response_length = Some(length);
                        length
                    }
                };

                let remaining = length.saturating_sub(self.response_read);
                if remaining == 0 {
                    self.complete = true;
                    return Ok(0);
                }

                let want = remaining.min(buf.len());
                let Some(n) = read_window(stream, &mut buf[..want], window, &self.addr).await? else {
                    return Ok(0);
                };
                self.response_read += n;
                self.complete = self.response_read >= length;
                Ok(n)
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        let addr = self.addr.clone();
        tracing::debug!(
            addr = %addr,
            framing = ?self.framing,
            timeout_ms = self.connect_timeout.as_millis(),
            "Connecting to TCP endpoint"
        );

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                tracing::error!(addr = %addr, "TCP connection timed out");
                Error::Timeout
            })?
            .map_err(|e| {
                tracing::error!(addr = %addr, error = %e, "TCP connection failed");
                map_connect_error(e, &addr)
            })?;

        // SCPI commands are small and latency-sensitive.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(
                addr = %addr,
                error = %e,
                "Failed to set TCP_NODELAY (continuing anyway)"
            );
        }

        tracing::info!(addr = %addr, "TCP connection established");
        self.stream = Some(stream);
        Ok(())
    }

    fn terminator(&self) -> &'static str {
        "\r\n"
    }

    async fn send(&mut self, command: &str) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let line = format!("{command}\r\n");

        tracing::trace!(addr = %self.addr, command = %command, "Sending command");

        let written = stream.write(line.as_bytes()).await.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to send command");
            map_io_error(e)
        })?;

        if written < line.len() {
            tracing::debug!(
                addr = %self.addr,
                written,
                expected = line.len(),
                "Short TCP write"
            );
        }

        Ok(written)
    }

    /// Receive one reply with a single read.
    ///
    /// In length-prefixed mode the read continues until the envelope is
    /// satisfied or the read timeout expires.
    async fn receive(&mut self) -> Result<String> {
        self.read_begin().await?;

        let deadline = Instant::now() + self.read_timeout;
        let mut response = Vec::new();
        let mut buf = vec![0u8; 4096];

        loop {
            let window = deadline.saturating_duration_since(Instant::now());
            if window.is_zero() {
                break;
            }
            let n = self.read_framed(&mut buf, window).await?;
            response.extend_from_slice(&buf[..n]);
            if self.framing == TcpFraming::Raw || self.complete {
                break;
            }
        }

        if response.is_empty() && !self.complete {
            tracing::trace!(addr = %self.addr, "Timeout waiting for reply");
            return Err(Error::Timeout);
        }
        if self.framing == TcpFraming::LengthPrefixed && !self.complete {
            return Err(Error::Protocol(format!(
                "reply truncated: length prefix announced {} bytes, got {}",
                self.response_length.unwrap_or(0),
                self.response_read
            )));
        }
        Ok(strip_terminator(&response))
    }

    async fn read_begin(&mut self) -> Result<()> {
        self.complete = false;
        self.prefix_filled = 0;
        self.response_length = None;
        self.response_read = 0;
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_framed(buf, READ_WINDOW).await
    }

    fn read_complete(&self) -> bool {
        self.complete
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(addr = %self.addr, "Closing TCP connection");

            if let Err(e) = stream.shutdown().await {
                tracing::warn!(
                    addr = %self.addr,
                    error = %e,
                    "Failed to shutdown TCP stream (continuing anyway)"
                );
            }

            tracing::info!(addr = %self.addr, "TCP connection closed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn description(&self) -> String {
        match self.framing {
            TcpFraming::Raw => format!("tcp-raw/{}", self.addr),
            TcpFraming::LengthPrefixed => format!("tcp-rigol/{}", self.addr),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if self.stream.is_some() {
            tracing::debug!(addr = %self.addr, "TcpTransport dropped, closing connection");
        }
    }
}

/// One read bounded by `window`. `None` means nothing arrived in time.
async fn read_window(
    stream: &mut TcpStream,
    buf: &mut [u8],
    window: Duration,
    addr: &str,
) -> Result<Option<usize>> {
    match tokio::time::timeout(window, stream.read(buf)).await {
        Ok(Ok(0)) if !buf.is_empty() => {
            // 0 bytes read means the peer has closed the connection.
            tracing::warn!(addr = %addr, "Peer closed connection (0 bytes read)");
            Err(Error::ConnectionLost)
        }
        Ok(Ok(n)) => {
            tracing::trace!(addr = %addr, bytes = n, data = ?&buf[..n], "Received data");
            Ok(Some(n))
        }
        Ok(Err(e)) => {
            tracing::error!(addr = %addr, error = %e, "Failed to receive data");
            Err(map_io_error(e))
        }
        Err(_) => Ok(None),
    }
}

/// Map a connection-time I/O error to the appropriate [`Error`] variant.
fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Error::Transport(format!("connection refused: {}", addr))
        }
        _ => Error::Io(e),
    }
}
