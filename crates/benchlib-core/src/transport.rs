//! Transport trait for instrument communication.
//!
//! The [`Transport`] trait abstracts over the physical link to a bench
//! instrument. Implementations exist for serial ports, raw and
//! length-prefixed TCP sockets, USB-TMC character devices, VXI-11 RPC links
//! and (optionally) linux-gpib descriptors, plus mock transports for
//! testing.
//!
//! The SCPI engine in `benchlib-scpi` operates on a `Transport` rather than
//! directly on a socket or port, enabling both real hardware control and
//! deterministic unit testing with the mocks from `benchlib-test-harness`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::session::PollSource;

/// How many times [`Transport::receive`] polls for more bytes before giving up.
pub const RECEIVE_RETRIES: usize = 100;

/// Pause between empty polls in [`Transport::receive`].
pub const RECEIVE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Asynchronous byte-level transport to an instrument.
///
/// A transport moves SCPI text out and raw bytes in. It never retries on
/// its own: a failed `send` or `receive` surfaces exactly once, and retry
/// policy belongs to the SCPI engine.
///
/// Binary replies are read incrementally with
/// [`read_begin`](Transport::read_begin), [`read_data`](Transport::read_data)
/// and [`read_complete`](Transport::read_complete).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection.
    ///
    /// Failure here is fatal to the device that owns the transport.
    async fn open(&mut self) -> Result<()>;

    /// Line terminator appended to every outgoing command.
    fn terminator(&self) -> &'static str;

    /// Send one command.
    ///
    /// The terminator is appended and the whole line is handed to the
    /// underlying link in a single write. Returns the number of bytes the
    /// link accepted, which may be less than the line length; short writes
    /// are logged, never retried here.
    async fn send(&mut self, command: &str) -> Result<usize>;

    /// Receive one complete reply as text, terminator stripped.
    ///
    /// The default implementation collects the reply with [`read_reply`]
    /// under [`ReplyPolicy::DEFAULT`]. Returns [`Error::Timeout`] if nothing
    /// arrived at all.
    async fn receive(&mut self) -> Result<String> {
        let response = read_reply(self, ReplyPolicy::DEFAULT).await?;
        Ok(strip_terminator(&response))
    }

    /// Prepare for a new reply.
    ///
    /// Resets any per-reply completion state (length envelopes, RPC reason
    /// flags, END status).
    async fn read_begin(&mut self) -> Result<()>;

    /// Read whatever reply bytes are available into `buf`.
    ///
    /// Waits at most a short, transport-specific window. Returns `Ok(0)`
    /// when nothing arrived in that window; this is not an error.
    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether the transport has seen the end of the current reply.
    fn read_complete(&self) -> bool;

    /// Describe how the host event loop should poll this transport.
    fn poll_source(&self, timeout: Duration) -> PollSource {
        PollSource::input(timeout)
    }

    /// Close the connection.
    ///
    /// After calling `close()`, subsequent I/O should return
    /// [`Error::NotConnected`].
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Human-readable description of the link, for logging.
    fn description(&self) -> String;
}

/// How long a reply is polled for before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyPolicy {
    /// Reads attempted before giving up.
    pub retries: usize,
    /// Pause after a read that returned nothing.
    pub interval: Duration,
}

impl ReplyPolicy {
    pub const DEFAULT: ReplyPolicy = ReplyPolicy {
        retries: RECEIVE_RETRIES,
        interval: RECEIVE_RETRY_INTERVAL,
    };
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Collect one raw reply from `transport`, terminator included.
///
/// Reads until a trailing newline is seen or the transport reports the
/// reply complete, sleeping `policy.interval` after every empty read.
/// Returns [`Error::Timeout`] if nothing arrived within `policy.retries`
/// reads.
pub async fn read_reply<T: Transport + ?Sized>(transport: &mut T, policy: ReplyPolicy) -> Result<Vec<u8>> {
    transport.read_begin().await?;

    let mut response = Vec::new();
    let mut buf = [0u8; 256];

    for _ in 0..policy.retries {
        let n = transport.read_data(&mut buf).await?;
        response.extend_from_slice(&buf[..n]);

        if response.ends_with(b"\n") || (!response.is_empty() && transport.read_complete()) {
            break;
        }
        if n == 0 {
            tokio::time::sleep(policy.interval).await;
        }
    }

    if response.is_empty() {
        return Err(Error::Timeout);
    }
    Ok(response)
}

/// Decode a reply buffer as text and strip one trailing `\n` or `\r\n`.
pub fn strip_terminator(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out one scripted chunk per read and reports completion only
    /// once the chunk flagged as final has been read.
    struct Chunked {
        chunks: VecDeque<(Vec<u8>, bool)>,
        complete: bool,
        reads: usize,
    }

    impl Chunked {
        fn new(chunks: &[(&[u8], bool)]) -> Self {
            Chunked {
                chunks: chunks.iter().map(|(c, last)| (c.to_vec(), *last)).collect(),
                complete: false,
                reads: 0,
            }
        }
    }

    #[async_trait]
    impl Transport for Chunked {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn terminator(&self) -> &'static str {
            "\n"
        }

        async fn send(&mut self, command: &str) -> Result<usize> {
            Ok(command.len() + 1)
        }

        async fn read_begin(&mut self) -> Result<()> {
            self.complete = false;
            Ok(())
        }

        async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.reads += 1;
            let Some((chunk, last)) = self.chunks.pop_front() else {
                return Ok(0);
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
            self.complete = last;
            Ok(chunk.len())
        }

        fn read_complete(&self) -> bool {
            self.complete
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn description(&self) -> String {
            "chunked".into()
        }
    }

    #[tokio::test]
    async fn read_reply_continues_past_unfinished_chunks() {
        let mut transport = Chunked::new(&[(&[b'A'; 256], false), (b"AAAA", true)]);
        let reply = read_reply(&mut transport, ReplyPolicy::DEFAULT).await.unwrap();
        assert_eq!(reply.len(), 260);
        assert_eq!(transport.reads, 2);
    }

    #[tokio::test]
    async fn read_reply_stops_at_newline() {
        let mut transport = Chunked::new(&[(b"1.5\n", false), (b"stale\n", true)]);
        assert_eq!(transport.receive().await.unwrap(), "1.5");
        assert_eq!(transport.chunks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_reply_times_out_after_policy_retries() {
        let mut transport = Chunked::new(&[]);
        let policy = ReplyPolicy {
            retries: 5,
            interval: Duration::from_millis(20),
        };
        let start = tokio::time::Instant::now();
        let err = read_reply(&mut transport, policy).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(transport.reads, 5);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn strip_newline() {
        assert_eq!(strip_terminator(b"1.25\n"), "1.25");
    }

    #[test]
    fn strip_crlf() {
        assert_eq!(strip_terminator(b"RIGOL,DS1102E\r\n"), "RIGOL,DS1102E");
    }

    #[test]
    fn strip_only_one_terminator() {
        assert_eq!(strip_terminator(b"a\n\n"), "a\n");
    }

    #[test]
    fn strip_nothing_to_strip() {
        assert_eq!(strip_terminator(b"IDLE,0"), "IDLE,0");
        assert_eq!(strip_terminator(b""), "");
    }
}
