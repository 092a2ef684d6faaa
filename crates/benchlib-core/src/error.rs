//! Error types for benchlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, SCPI-layer, and
//! acquisition-layer errors are all captured here.
//!
//! Errors fall into three broad classes, reported by [`Error::kind`]:
//! invalid arguments supplied by the caller, hard timeouts, and everything
//! else (I/O failures, malformed replies, lost connections).

/// The error type for all benchlib operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port, TCP socket, USB-TMC node,
    /// VXI-11 RPC link, GPIB descriptor).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed SCPI reply, bad block header,
    /// unexpected RPC message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A hard deadline expired while waiting on the instrument.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid argument was passed by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested operation is not supported by this instrument or
    /// transport.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A command was only partially written to the transport.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// A single-shot acquisition stopped without triggering, and re-arming
    /// did not recover it.
    #[error("single shot acquisition failed after {0} re-arm attempts")]
    SingleShotFailed(u32),

    /// No connection to the instrument has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the instrument was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// The consumer of an emitted packet stream has gone away.
    #[error("stream closed")]
    StreamClosed,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller supplied something unusable.
    Arg,
    /// A hard deadline expired.
    Timeout,
    /// Any other failure.
    Err,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::Arg,
            Error::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::Err,
        }
    }

    /// Shorthand for `self.kind() == ErrorKind::Timeout`.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("bad block header".into());
        assert_eq!(e.to_string(), "protocol error: bad block header");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for response");
    }

    #[test]
    fn error_display_invalid_argument() {
        let e = Error::InvalidArgument("baud rate 0".into());
        assert_eq!(e.to_string(), "invalid argument: baud rate 0");
    }

    #[test]
    fn error_display_short_write() {
        let e = Error::ShortWrite {
            written: 3,
            expected: 7,
        };
        assert_eq!(e.to_string(), "short write: 3 of 7 bytes");
    }

    #[test]
    fn error_display_single_shot() {
        let e = Error::SingleShotFailed(3);
        assert_eq!(
            e.to_string(),
            "single shot acquisition failed after 3 re-arm attempts"
        );
    }

    #[test]
    fn error_display_connection_lost() {
        assert_eq!(Error::ConnectionLost.to_string(), "connection lost");
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn error_display_stream_closed() {
        assert_eq!(Error::StreamClosed.to_string(), "stream closed");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::InvalidArgument("x".into()).kind(), ErrorKind::Arg);
        assert_eq!(Error::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(Error::Protocol("x".into()).kind(), ErrorKind::Err);
        assert_eq!(Error::SingleShotFailed(1).kind(), ErrorKind::Err);
        assert!(Error::Timeout.is_timeout());
        assert!(!Error::ConnectionLost.is_timeout());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
