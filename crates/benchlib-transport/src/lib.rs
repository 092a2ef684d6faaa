//! Transport implementations for benchlib.
//!
//! This crate provides concrete implementations of the
//! [`Transport`](benchlib_core::Transport) trait from `benchlib-core` for the
//! physical links bench instruments are reached over:
//!
//! - [`SerialTransport`]: RS-232 and USB virtual COM ports
//! - [`TcpTransport`]: raw SCPI sockets, optionally with the 4-byte length
//!   envelope some Rigol LAN firmware wraps replies in
//! - [`UsbTmcTransport`]: the Linux `usbtmc` character device
//! - [`Vxi11Transport`]: VXI-11 over ONC-RPC
//! - `GpibTransport`: linux-gpib descriptors (cargo feature `gpib`)
//!
//! [`ConnectionSpec`] parses user-facing connection strings and opens the
//! matching transport.
//!
//! # Example
//!
//! ```no_run
//! use benchlib_transport::ConnectionSpec;
//!
//! # async fn example() -> benchlib_core::Result<()> {
//! let spec: ConnectionSpec = "tcp-raw/192.168.1.20/5555".parse()?;
//! let mut transport = spec.open().await?;
//!
//! transport.send("*IDN?").await?;
//! let idn = transport.receive().await?;
//! println!("{idn}");
//! # Ok(())
//! # }
//! ```

use benchlib_core::error::Error;

pub mod conn;
pub mod gpib;
mod rpc;
pub mod serial;
pub mod tcp;
pub mod usbtmc;
pub mod vxi11;

pub use conn::ConnectionSpec;
pub use gpib::GpibAddress;
#[cfg(feature = "gpib")]
pub use gpib::GpibTransport;
pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
pub use tcp::{TcpFraming, TcpTransport};
pub use usbtmc::UsbTmcTransport;
pub use vxi11::{Vxi11Config, Vxi11Transport};

/// Map a data-path I/O error to the appropriate [`Error`] variant.
pub(crate) fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn dropped_links_map_to_connection_lost() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
            io::ErrorKind::ConnectionAborted,
        ] {
            assert!(matches!(map_io_error(io::Error::from(kind)), Error::ConnectionLost));
        }
    }

    #[test]
    fn other_errors_stay_io() {
        let err = map_io_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, Error::Io(_)));
    }
}
