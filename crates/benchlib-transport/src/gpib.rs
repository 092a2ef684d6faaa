//! GPIB (IEEE-488.1) transport via linux-gpib.
//!
//! Addressing is always available so connection strings parse on every
//! build. The transport itself links against `libgpib` and is only compiled
//! with the `gpib` cargo feature.
//!
//! linux-gpib calls block, so each one runs on the blocking thread pool.
//! The byte count of a read lives in thread-local state (`ThreadIbcntl`) and
//! is fetched on the same blocking thread as the `ibrd` that set it.

use std::fmt;
use std::str::FromStr;

use benchlib_core::error::Error;

/// Where a GPIB instrument lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpibAddress {
    /// Board index and primary address.
    Board { board: i32, pad: i32 },
    /// Device name from `gpib.conf`, resolved with `ibfind`.
    Name(String),
}

impl FromStr for GpibAddress {
    type Err = Error;

    /// Parse `<board>/<pad>` or an interface name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::InvalidArgument("empty GPIB address".into()));
        }
        match s.split_once('/') {
            Some((board, pad)) => {
                let board = board
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("invalid GPIB board index: {board}")))?;
                let pad: i32 = pad
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("invalid GPIB primary address: {pad}")))?;
                if !(0..=30).contains(&pad) {
                    return Err(Error::InvalidArgument(format!(
                        "GPIB primary address {pad} out of range 0-30"
                    )));
                }
                Ok(GpibAddress::Board { board, pad })
            }
            None => Ok(GpibAddress::Name(s.to_string())),
        }
    }
}

impl fmt::Display for GpibAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpibAddress::Board { board, pad } => write!(f, "{board}/{pad}"),
            GpibAddress::Name(name) => f.write_str(name),
        }
    }
}

/// `ibsta` bits.
const ERR: i32 = 0x8000;
const TIMO: i32 = 0x4000;
const END: i32 = 0x2000;

#[cfg_attr(not(feature = "gpib"), allow(dead_code))]
fn status_error(ibsta: i32) -> bool {
    ibsta & ERR != 0
}

#[cfg_attr(not(feature = "gpib"), allow(dead_code))]
fn status_timeout(ibsta: i32) -> bool {
    ibsta & TIMO != 0
}

#[cfg_attr(not(feature = "gpib"), allow(dead_code))]
fn status_end(ibsta: i32) -> bool {
    ibsta & END != 0
}

#[cfg(feature = "gpib")]
pub use imp::GpibTransport;

#[cfg(feature = "gpib")]
mod imp {
    use std::ffi::{CString, c_char, c_int, c_long, c_void};

    use async_trait::async_trait;
    use benchlib_core::error::{Error, Result};
    use benchlib_core::session::PollSource;
    use benchlib_core::transport::Transport;
    use std::time::Duration;

    use super::{GpibAddress, status_end, status_error, status_timeout};

    /// `T1s` in the linux-gpib timeout table.
    const TIMEOUT_1S: c_int = 11;

    #[link(name = "gpib")]
    unsafe extern "C" {
        fn ibdev(board: c_int, pad: c_int, sad: c_int, timo: c_int, send_eoi: c_int, eos: c_int) -> c_int;
        fn ibfind(name: *const c_char) -> c_int;
        fn ibwrt(ud: c_int, data: *const c_void, count: c_long) -> c_int;
        fn ibrd(ud: c_int, buf: *mut c_void, count: c_long) -> c_int;
        fn ibonl(ud: c_int, online: c_int) -> c_int;
        fn ThreadIbcntl() -> c_long;
    }

    async fn blocking<T, F>(f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| Error::Transport(format!("GPIB worker failed: {e}")))
    }

    /// linux-gpib transport.
    #[derive(Debug)]
    pub struct GpibTransport {
        address: GpibAddress,
        ud: Option<c_int>,
        complete: bool,
    }

    impl GpibTransport {
        pub fn new(address: GpibAddress) -> Self {
            GpibTransport {
                address,
                ud: None,
                complete: false,
            }
        }

        pub fn address(&self) -> &GpibAddress {
            &self.address
        }
    }

    #[async_trait]
    impl Transport for GpibTransport {
        async fn open(&mut self) -> Result<()> {
            tracing::debug!(address = %self.address, "Opening GPIB device");

            let address = self.address.clone();
            let ud = blocking(move || match address {
                GpibAddress::Board { board, pad } => {
                    // SAFETY: plain integer arguments.
                    Ok(unsafe { ibdev(board, pad, 0, TIMEOUT_1S, 1, 0) })
                }
                GpibAddress::Name(name) => {
                    let name = CString::new(name)
                        .map_err(|_| Error::InvalidArgument("GPIB name contains NUL".into()))?;
                    // SAFETY: `name` is a valid NUL-terminated string for the call.
                    Ok(unsafe { ibfind(name.as_ptr()) })
                }
            })
            .await??;

            if ud < 0 {
                tracing::error!(address = %self.address, "ibdev failed");
                return Err(Error::Transport(format!("failed to open GPIB device {}", self.address)));
            }

            tracing::info!(address = %self.address, ud, "GPIB device opened");
            self.ud = Some(ud);
            self.complete = false;
            Ok(())
        }

        fn terminator(&self) -> &'static str {
            "\n"
        }

        async fn send(&mut self, command: &str) -> Result<usize> {
            let ud = self.ud.ok_or(Error::NotConnected)?;
            let line = format!("{command}\n").into_bytes();
            let expected = line.len();

            tracing::trace!(address = %self.address, command = %command, "Sending command");

            let (ibsta, count) = blocking(move || {
                // SAFETY: `line` outlives the call and its length is passed alongside.
                let ibsta = unsafe { ibwrt(ud, line.as_ptr().cast(), line.len() as c_long) };
                // SAFETY: reads thread-local state set by the ibwrt above.
                (ibsta, unsafe { ThreadIbcntl() })
            })
            .await?;

            if status_error(ibsta) {
                tracing::error!(address = %self.address, ibsta, "ibwrt failed");
                return Err(Error::Transport(format!("ibwrt failed (ibsta {ibsta:#06x})")));
            }
            let written = count.max(0) as usize;
            if written < expected {
                tracing::debug!(address = %self.address, written, expected, "Short GPIB write");
            }
            Ok(written)
        }

        async fn read_begin(&mut self) -> Result<()> {
            self.complete = false;
            Ok(())
        }

        async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
            let ud = self.ud.ok_or(Error::NotConnected)?;
            let len = buf.len();

            let (ibsta, data) = blocking(move || {
                let mut data = vec![0u8; len];
                // SAFETY: `data` is a live buffer of exactly `len` bytes.
                let ibsta = unsafe { ibrd(ud, data.as_mut_ptr().cast(), len as c_long) };
                // SAFETY: reads thread-local state set by the ibrd above.
                let count = unsafe { ThreadIbcntl() }.clamp(0, len as c_long) as usize;
                data.truncate(count);
                (ibsta, data)
            })
            .await?;

            if status_error(ibsta) {
                if status_timeout(ibsta) {
                    return Ok(0);
                }
                tracing::error!(address = %self.address, ibsta, "ibrd failed");
                return Err(Error::Transport(format!("ibrd failed (ibsta {ibsta:#06x})")));
            }

            buf[..data.len()].copy_from_slice(&data);
            self.complete = status_end(ibsta);
            tracing::trace!(address = %self.address, bytes = data.len(), end = self.complete, "Received data");
            Ok(data.len())
        }

        fn read_complete(&self) -> bool {
            self.complete
        }

        /// Descriptors are not pollable, so the device is driven by a timer.
        fn poll_source(&self, timeout: Duration) -> PollSource {
            PollSource::timer(timeout)
        }

        async fn close(&mut self) -> Result<()> {
            if let Some(ud) = self.ud.take() {
                // SAFETY: `ud` came from a successful ibdev/ibfind.
                let ibsta = blocking(move || unsafe { ibonl(ud, 0) }).await?;
                if status_error(ibsta) {
                    tracing::warn!(address = %self.address, ibsta, "ibonl reported an error");
                }
                tracing::info!(address = %self.address, "GPIB device closed");
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.ud.is_some()
        }

        fn description(&self) -> String {
            format!("gpib/{}", self.address)
        }
    }
}
