//! USB-TMC transport over the Linux `usbtmc` kernel driver.
//!
//! The kernel exposes each USB Test & Measurement Class instrument as a
//! character device (`/dev/usbtmc0`, `/dev/usbtmc1`, ...). The driver
//! handles the USB-TMC bulk framing itself, so this transport is plain
//! `read`/`write` on the device node with no envelope. Commands are
//! terminated with `\n`.
//!
//! A reply is complete once a read ends on `\n` or returns fewer bytes
//! than were asked for (the driver hands out one transfer per read).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use benchlib_core::error::{Error, Result};
use benchlib_core::transport::Transport;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::map_io_error;

/// How long a single `read_data` call waits for bytes.
const READ_WINDOW: Duration = Duration::from_millis(10);

/// USB-TMC character device transport.
#[derive(Debug)]
pub struct UsbTmcTransport {
    device: Option<File>,
    path: PathBuf,
    complete: bool,
}

impl UsbTmcTransport {
    /// Create an unopened transport for a device node.
    pub fn new(path: impl AsRef<Path>) -> Self {
        UsbTmcTransport {
            device: None,
            path: path.as_ref().to_path_buf(),
            complete: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for UsbTmcTransport {
    async fn open(&mut self) -> Result<()> {
        tracing::debug!(path = %self.path.display(), "Opening USB-TMC device");

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to open USB-TMC device");
                Error::Transport(format!(
                    "failed to open USB-TMC device {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        tracing::info!(path = %self.path.display(), "USB-TMC device opened");
        self.device = Some(device);
        self.complete = false;
        Ok(())
    }

    fn terminator(&self) -> &'static str {
        "\n"
    }

    async fn send(&mut self, command: &str) -> Result<usize> {
        let device = self.device.as_mut().ok_or(Error::NotConnected)?;
        let line = format!("{command}\n");

        tracing::trace!(path = %self.path.display(), command = %command, "Sending command");

        let written = device.write(line.as_bytes()).await.map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to send command");
            map_io_error(e)
        })?;
        device.flush().await.map_err(map_io_error)?;

        if written < line.len() {
            tracing::debug!(
                path = %self.path.display(),
                written,
                expected = line.len(),
                "Short USB-TMC write"
            );
        }

        Ok(written)
    }

    async fn read_begin(&mut self) -> Result<()> {
        self.complete = false;
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let device = self.device.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(READ_WINDOW, device.read(buf)).await {
            Ok(Ok(n)) => {
                if n > 0 {
                    self.complete = buf[n - 1] == b'\n' || n < buf.len();
                    tracing::trace!(path = %self.path.display(), bytes = n, "Received data");
                }
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => Ok(0),
        }
    }

    fn read_complete(&self) -> bool {
        self.complete
    }

    async fn close(&mut self) -> Result<()> {
        if self.device.take().is_some() {
            tracing::info!(path = %self.path.display(), "USB-TMC device closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    fn description(&self) -> String {
        format!("usbtmc/{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A regular file stands in for the device node.
    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("benchlib-usbtmc-{}-{}", std::process::id(), name))
    }

    #[tokio::test]
    async fn send_appends_newline() {
        let path = scratch_path("send");
        std::fs::write(&path, b"").unwrap();

        let mut transport = UsbTmcTransport::new(&path);
        transport.open().await.unwrap();
        assert_eq!(transport.send(":RUN").await.unwrap(), 5);
        transport.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b":RUN\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn read_completes_on_newline() {
        let path = scratch_path("read");
        std::fs::write(&path, b"IDLE,1400\n").unwrap();

        let mut transport = UsbTmcTransport::new(&path);
        transport.open().await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), "IDLE,1400");
        assert!(transport.read_complete());

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn open_missing_device_fails() {
        let mut transport = UsbTmcTransport::new("/nonexistent/usbtmc9");
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn io_after_close_returns_not_connected() {
        let mut transport = UsbTmcTransport::new("/dev/usbtmc0");
        assert!(matches!(transport.send("*CLS").await, Err(Error::NotConnected)));
        let mut buf = [0u8; 4];
        assert!(matches!(transport.read_data(&mut buf).await, Err(Error::NotConnected)));
        assert_eq!(transport.description(), "usbtmc//dev/usbtmc0");
    }
}
