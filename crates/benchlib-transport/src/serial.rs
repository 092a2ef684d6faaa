//! Serial port transport for instrument communication.
//!
//! This module provides [`SerialTransport`], which implements the
//! [`Transport`] trait for RS-232 instruments and USB virtual COM ports.
//! Commands are terminated with `\n`; a reply is complete once a read
//! ends on `\n`.
//!
//! Line settings are usually given as a compact comm string, parsed by
//! [`SerialConfig::from_str`](std::str::FromStr):
//!
//! ```text
//! <baud>/<data bits><parity><stop bits>[/rts=0|1][/dtr=0|1][/flow=0|1|2]
//! ```
//!
//! e.g. `115200/8n1` or `9600/7e2/dtr=1/flow=1`.
//!
//! # Example
//!
//! ```no_run
//! use benchlib_transport::{SerialConfig, SerialTransport};
//! use benchlib_core::transport::Transport;
//!
//! # async fn example() -> benchlib_core::Result<()> {
//! let config: SerialConfig = "115200/8n1".parse()?;
//! let mut transport = SerialTransport::open_with_config("/dev/ttyUSB0", config).await?;
//!
//! transport.send("*IDN?").await?;
//! let idn = transport.receive().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use benchlib_core::error::{Error, Result};
use benchlib_core::transport::Transport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::map_io_error;

/// How long a single `read_data` call waits for bytes.
const READ_WINDOW: Duration = Duration::from_millis(10);

/// Serial port configuration.
///
/// Defaults are appropriate for most bench instruments:
/// - 9600 baud
/// - 8 data bits
/// - 1 stop bit
/// - No parity
/// - No flow control
/// - DTR and RTS left as the OS opened them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Baud rate (e.g., 9600, 19200, 115200)
    pub baud_rate: u32,
    /// Number of data bits (typically 8)
    pub data_bits: DataBits,
    /// Number of stop bits (typically 1)
    pub stop_bits: StopBits,
    /// Parity checking (typically None)
    pub parity: Parity,
    /// Flow control (typically None)
    pub flow_control: FlowControl,
    /// Drive RTS to this level after opening, if set.
    pub rts: Option<bool>,
    /// Drive DTR to this level after opening, if set.
    pub dtr: Option<bool>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            rts: None,
            dtr: None,
        }
    }
}

impl FromStr for SerialConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidArgument(format!("serial comm '{s}': {why}"));

        let mut parts = s.split('/');
        let baud_rate: u32 = parts
            .next()
            .and_then(|b| b.parse().ok())
            .filter(|b| *b > 0)
            .ok_or_else(|| invalid("bad baud rate"))?;

        let frame = parts.next().ok_or_else(|| invalid("missing frame format"))?;
        let frame: Vec<char> = frame.chars().collect();
        let &[bits, parity, stop] = frame.as_slice() else {
            return Err(invalid("frame format must look like 8n1"));
        };

        let data_bits = match bits {
            '5' => DataBits::Five,
            '6' => DataBits::Six,
            '7' => DataBits::Seven,
            '8' => DataBits::Eight,
            _ => return Err(invalid("data bits must be 5-8")),
        };
        let parity = match parity.to_ascii_lowercase() {
            'n' => Parity::None,
            'e' => Parity::Even,
            'o' => Parity::Odd,
            _ => return Err(invalid("parity must be n, e or o")),
        };
        let stop_bits = match stop {
            '1' => StopBits::One,
            '2' => StopBits::Two,
            _ => return Err(invalid("stop bits must be 1 or 2")),
        };

        let mut config = SerialConfig {
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            ..Default::default()
        };

        for option in parts {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| invalid("options must be key=value"))?;
            match (key, value) {
                ("rts", "0") => config.rts = Some(false),
                ("rts", "1") => config.rts = Some(true),
                ("dtr", "0") => config.dtr = Some(false),
                ("dtr", "1") => config.dtr = Some(true),
                ("flow", "0") => config.flow_control = FlowControl::None,
                ("flow", "1") => config.flow_control = FlowControl::Hardware,
                ("flow", "2") => config.flow_control = FlowControl::Software,
                _ => return Err(invalid(&format!("unknown option {option}"))),
            }
        }

        Ok(config)
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Serial port transport for instrument communication.
pub struct SerialTransport {
    /// The underlying serial port stream, `None` until opened.
    port: Option<SerialStream>,
    /// Port name for logging/debugging
    port_name: String,
    config: SerialConfig,
    /// Set when the last read ended on a newline.
    got_newline: bool,
}

impl SerialTransport {
    /// Create an unopened transport. Call [`Transport::open`] to connect.
    pub fn new(port: &str, config: SerialConfig) -> Self {
        SerialTransport {
            port: None,
            port_name: port.to_string(),
            config,
            got_newline: false,
        }
    }

    /// Create and open a serial transport in one step.
    pub async fn open_with_config(port: &str, config: SerialConfig) -> Result<Self> {
        let mut transport = Self::new(port, config);
        transport.open().await?;
        Ok(transport)
    }

    /// Get the name of the serial port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        let config = &self.config;
        tracing::debug!(
            port = %self.port_name,
            baud_rate = config.baud_rate,
            data_bits = ?config.data_bits,
            stop_bits = ?config.stop_bits,
            parity = ?config.parity,
            flow_control = ?config.flow_control,
            "Opening serial port"
        );

        let mut serial_stream = tokio_serial::new(&self.port_name, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %self.port_name, error = %e, "Failed to open serial port");
                Error::Transport(format!("failed to open serial port {}: {}", self.port_name, e))
            })?;

        if let Some(dtr) = config.dtr {
            if let Err(e) = serial_stream.write_data_terminal_ready(dtr) {
                tracing::warn!(port = %self.port_name, error = %e, "Failed to set DTR");
            }
        }
        if let Some(rts) = config.rts {
            if let Err(e) = serial_stream.write_request_to_send(rts) {
                tracing::warn!(port = %self.port_name, error = %e, "Failed to set RTS");
            }
        }

        tracing::info!(port = %self.port_name, baud_rate = config.baud_rate, "Serial port opened");

        self.port = Some(serial_stream);
        self.got_newline = false;
        Ok(())
    }

    fn terminator(&self) -> &'static str {
        "\n"
    }

    async fn send(&mut self, command: &str) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        let line = format!("{command}\n");

        tracing::trace!(port = %self.port_name, command = %command, "Sending command");

        let written = port.write(line.as_bytes()).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to send command");
            map_io_error(e)
        })?;

        port.flush().await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to flush serial port");
            map_io_error(e)
        })?;

        if written < line.len() {
            tracing::debug!(
                port = %self.port_name,
                written,
                expected = line.len(),
                "Short serial write"
            );
        }

        Ok(written)
    }

    async fn read_begin(&mut self) -> Result<()> {
        self.got_newline = false;
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(READ_WINDOW, port.read(buf)).await {
            Ok(Ok(n)) => {
                if n > 0 {
                    self.got_newline = buf[n - 1] == b'\n';
                    tracing::trace!(port = %self.port_name, bytes = n, data = ?&buf[..n], "Received data");
                }
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => Ok(0),
        }
    }

    fn read_complete(&self) -> bool {
        self.got_newline
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            tracing::debug!(port = %self.port_name, "Closing serial port");

            if let Err(e) = port.flush().await {
                tracing::warn!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to flush before closing (continuing anyway)"
                );
            }

            tracing::info!(port = %self.port_name, "Serial port closed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn description(&self) -> String {
        format!("serial/{}", self.port_name)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            tracing::debug!(port = %self.port_name, "SerialTransport dropped, closing port");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.flow_control, FlowControl::None);
        assert_eq!(config.rts, None);
        assert_eq!(config.dtr, None);
    }

    #[test]
    fn parse_basic_comm_string() {
        let config: SerialConfig = "115200/8n1".parse().unwrap();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
    }

    #[test]
    fn parse_comm_string_with_options() {
        let config: SerialConfig = "9600/7e2/rts=0/dtr=1/flow=2".parse().unwrap();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, StopBits::Two);
        assert_eq!(config.rts, Some(false));
        assert_eq!(config.dtr, Some(true));
        assert_eq!(config.flow_control, FlowControl::Software);
    }

    #[test]
    fn parse_comm_string_hardware_flow() {
        let config: SerialConfig = "19200/8o1/flow=1".parse().unwrap();
        assert_eq!(config.parity, Parity::Odd);
        assert_eq!(config.flow_control, FlowControl::Hardware);
    }

    #[test]
    fn parse_comm_string_rejects_garbage() {
        for bad in [
            "",
            "fast/8n1",
            "0/8n1",
            "9600",
            "9600/9n1",
            "9600/8x1",
            "9600/8n3",
            "9600/8n1x",
            "9600/8n1/rts",
            "9600/8n1/rts=2",
            "9600/8n1/speed=1",
        ] {
            let result: Result<SerialConfig> = bad.parse();
            assert!(
                matches!(result, Err(Error::InvalidArgument(_))),
                "expected InvalidArgument for {bad:?}"
            );
        }
    }

    #[test]
    fn unopened_transport_state() {
        let transport = SerialTransport::new("/dev/ttyUSB0", SerialConfig::default());
        assert!(!transport.is_connected());
        assert_eq!(transport.port_name(), "/dev/ttyUSB0");
        assert_eq!(transport.terminator(), "\n");
        assert_eq!(transport.description(), "serial//dev/ttyUSB0");
    }

    #[tokio::test]
    async fn send_before_open_returns_not_connected() {
        let mut transport = SerialTransport::new("/dev/ttyUSB0", SerialConfig::default());
        assert!(matches!(transport.send("*IDN?").await, Err(Error::NotConnected)));
        let mut buf = [0u8; 8];
        assert!(matches!(transport.read_data(&mut buf).await, Err(Error::NotConnected)));
    }

    #[test]
    fn test_conversions() {
        let _: tokio_serial::DataBits = DataBits::Five.into();
        let _: tokio_serial::StopBits = StopBits::Two.into();
        let _: tokio_serial::Parity = Parity::Odd.into();
        let _: tokio_serial::FlowControl = FlowControl::Hardware.into();
    }
}
