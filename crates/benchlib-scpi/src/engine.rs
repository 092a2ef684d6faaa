//! The SCPI request/response engine.
//!
//! [`ScpiSession`] owns one [`Transport`] and layers SCPI conventions on
//! top of it: one command per write, replies collected with a bounded
//! retry loop, strict typed parsing, `*OPC?` completion polling and
//! `*IDN?` identification.
//!
//! Retry policy lives here and only here. A transport reports each failure
//! once; the engine decides whether to poll again.

use std::fmt;
use std::time::Duration;

use benchlib_core::error::{Error, Result};
use benchlib_core::session::PollSource;
use benchlib_core::transport::{ReplyPolicy, Transport, read_reply, strip_terminator};

use crate::block::{BlockHeaderReader, HeaderStatus, MAX_HEADER_LEN};
use crate::parse::{self, PartialParse};

/// Reply polling used by every engine read.
pub const READ_POLICY: ReplyPolicy = ReplyPolicy::DEFAULT;

/// How many times a reply is polled before giving up.
pub const READ_RETRIES: usize = READ_POLICY.retries;

/// Pause between empty polls.
pub const READ_RETRY_INTERVAL: Duration = READ_POLICY.interval;

pub const CMD_IDN: &str = "*IDN?";
pub const CMD_OPC: &str = "*OPC?";

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
}

impl fmt::Display for HwInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (serial {}, firmware {})",
            self.manufacturer, self.model, self.serial_number, self.firmware_version
        )
    }
}

/// A SCPI conversation with one instrument.
pub struct ScpiSession {
    transport: Box<dyn Transport>,
}

impl fmt::Debug for ScpiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScpiSession")
            .field("transport", &self.transport.description())
            .finish()
    }
}

impl ScpiSession {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        ScpiSession { transport }
    }

    pub async fn open(&mut self) -> Result<()> {
        self.transport.open().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn description(&self) -> String {
        self.transport.description()
    }

    /// Registration parameters for the host event loop.
    pub fn poll_source(&self, timeout: Duration) -> PollSource {
        self.transport.poll_source(timeout)
    }

    /// Send one command. A short write is an error.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        let expected = command.len() + self.transport.terminator().len();
        let written = self.transport.send(command).await?;
        if written < expected {
            tracing::error!(
                transport = %self.transport.description(),
                command = %command,
                written,
                expected,
                "Short write"
            );
            return Err(Error::ShortWrite { written, expected });
        }
        tracing::debug!(command = %command, "Sent SCPI command");
        Ok(())
    }

    pub async fn read_begin(&mut self) -> Result<()> {
        self.transport.read_begin().await
    }

    /// Read whatever reply bytes are available right now.
    pub async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.transport.read_data(buf).await
    }

    pub fn read_complete(&self) -> bool {
        self.transport.read_complete()
    }

    /// Send `command` if given, then collect one reply line.
    ///
    /// Polls under [`READ_POLICY`] until a newline or the transport's
    /// completion flag. Fails with [`Error::Timeout`] only if nothing at
    /// all arrived.
    pub async fn get_string(&mut self, command: Option<&str>) -> Result<String> {
        if let Some(command) = command {
            self.send(command).await?;
        }
        let response = match read_reply(self.transport.as_mut(), READ_POLICY).await {
            Ok(response) => response,
            Err(Error::Timeout) => {
                tracing::debug!(command = ?command, "No reply");
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e),
        };

        let reply = strip_terminator(&response);
        tracing::trace!(command = ?command, reply = %reply, "Got SCPI reply");
        Ok(reply)
    }

    pub async fn get_bool(&mut self, command: Option<&str>) -> Result<bool> {
        parse::parse_bool(&self.get_string(command).await?)
    }

    pub async fn get_int(&mut self, command: Option<&str>) -> Result<i32> {
        parse::parse_int(&self.get_string(command).await?)
    }

    pub async fn get_float(&mut self, command: Option<&str>) -> Result<f32> {
        parse::parse_float(&self.get_string(command).await?)
    }

    pub async fn get_double(&mut self, command: Option<&str>) -> Result<f64> {
        parse::parse_double(&self.get_string(command).await?)
    }

    /// Fetch a comma-separated list of floats.
    ///
    /// On a bad token the error carries the values that did parse.
    pub async fn get_floatv(&mut self, command: Option<&str>) -> std::result::Result<Vec<f32>, PartialParse<f32>> {
        self.get_list(command, parse::parse_float).await
    }

    /// Fetch a comma-separated list of 8-bit integers.
    pub async fn get_uint8v(&mut self, command: Option<&str>) -> std::result::Result<Vec<u8>, PartialParse<u8>> {
        self.get_list(command, parse::parse_u8).await
    }

    async fn get_list<T>(
        &mut self,
        command: Option<&str>,
        parse_one: fn(&str) -> Result<T>,
    ) -> std::result::Result<Vec<T>, PartialParse<T>> {
        let reply = self.get_string(command).await.map_err(|error| PartialParse {
            values: Vec::new(),
            error,
        })?;
        parse::parse_list(&reply, parse_one)
    }

    /// Poll `*OPC?` until the instrument reports completion.
    ///
    /// Failed or negative polls are retried; only running out of attempts
    /// is an error.
    pub async fn get_opc(&mut self) -> Result<()> {
        for attempt in 0..READ_RETRIES {
            match self.get_bool(Some(CMD_OPC)).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    tracing::trace!(attempt, error = %e, "*OPC? poll failed");
                }
            }
            tokio::time::sleep(READ_RETRY_INTERVAL).await;
        }
        tracing::warn!("Instrument never reported operation complete");
        Err(Error::Timeout)
    }

    /// Identify the instrument with `*IDN?`.
    pub async fn get_hw_id(&mut self) -> Result<HwInfo> {
        let reply = self.get_string(Some(CMD_IDN)).await?;
        tracing::info!(idn = %reply, "Got IDN string");
        parse_idn(&reply)
    }

    /// Continue reading a block header.
    ///
    /// Reads only as many bytes as the header can still need, so payload
    /// bytes are never consumed. Returns [`HeaderStatus::Pending`] when the
    /// link has not delivered the whole header yet.
    pub async fn read_block_header(&mut self, reader: &mut BlockHeaderReader) -> Result<HeaderStatus> {
        let mut buf = [0u8; MAX_HEADER_LEN];
        loop {
            let want = reader.remaining();
            let n = self.transport.read_data(&mut buf[..want]).await?;
            let status = reader.feed(&buf[..n])?;
            if let HeaderStatus::Complete(header) = status {
                tracing::debug!(length = header.byte_length, "Received data block header");
                return Ok(status);
            }
            if n < want {
                return Ok(HeaderStatus::Pending);
            }
        }
    }
}

/// Split an `*IDN?` reply into its four fields.
pub fn parse_idn(reply: &str) -> Result<HwInfo> {
    let fields: Vec<&str> = reply.split(',').collect();
    let &[manufacturer, model, serial_number, firmware_version] = fields.as_slice() else {
        tracing::debug!(idn = %reply, fields = fields.len(), "IDN reply does not have 4 fields");
        return Err(Error::Protocol(format!(
            "IDN reply has {} fields, expected 4",
            fields.len()
        )));
    };
    Ok(HwInfo {
        manufacturer: manufacturer.to_string(),
        model: model.to_string(),
        serial_number: serial_number.to_string(),
        firmware_version: firmware_version.to_string(),
    })
}
