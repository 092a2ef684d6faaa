//! RigolBuilder -- fluent builder for constructing [`RigolScope`] instances.
//!
//! Acquisition options are collected up front. Building opens the link,
//! identifies the instrument and reads its configuration, so a built scope
//! is ready to acquire.
//!
//! # Example
//!
//! ```no_run
//! use benchlib_rigol::{DataSource, RigolBuilder};
//!
//! # async fn example() -> benchlib_core::Result<()> {
//! let mut scope = RigolBuilder::new()
//!     .connection("tcp-raw/192.168.1.20/5555".parse()?)
//!     .analog_channel(1, true)
//!     .data_source(DataSource::Memory)
//!     .build()
//!     .await?;
//!
//! let mut packets = Vec::new();
//! scope.acquire(&mut packets).await?;
//! scope.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use benchlib_core::error::{Error, Result};
use benchlib_core::transport::Transport;
use benchlib_scpi::ScpiSession;
use benchlib_transport::ConnectionSpec;

use crate::acquisition::DataSource;
use crate::models::NUM_DIGITAL_CHANNELS;
use crate::scope::{AcquisitionSettings, RigolScope};

/// Fluent builder for [`RigolScope`].
///
/// Channel enables that are not set keep whatever the instrument currently
/// shows.
#[derive(Debug, Clone, Default)]
pub struct RigolBuilder {
    connection: Option<ConnectionSpec>,
    settings: AcquisitionSettings,
    error: Option<String>,
}

impl RigolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the link to open in [`build()`](Self::build).
    pub fn connection(mut self, spec: ConnectionSpec) -> Self {
        self.connection = Some(spec);
        self
    }

    /// Stop after this many frames (default: 1). Zero captures until the
    /// acquisition is cancelled.
    pub fn frame_limit(mut self, frames: u64) -> Self {
        self.settings.frame_limit = frames;
        self
    }

    /// Read the screen buffer (default) or the deep memory.
    pub fn data_source(mut self, source: DataSource) -> Self {
        self.settings.data_source = source;
        self
    }

    /// Interval between acquisition callbacks (default: 50ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    /// Enable or disable analog channel `channel` (1-based).
    pub fn analog_channel(mut self, channel: usize, enabled: bool) -> Self {
        if channel == 0 {
            self.error.get_or_insert_with(|| "analog channels are numbered from 1".into());
            return self;
        }
        let analog = &mut self.settings.analog;
        if analog.len() < channel {
            analog.resize(channel, None);
        }
        analog[channel - 1] = Some(enabled);
        self
    }

    /// Enable or disable logic analyzer channel `channel` (D0-D15).
    pub fn digital_channel(mut self, channel: usize, enabled: bool) -> Self {
        match self.settings.digital.get_mut(channel) {
            Some(slot) => *slot = Some(enabled),
            None => {
                self.error.get_or_insert_with(|| {
                    format!("digital channel {channel} out of range 0..{NUM_DIGITAL_CHANNELS}")
                });
            }
        }
        self
    }

    /// Build a [`RigolScope`] over a caller-provided transport.
    ///
    /// This is the primary entry point for testing (pass a `MockInstrument`
    /// from `benchlib-test-harness`).
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<RigolScope> {
        if let Some(message) = self.error {
            return Err(Error::InvalidArgument(message));
        }
        if self.settings.poll_interval.is_zero() {
            return Err(Error::InvalidArgument("poll interval must not be zero".into()));
        }
        RigolScope::open(ScpiSession::new(transport), self.settings).await
    }

    /// Build a [`RigolScope`] over the configured connection.
    ///
    /// Requires that [`connection()`](Self::connection) has been called.
    pub async fn build(mut self) -> Result<RigolScope> {
        let spec = self
            .connection
            .take()
            .ok_or_else(|| Error::InvalidArgument("connection is required for build()".into()))?;
        tracing::debug!(connection = %spec, "Connecting");
        let transport = spec.into_transport()?;
        self.build_with_transport(transport).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchlib_test_harness::MockInstrument;

    fn ds1104z() -> MockInstrument {
        let scope = MockInstrument::new();
        scope.reply("*IDN?", "RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04.SP4");
        for n in 1..=4 {
            scope.reply(&format!(":CHAN{n}:DISP?"), if n == 1 { "1" } else { "0" });
            scope.reply(&format!(":CHAN{n}:PROB?"), "10");
            scope.reply(&format!(":CHAN{n}:SCAL?"), "1.000000e+00");
            scope.reply(&format!(":CHAN{n}:OFFS?"), "0.000000e+00");
            scope.reply(&format!(":CHAN{n}:COUP?"), "DC");
        }
        scope.reply(":WAV:YREF?", "127");
        scope.reply(":TIM:SCAL?", "1.000000e-03");
        scope.reply(":TRIG:EDGE:SOUR?", "CHAN1");
        scope.reply(":TIM:OFFS?", "0.000000e+00");
        scope.reply(":TRIG:EDGE:SLOP?", "POS");
        scope.reply(":TRIG:EDGE:LEV?", "1.000000e+00");
        scope
    }

    // ---------------------------------------------------------------
    // defaults and validation
    // ---------------------------------------------------------------

    #[test]
    fn builder_defaults() {
        let builder = RigolBuilder::new();
        assert!(builder.connection.is_none());
        assert_eq!(builder.settings.frame_limit, 1);
        assert_eq!(builder.settings.data_source, DataSource::Live);
        assert_eq!(builder.settings.poll_interval, Duration::from_millis(50));
        assert!(builder.settings.analog.is_empty());
        assert!(builder.settings.digital.iter().all(Option::is_none));
    }

    #[test]
    fn channel_enables_are_recorded() {
        let builder = RigolBuilder::new()
            .analog_channel(2, true)
            .analog_channel(4, false)
            .digital_channel(15, true);
        assert_eq!(builder.settings.analog, vec![None, Some(true), None, Some(false)]);
        assert_eq!(builder.settings.digital[15], Some(true));
    }

    #[tokio::test]
    async fn channel_zero_is_rejected() {
        let err = RigolBuilder::new()
            .analog_channel(0, true)
            .build_with_transport(Box::new(MockInstrument::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn digital_channel_out_of_range_is_rejected() {
        let err = RigolBuilder::new()
            .digital_channel(16, true)
            .build_with_transport(Box::new(MockInstrument::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn build_without_connection_fails() {
        let err = RigolBuilder::new().build().await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    // ---------------------------------------------------------------
    // build
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn build_probes_and_reads_config() {
        let scope = RigolBuilder::new()
            .frame_limit(5)
            .build_with_transport(Box::new(ds1104z()))
            .await
            .unwrap();

        assert_eq!(scope.model().name, "DS1104Z");
        assert_eq!(scope.hw_info().serial_number, "DS1ZA0001");
        assert_eq!(scope.frame_limit(), 5);
        let ctx = scope.context();
        assert!(ctx.analog[0].enabled);
        assert!(!ctx.analog[3].enabled);
        assert_eq!(ctx.analog[0].vertical_reference, 127);
        assert_eq!(ctx.timebase, 0.001);
    }

    #[tokio::test]
    async fn too_many_analog_channels_is_rejected() {
        let err = RigolBuilder::new()
            .analog_channel(5, true)
            .build_with_transport(Box::new(ds1104z()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn digital_channels_need_logic_analyzer() {
        let err = RigolBuilder::new()
            .digital_channel(0, true)
            .build_with_transport(Box::new(ds1104z()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn close_disconnects() {
        let mock = ds1104z();
        let scope = RigolBuilder::new()
            .build_with_transport(Box::new(mock.clone()))
            .await
            .unwrap();
        scope.close().await.unwrap();
        assert!(!benchlib_core::Transport::is_connected(&mock));
    }
}
