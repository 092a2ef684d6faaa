//! RigolScope -- an open, identified Rigol DS oscilloscope.
//!
//! A scope is created by [`RigolBuilder`](crate::builder::RigolBuilder),
//! which opens the link, identifies the instrument with `*IDN?` and reads
//! its current configuration. Acquisitions then run in a host
//! [`EventLoop`], either one the caller owns ([`RigolScope::acquisition_start`])
//! or a private one ([`RigolScope::acquire`]).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use benchlib_core::error::{Error, Result};
use benchlib_core::session::{EventLoop, PacketSink, SourceId};
use benchlib_scpi::{HwInfo, ScpiSession};

use crate::acquisition::{Acquisition, DataSource};
use crate::device::{DeviceContext, read_config};
use crate::models::{DataFormat, NUM_DIGITAL_CHANNELS, Protocol, RigolModel, data_format, find_model};

/// Pause that replaces `*OPC?` on DS1000 (V2) firmware, which does not
/// implement it.
const V2_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Acquisition parameters collected by the builder.
#[derive(Debug, Clone)]
pub(crate) struct AcquisitionSettings {
    /// Frames to capture before stopping; zero means until stopped.
    pub frame_limit: u64,
    pub data_source: DataSource,
    pub poll_interval: Duration,
    /// Requested analog enables; `None` leaves the instrument setting.
    pub analog: Vec<Option<bool>>,
    pub digital: [Option<bool>; NUM_DIGITAL_CHANNELS],
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        AcquisitionSettings {
            frame_limit: 1,
            data_source: DataSource::Live,
            poll_interval: Duration::from_millis(50),
            analog: Vec::new(),
            digital: [None; NUM_DIGITAL_CHANNELS],
        }
    }
}

/// Identify the instrument behind `scpi`.
///
/// A failed `*IDN?` is retried once after reopening the link: some USB-TMC
/// firmware drops the first request after power-up.
pub async fn probe(scpi: &mut ScpiSession) -> Result<(HwInfo, RigolModel, DataFormat)> {
    let hw_info = match scpi.get_hw_id().await {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!(error = %e, "*IDN? failed, reopening and retrying");
            scpi.close().await?;
            scpi.open().await?;
            scpi.get_hw_id().await?
        }
    };

    let model = find_model(&hw_info.manufacturer, &hw_info.model).ok_or_else(|| {
        Error::Unsupported(format!(
            "unsupported instrument {} {}",
            hw_info.manufacturer, hw_info.model
        ))
    })?;
    let format = data_format(&model, &hw_info.firmware_version);

    tracing::info!(
        vendor = %model.series.vendor,
        model = model.name,
        series = model.series.name,
        firmware = %hw_info.firmware_version,
        format = ?format,
        "Found instrument"
    );
    Ok((hw_info, model, format))
}

/// An open Rigol DS oscilloscope.
#[derive(Debug)]
pub struct RigolScope {
    pub(crate) scpi: ScpiSession,
    pub(crate) ctx: DeviceContext,
    pub(crate) settings: AcquisitionSettings,
    hw_info: HwInfo,
}

impl RigolScope {
    /// Open `scpi`, identify the instrument and read its configuration.
    pub(crate) async fn open(mut scpi: ScpiSession, mut settings: AcquisitionSettings) -> Result<Self> {
        scpi.open().await?;
        let (hw_info, model, format) = probe(&mut scpi).await?;

        if settings.analog.len() > model.analog_channels {
            return Err(Error::InvalidArgument(format!(
                "{} has {} analog channels, {} requested",
                model.name,
                model.analog_channels,
                settings.analog.len()
            )));
        }
        if !model.has_digital && settings.digital.iter().any(|d| *d == Some(true)) {
            return Err(Error::InvalidArgument(format!("{} has no logic analyzer", model.name)));
        }
        settings.analog.resize(model.analog_channels, None);

        let mut ctx = DeviceContext::new(model, format);
        read_config(&mut scpi, &mut ctx).await?;

        Ok(RigolScope {
            scpi,
            ctx,
            settings,
            hw_info,
        })
    }

    pub fn hw_info(&self) -> &HwInfo {
        &self.hw_info
    }

    pub fn model(&self) -> &RigolModel {
        &self.ctx.model
    }

    /// Instrument configuration as last read or written.
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn data_format(&self) -> DataFormat {
        self.ctx.format
    }

    pub fn data_source(&self) -> DataSource {
        self.settings.data_source
    }

    pub fn frame_limit(&self) -> u64 {
        self.settings.frame_limit
    }

    /// Link description, e.g. `tcp-raw/192.168.1.20/5555`.
    pub fn description(&self) -> String {
        self.scpi.description()
    }

    /// Send a setting command and wait until the instrument has applied it.
    pub async fn config_set(&mut self, command: &str) -> Result<()> {
        self.scpi.send(command).await?;
        if self.ctx.protocol() == Protocol::V2 {
            tokio::time::sleep(V2_SETTLE_DELAY).await;
            Ok(())
        } else {
            self.scpi.get_opc().await
        }
    }

    /// Send an arbitrary query and return the reply.
    pub async fn query(&mut self, command: &str) -> Result<String> {
        self.scpi.get_string(Some(command)).await
    }

    /// Register an acquisition with `event_loop`.
    ///
    /// Packets go to `sink` until the frame limit is reached, the single
    /// memory frame has been read, or the loop is cancelled.
    pub async fn acquisition_start<'a, S: PacketSink + 'a>(
        &'a mut self,
        event_loop: &mut EventLoop<'a>,
        sink: &'a mut S,
    ) -> Result<SourceId> {
        let source = self.scpi.poll_source(self.settings.poll_interval);
        let acquisition = Acquisition::start(self, sink).await?;
        Ok(event_loop.source_add(source, Box::new(acquisition)))
    }

    /// Run one acquisition to completion.
    pub async fn acquire<S: PacketSink>(&mut self, sink: &mut S) -> Result<()> {
        self.acquire_with_cancellation(sink, CancellationToken::new()).await
    }

    /// Run one acquisition until it completes or `cancel` fires.
    pub async fn acquire_with_cancellation<S: PacketSink>(
        &mut self,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut event_loop = EventLoop::with_cancellation(cancel);
        self.acquisition_start(&mut event_loop, sink).await?;
        event_loop.run().await
    }

    /// Release the front panel and close the link.
    pub async fn close(mut self) -> Result<()> {
        if self.ctx.protocol() == Protocol::V2 {
            // DS1000 locks its keys while remote controlled.
            if let Err(e) = self.scpi.send(":KEY:LOCK DISABLE").await {
                tracing::warn!(error = %e, "Failed to unlock front panel");
            }
        }
        self.scpi.close().await?;
        tracing::info!(model = self.ctx.model.name, "Closed instrument");
        Ok(())
    }
}
