//! Instrument configuration as last read from (or written to) the scope.
//!
//! [`DeviceContext`] mirrors the settings the acquisition depends on:
//! which channels are on, their vertical scale, the timebase and the
//! trigger. [`read_config`] fills it in from the instrument at open time.

use benchlib_core::error::Result;
use benchlib_scpi::ScpiSession;
use benchlib_scpi::parse;

use crate::convert::VerticalScale;
use crate::models::{DataFormat, NUM_DIGITAL_CHANNELS, Protocol, RigolModel};

/// Vertical reference assumed when the instrument is not asked for one.
const DEFAULT_VERTICAL_REFERENCE: i32 = 128;

/// Settings of one analog channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogChannel {
    pub enabled: bool,
    /// Volts per division.
    pub vdiv: f32,
    /// Vertical offset in volts.
    pub offset: f32,
    pub vertical_reference: i32,
    /// Probe attenuation factor (1, 10, ...).
    pub probe_factor: f32,
    /// Coupling as reported by the instrument (`AC`, `DC`, `GND`).
    pub coupling: String,
}

impl Default for AnalogChannel {
    fn default() -> Self {
        AnalogChannel {
            enabled: false,
            vdiv: 1.0,
            offset: 0.0,
            vertical_reference: DEFAULT_VERTICAL_REFERENCE,
            probe_factor: 1.0,
            coupling: String::new(),
        }
    }
}

impl AnalogChannel {
    pub fn scale(&self) -> VerticalScale {
        VerticalScale {
            vdiv: self.vdiv,
            offset: self.offset,
            reference: self.vertical_reference,
        }
    }
}

/// Per-instrument state shared by configuration and acquisition.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub model: RigolModel,
    /// Data format in use, which may be older than the series default.
    pub format: DataFormat,
    pub analog: Vec<AnalogChannel>,
    /// Logic analyzer module on.
    pub la_enabled: bool,
    pub digital: [bool; NUM_DIGITAL_CHANNELS],
    /// Seconds per division.
    pub timebase: f32,
    /// Horizontal trigger position in seconds.
    pub horiz_triggerpos: f32,
    pub trigger_source: String,
    pub trigger_slope: String,
    pub trigger_level: f32,
}

impl DeviceContext {
    pub fn new(model: RigolModel, format: DataFormat) -> Self {
        let analog = vec![AnalogChannel::default(); model.analog_channels];
        DeviceContext {
            model,
            format,
            analog,
            la_enabled: false,
            digital: [false; NUM_DIGITAL_CHANNELS],
            timebase: 0.0,
            horiz_triggerpos: 0.0,
            trigger_source: String::new(),
            trigger_slope: String::new(),
            trigger_level: 0.0,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.model.series.protocol
    }
}

/// Parse a probe factor, tolerating the trailing `X` some firmware adds.
pub fn parse_probe_factor(reply: &str) -> Result<f32> {
    let reply = reply.trim_end();
    parse::parse_float(reply.strip_suffix('X').unwrap_or(reply))
}

/// Query the digital channel display state command for `channel`.
fn digital_state_query(protocol: Protocol, channel: usize) -> String {
    if protocol >= Protocol::V3 {
        format!(":LA:DIG{channel}:DISP?")
    } else {
        format!(":DIG{channel}:TURN?")
    }
}

/// Read the current instrument configuration into `ctx`.
pub async fn read_config(scpi: &mut ScpiSession, ctx: &mut DeviceContext) -> Result<()> {
    let protocol = ctx.protocol();

    for (i, channel) in ctx.analog.iter_mut().enumerate() {
        channel.enabled = scpi.get_bool(Some(&format!(":CHAN{}:DISP?", i + 1))).await?;
        tracing::debug!(channel = i + 1, enabled = channel.enabled, "Analog channel state");
    }

    if ctx.model.has_digital {
        let query = if protocol >= Protocol::V3 { ":LA:STAT?" } else { ":LA:DISP?" };
        ctx.la_enabled = scpi.get_bool(Some(query)).await?;
        for (i, enabled) in ctx.digital.iter_mut().enumerate() {
            *enabled = scpi.get_bool(Some(&digital_state_query(protocol, i))).await?;
        }
        tracing::debug!(la_enabled = ctx.la_enabled, digital = ?ctx.digital, "Logic analyzer state");
    }

    ctx.timebase = scpi.get_float(Some(":TIM:SCAL?")).await?;
    tracing::debug!(timebase = ctx.timebase, "Current timebase");

    for (i, channel) in ctx.analog.iter_mut().enumerate() {
        let reply = scpi.get_string(Some(&format!(":CHAN{}:PROB?", i + 1))).await?;
        channel.probe_factor = parse_probe_factor(&reply)?;
    }

    for (i, channel) in ctx.analog.iter_mut().enumerate() {
        channel.vdiv = scpi.get_float(Some(&format!(":CHAN{}:SCAL?", i + 1))).await?;
    }

    if ctx.format == DataFormat::Ieee4882 && protocol >= Protocol::V3 {
        for i in 0..ctx.analog.len() {
            scpi.send(&format!(":WAV:SOUR CHAN{}", i + 1)).await?;
            ctx.analog[i].vertical_reference = scpi.get_int(Some(":WAV:YREF?")).await?;
        }
    }

    for (i, channel) in ctx.analog.iter_mut().enumerate() {
        channel.offset = scpi.get_float(Some(&format!(":CHAN{}:OFFS?", i + 1))).await?;
    }

    for (i, channel) in ctx.analog.iter_mut().enumerate() {
        channel.coupling = scpi.get_string(Some(&format!(":CHAN{}:COUP?", i + 1))).await?;
        tracing::debug!(
            channel = i + 1,
            vdiv = channel.vdiv,
            offset = channel.offset,
            reference = channel.vertical_reference,
            probe = channel.probe_factor,
            coupling = %channel.coupling,
            "Vertical settings"
        );
    }

    ctx.trigger_source = scpi.get_string(Some(":TRIG:EDGE:SOUR?")).await?;
    ctx.horiz_triggerpos = scpi.get_float(Some(":TIM:OFFS?")).await?;
    ctx.trigger_slope = scpi.get_string(Some(":TRIG:EDGE:SLOP?")).await?;
    ctx.trigger_level = scpi.get_float(Some(":TRIG:EDGE:LEV?")).await?;
    tracing::debug!(
        source = %ctx.trigger_source,
        position = ctx.horiz_triggerpos,
        slope = %ctx.trigger_slope,
        level = ctx.trigger_level,
        "Current trigger"
    );
    Ok(())
}
