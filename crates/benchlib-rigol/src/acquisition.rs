//! Acquisition state machine.
//!
//! An [`Acquisition`] is a [`PollHandler`] registered with the host
//! [`EventLoop`](benchlib_core::EventLoop). Every callback makes one step of
//! progress: wait for the trigger, wait for the instrument to finish
//! filling its output buffer, or read one chunk of a waveform block. What
//! a callback may do is decided by the current [`WaitEvent`].
//!
//! ```text
//!            capture start
//!   ┌────────────┴─────────────┐
//!   v                          v
//! Trigger ── channel start ── Stop ── *ESR? ok ──┐
//!   │                          ^        │        │
//!   │                          └─ :SING ┘        │
//!   v                                            v
//! Block (IEEE) / None (legacy) <──── channel start
//!   │
//!   v
//! None ── read header, read chunks ── next channel / next frame / end
//! ```
//!
//! The instrument status is only ever polled with short sleeps between
//! queries. A single callback spends at most one second waiting, after
//! which it yields and resumes on the next callback; the whole wait fails
//! with [`Error::Timeout`] three seconds after it began, which ends the
//! run.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use benchlib_core::error::{Error, Result};
use benchlib_core::packet::{AnalogPacket, Header, LogicPacket, Packet, Quantity, Unit};
use benchlib_core::session::{Control, PacketSink, PollHandler};
use benchlib_scpi::engine::READ_RETRY_INTERVAL;
use benchlib_scpi::{BlockHeaderReader, HeaderStatus, parse};

use crate::models::{DataFormat, Protocol};
use crate::scope::RigolScope;

/// Largest chunk read from the instrument in one callback.
pub const ACQ_BUFFER_SIZE: usize = 32_768;

/// Deadline for a trigger, stop or block wait.
pub const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the stop sanity check may re-arm a failed single shot.
pub const MAX_SINGLE_SHOT_REARMS: u32 = 3;

/// Consecutive malformed block headers tolerated before the run aborts.
pub const MAX_HEADER_ERRORS: u32 = 3;

/// Longest time one callback spends in a wait.
const WAIT_SLICE: Duration = Duration::from_secs(1);

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(10);

const TRIGGER_STATUS_QUERY: &str = ":TRIG:STAT?";
const BLOCK_STATUS_QUERY: &str = ":WAV:STAT?";

/// Below this timebase the trigger status is not polled at all.
const FAST_TIMEBASE: f32 = 0.0499;
/// Above this timebase a fast sweep is still worth sleeping for.
const MIN_SLEEP_TIMEBASE: f32 = 0.99e-6;
/// Share of one sweep slept before reading at fast timebases.
const SWEEP_FRACTION: f32 = 0.85;

/// Frames at least this long are polled less often in the block wait.
const LONG_FRAME_SAMPLES: usize = 15_000;
const BLOCK_POLL_SHORT: Duration = Duration::from_millis(100);
const BLOCK_POLL_LONG: Duration = Duration::from_secs(1);
/// `:WAV:STAT?` sample count at which the block is treated as ready.
const BLOCK_READY_SAMPLES: i32 = 1_000_000;

/// `*ESR?` execution error bit, set when a single shot did not capture.
const ESR_EXECUTION_ERROR: i32 = 0x10;
const REARM_DELAY: Duration = Duration::from_millis(500);

/// Empty reads tolerated while discarding bytes.
const DISCARD_RETRIES: usize = 100;

/// Where waveform data is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSource {
    /// The screen buffer, one frame per trigger.
    #[default]
    Live,
    /// The deep acquisition memory, one single-shot frame.
    Memory,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Live => write!(f, "live"),
            DataSource::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for DataSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(DataSource::Live),
            "memory" => Ok(DataSource::Memory),
            _ => Err(Error::InvalidArgument(format!("unknown data source '{s}'"))),
        }
    }
}

/// What the next callback waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// Nothing; read block data.
    None,
    /// The instrument to trigger.
    Trigger,
    /// The instrument to finish preparing a data block.
    Block,
    /// A single shot to complete.
    Stop,
}

/// Progress of a status wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitPhase {
    /// The status still shows the previous event; wait for it to clear.
    Leaving,
    /// Wait for the status to show the event.
    Entering,
}

/// One entry of the per-frame read sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqChannel {
    /// Analog channel, zero-based.
    Analog(usize),
    /// The whole logic analyzer pod (V1-V3 read all digital channels at once).
    LogicPod,
    /// A single digital channel (V4).
    Digital(usize),
}

impl AcqChannel {
    fn is_analog(self) -> bool {
        matches!(self, AcqChannel::Analog(_))
    }

    /// `:WAV:SOUR` argument selecting this channel.
    fn source(self) -> String {
        match self {
            AcqChannel::Analog(i) => format!("CHAN{}", i + 1),
            AcqChannel::LogicPod => "LA".to_string(),
            AcqChannel::Digital(n) => format!("D{n}"),
        }
    }
}

impl fmt::Display for AcqChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcqChannel::Analog(i) => write!(f, "CH{}", i + 1),
            AcqChannel::LogicPod => write!(f, "LA"),
            AcqChannel::Digital(n) => write!(f, "D{n}"),
        }
    }
}

/// A running acquisition on one [`RigolScope`].
pub struct Acquisition<'a, S: PacketSink> {
    scope: &'a mut RigolScope,
    sink: &'a mut S,
    channels: Vec<AcqChannel>,
    channel_index: usize,

    wait_event: WaitEvent,
    wait_phase: WaitPhase,
    wait_started: Option<Instant>,

    analog_frame_size: usize,
    digital_frame_size: usize,
    num_frames: u64,
    num_channel_bytes: usize,
    /// Length of the block being read; zero while a header is expected.
    num_block_bytes: usize,
    num_block_read: usize,

    header: BlockHeaderReader,
    /// `:WAV:DATA?` sent, header not complete yet.
    block_requested: bool,
    header_errors: u32,
    rearms: u32,

    frame_open: bool,
    finished: bool,
    buffer: Vec<u8>,
}

impl<'a, S: PacketSink> Acquisition<'a, S> {
    /// Configure the instrument, emit the run header and arm the first
    /// frame.
    pub(crate) async fn start(scope: &'a mut RigolScope, sink: &'a mut S) -> Result<Self> {
        let channels = sync_channels(scope).await?;
        let live = scope.settings.data_source == DataSource::Live;
        let series = scope.ctx.model.series;

        let analog_count = channels.iter().filter(|c| c.is_analog()).count();
        let analog_frame_size = match (analog_count, live) {
            (0, _) => 0,
            (_, true) => series.live_samples,
            (n, false) => series.buffer_samples / n,
        };
        let digital_frame_size = if live {
            series.live_samples * 2
        } else {
            series.buffer_samples * 2
        };

        match series.protocol {
            Protocol::V2 => scope.config_set(":ACQ:MEMD LONG").await?,
            Protocol::V3 => {
                // Memory depth can only be changed while running.
                scope.config_set(":RUN").await?;
                scope.config_set(&format!(":ACQ:MDEP {analog_frame_size}")).await?;
                scope.config_set(":STOP").await?;
            }
            _ => {}
        }
        if live {
            scope.config_set(":RUN").await?;
        }

        tracing::info!(
            model = scope.ctx.model.name,
            source = %scope.settings.data_source,
            channels = channels.len(),
            frame_limit = scope.settings.frame_limit,
            "Starting acquisition"
        );

        let mut acquisition = Acquisition {
            scope,
            sink,
            channels,
            channel_index: 0,
            wait_event: WaitEvent::None,
            wait_phase: WaitPhase::Leaving,
            wait_started: None,
            analog_frame_size,
            digital_frame_size,
            num_frames: 0,
            num_channel_bytes: 0,
            num_block_bytes: 0,
            num_block_read: 0,
            header: BlockHeaderReader::new(),
            block_requested: false,
            header_errors: 0,
            rearms: 0,
            frame_open: false,
            finished: false,
            buffer: vec![0; ACQ_BUFFER_SIZE],
        };

        acquisition.sink.send_packet(Packet::Header(Header::now()))?;
        if let Err(e) = acquisition.begin_frame().await {
            acquisition.abort(&e).await;
            return Err(e);
        }
        Ok(acquisition)
    }

    pub fn wait_event(&self) -> WaitEvent {
        self.wait_event
    }

    /// Frames completed so far.
    pub fn num_frames(&self) -> u64 {
        self.num_frames
    }

    /// Channels read in every frame, in order.
    pub fn channels(&self) -> &[AcqChannel] {
        &self.channels
    }

    fn protocol(&self) -> Protocol {
        self.scope.ctx.model.series.protocol
    }

    fn live(&self) -> bool {
        self.scope.settings.data_source == DataSource::Live
    }

    fn current_channel(&self) -> AcqChannel {
        self.channels[self.channel_index]
    }

    fn expected_bytes(&self, channel: AcqChannel) -> usize {
        if channel.is_analog() {
            self.analog_frame_size
        } else {
            self.digital_frame_size
        }
    }

    fn set_wait(&mut self, event: WaitEvent) {
        tracing::debug!(from = ?self.wait_event, to = ?event, "Wait event");
        self.wait_event = event;
        self.wait_started = None;
        self.wait_phase = if event == WaitEvent::Stop {
            WaitPhase::Entering
        } else {
            WaitPhase::Leaving
        };
    }

    async fn begin_frame(&mut self) -> Result<()> {
        self.channel_index = 0;
        self.capture_start().await?;
        self.sink.send_packet(Packet::FrameBegin)?;
        self.frame_open = true;
        Ok(())
    }

    /// Arm the instrument for the next frame.
    async fn capture_start(&mut self) -> Result<()> {
        let first_frame = self.num_frames == 0;
        let live = self.live();
        tracing::debug!(
            frame = self.num_frames + 1,
            limit = self.scope.settings.frame_limit,
            "Starting data capture"
        );

        match self.protocol() {
            Protocol::V1 => self.set_wait(WaitEvent::Trigger),
            Protocol::V2 if live => {
                self.scope.config_set(":WAV:POIN:MODE NORMAL").await?;
                self.set_wait(WaitEvent::Trigger);
            }
            Protocol::V2 => {
                self.scope.config_set(":STOP").await?;
                self.scope.config_set(":WAV:POIN:MODE RAW").await?;
                let mode = self.scope.scpi.get_string(Some(":TRIG:MODE?")).await?;
                self.scope.config_set(&format!(":TRIG:{mode}:SWE SING")).await?;
                self.scope.config_set(":RUN").await?;
                self.set_wait(WaitEvent::Stop);
            }
            protocol @ (Protocol::V3 | Protocol::V4) => {
                if first_frame {
                    self.scope.config_set(":WAV:FORM BYTE").await?;
                }
                if live {
                    if first_frame {
                        self.scope.config_set(":WAV:MODE NORM").await?;
                    }
                    let samples = self.scope.ctx.model.series.live_samples;
                    self.analog_frame_size = samples;
                    self.digital_frame_size = samples;
                    self.set_wait(WaitEvent::Trigger);
                } else {
                    if protocol == Protocol::V3 && first_frame {
                        self.scope.config_set(":WAV:MODE RAW").await?;
                    } else if protocol == Protocol::V4 && first_frame {
                        self.split_memory_depth().await?;
                    }
                    self.scope.config_set(":SINGL").await?;
                    self.set_wait(WaitEvent::Stop);
                }
            }
        }
        Ok(())
    }

    /// Share the V4 deep memory between the active channels.
    ///
    /// Channels 3 and 4 share their memory with D0-7 and D8-15.
    async fn split_memory_depth(&mut self) -> Result<()> {
        let ctx = &self.scope.ctx;
        let mut active = 0usize;
        for (i, channel) in ctx.analog.iter().enumerate() {
            if channel.enabled {
                active += 1;
            } else if i >= 2 && ctx.model.has_digital && ctx.digital[8 * (i - 2)..8 * (i - 1)].iter().any(|d| *d) {
                active += 1;
            }
        }

        let buffer_samples = ctx.model.series.buffer_samples;
        let depth = if buffer_samples == 0 {
            let depth = self.scope.scpi.get_int(Some(":ACQ:MDEP?")).await?;
            usize::try_from(depth)
                .map_err(|_| Error::Protocol(format!("invalid memory depth {depth}")))?
        } else {
            match active {
                1 => buffer_samples,
                2 => buffer_samples / 2,
                _ => buffer_samples / 4,
            }
        };
        tracing::debug!(active, depth, "Memory depth per channel");
        self.analog_frame_size = depth;
        self.digital_frame_size = depth;
        Ok(())
    }

    /// Select the current channel for readout.
    async fn channel_start(&mut self) -> Result<()> {
        let channel = self.current_channel();
        let first_frame = self.num_frames == 0;
        let live = self.live();
        tracing::debug!(channel = %channel, "Starting reading data from channel");

        match self.protocol() {
            Protocol::V1 | Protocol::V2 => {
                let command = match channel {
                    AcqChannel::Analog(i) => format!(":WAV:DATA? CHAN{}", i + 1),
                    _ => ":WAV:DATA? DIG".to_string(),
                };
                self.scope.scpi.send(&command).await?;
            }
            Protocol::V3 => {
                self.scope.config_set(&format!(":WAV:SOUR {}", channel.source())).await?;
                if !live {
                    self.scope.config_set(":WAV:RES").await?;
                    self.scope.config_set(":WAV:BEG").await?;
                }
            }
            Protocol::V4 => {
                self.scope.config_set(&format!(":WAV:SOUR {}", channel.source())).await?;
                if first_frame {
                    let mode = if live { ":WAV:MODE NORM" } else { ":WAV:MODE RAW" };
                    self.scope.config_set(mode).await?;
                }
                if !live {
                    self.scope.config_set(":WAV:RES").await?;
                }
            }
        }

        let next = match self.scope.ctx.format {
            DataFormat::Ieee4882 => WaitEvent::Block,
            DataFormat::Legacy => WaitEvent::None,
        };
        self.set_wait(next);

        self.num_channel_bytes = 0;
        self.num_block_bytes = 0;
        self.num_block_read = 0;
        self.header.reset();
        self.block_requested = false;
        Ok(())
    }

    /// Poll `:TRIG:STAT?` until its first letter is `status1` or `status2`.
    ///
    /// Returns `Ok(false)` when this callback's share of the wait is used
    /// up.
    async fn event_wait(&mut self, status1: char, status2: char) -> Result<bool> {
        let started = *self.wait_started.get_or_insert_with(Instant::now);
        let slice_end = Instant::now() + WAIT_SLICE;

        loop {
            if started.elapsed() >= EVENT_WAIT_TIMEOUT {
                tracing::warn!(event = ?self.wait_event, "Timed out waiting for instrument status");
                return Err(Error::Timeout);
            }
            if Instant::now() >= slice_end {
                return Ok(false);
            }

            match self.scope.scpi.get_string(Some(TRIGGER_STATUS_QUERY)).await {
                Ok(status) => {
                    let first = status.chars().next();
                    let matched = first == Some(status1) || first == Some(status2);
                    tracing::trace!(status = %status, phase = ?self.wait_phase, "Trigger status");
                    match (self.wait_phase, matched) {
                        (WaitPhase::Leaving, false) => self.wait_phase = WaitPhase::Entering,
                        (WaitPhase::Entering, true) => {
                            self.set_wait(WaitEvent::None);
                            return Ok(true);
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_timeout() => tracing::debug!("No reply to trigger status query"),
                Err(e) => return Err(e),
            }

            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    async fn trigger_wait(&mut self) -> Result<bool> {
        let timebase = self.scope.ctx.timebase;
        if timebase < FAST_TIMEBASE {
            // Polling the status at fast timebases misses triggers; sleep
            // for most of a sweep instead.
            if timebase > MIN_SLEEP_TIMEBASE {
                let divs = self.scope.ctx.model.series.num_horizontal_divs as f32;
                tokio::time::sleep(Duration::from_secs_f32(timebase * divs * SWEEP_FRACTION)).await;
            }
            self.set_wait(WaitEvent::None);
            return Ok(true);
        }
        self.event_wait('T', 'A').await
    }

    async fn stop_wait(&mut self) -> Result<bool> {
        self.event_wait('S', 'S').await
    }

    /// Make sure a stopped single shot actually captured something.
    ///
    /// Returns `Ok(false)` after re-arming.
    async fn check_stop(&mut self) -> Result<bool> {
        if self.protocol() != Protocol::V3 {
            return Ok(true);
        }

        let channel = self.current_channel();
        let frame = self.expected_bytes(channel);
        self.scope.config_set(&format!(":WAV:SOUR {}", channel.source())).await?;
        self.scope.config_set(&format!(":WAV:POIN {frame}")).await?;

        let esr = self.scope.scpi.get_int(Some("*ESR?")).await?;
        if esr & ESR_EXECUTION_ERROR == 0 {
            self.rearms = 0;
            return Ok(true);
        }

        if self.rearms >= MAX_SINGLE_SHOT_REARMS {
            tracing::error!(esr, "Single shot acquisition failed, giving up");
            return Err(Error::SingleShotFailed(MAX_SINGLE_SHOT_REARMS));
        }
        self.rearms += 1;
        tracing::warn!(esr, attempt = self.rearms, "Single shot acquisition failed, re-arming");

        tokio::time::sleep(REARM_DELAY).await;
        self.scope.config_set(":SING").await?;
        self.set_wait(WaitEvent::Stop);
        Ok(false)
    }

    /// Wait until a V3 instrument reports its output buffer ready.
    async fn block_wait(&mut self) -> Result<bool> {
        if self.protocol() != Protocol::V3 {
            self.set_wait(WaitEvent::None);
            return Ok(true);
        }

        let started = *self.wait_started.get_or_insert_with(Instant::now);
        let slice_end = Instant::now() + WAIT_SLICE;
        let interval = if self.analog_frame_size < LONG_FRAME_SAMPLES {
            BLOCK_POLL_SHORT
        } else {
            BLOCK_POLL_LONG
        };

        loop {
            tokio::time::sleep(interval).await;

            match self.scope.scpi.get_string(Some(BLOCK_STATUS_QUERY)).await {
                Ok(status) => {
                    // "READ,1400" or "IDLE,1400"
                    let samples = parse::parse_int(status.get(5..).unwrap_or(""))?;
                    tracing::trace!(status = %status, samples, "Block status");
                    if !status.starts_with('R') || samples >= BLOCK_READY_SAMPLES {
                        self.set_wait(WaitEvent::None);
                        return Ok(true);
                    }
                }
                Err(e) if e.is_timeout() => tracing::debug!("No reply to block status query"),
                Err(e) => return Err(e),
            }

            if started.elapsed() >= EVENT_WAIT_TIMEOUT {
                tracing::warn!("Timed out waiting for data block");
                return Err(Error::Timeout);
            }
            if Instant::now() >= slice_end {
                return Ok(false);
            }
        }
    }

    /// Read and drop up to `count` bytes.
    async fn discard(&mut self, mut count: usize) -> Result<()> {
        let mut idle = 0;
        while count > 0 && idle < DISCARD_RETRIES {
            let want = count.min(ACQ_BUFFER_SIZE);
            let n = self.scope.scpi.read_data(&mut self.buffer[..want]).await?;
            if n == 0 {
                idle += 1;
                tokio::time::sleep(READ_RETRY_INTERVAL).await;
            } else {
                count -= n;
                idle = 0;
            }
        }
        if count > 0 {
            tracing::debug!(remaining = count, "Gave up discarding bytes");
        }
        Ok(())
    }

    /// One callback's worth of progress.
    async fn step(&mut self) -> Result<Control> {
        match self.wait_event {
            WaitEvent::None => {}
            WaitEvent::Trigger => {
                if self.trigger_wait().await? {
                    self.channel_start().await?;
                }
                return Ok(Control::Continue);
            }
            WaitEvent::Block => {
                if !self.block_wait().await? {
                    return Ok(Control::Continue);
                }
            }
            WaitEvent::Stop => {
                if self.stop_wait().await? && self.check_stop().await? {
                    self.channel_start().await?;
                }
                return Ok(Control::Continue);
            }
        }

        self.read_block().await
    }

    /// Read the next piece of the current channel's data.
    async fn read_block(&mut self) -> Result<Control> {
        let channel = self.current_channel();
        let expected = self.expected_bytes(channel);
        let format = self.scope.ctx.format;

        if self.num_block_bytes == 0 {
            if !self.block_requested {
                if self.protocol() >= Protocol::V3 {
                    self.scope.config_set(":WAV:BEG").await?;
                    self.scope.scpi.send(":WAV:DATA?").await?;
                }
                self.scope.scpi.read_begin().await?;
                self.block_requested = true;
            }

            match format {
                DataFormat::Ieee4882 => {
                    let Some(length) = self.read_header().await? else {
                        return Ok(Control::Continue);
                    };
                    if self.live() && length < expected {
                        tracing::debug!(length, expected, "Discarding short data block");
                        self.discard(length + 1).await?;
                        return Ok(Control::Continue);
                    }
                    self.num_block_bytes = length;
                }
                DataFormat::Legacy => {
                    self.block_requested = false;
                    self.num_block_bytes = expected;
                }
            }
            self.num_block_read = 0;
        }

        let want = (self.num_block_bytes - self.num_block_read).min(ACQ_BUFFER_SIZE);
        let len = self.scope.scpi.read_data(&mut self.buffer[..want]).await?;
        if len == 0 {
            return Ok(Control::Continue);
        }
        tracing::trace!(channel = %channel, len, "Received block data");

        self.num_block_read += len;
        self.emit(channel, len)?;

        if self.num_block_read == self.num_block_bytes {
            tracing::debug!(channel = %channel, bytes = self.num_block_bytes, "Block has been completed");
            if self.protocol() >= Protocol::V3 {
                // Trailing linefeed.
                self.discard(1).await?;
            }
            if format == DataFormat::Ieee4882 {
                self.num_block_bytes = 0;
                if !self.live() {
                    self.set_wait(WaitEvent::Block);
                }
            }
            self.num_block_read = 0;
        }

        self.num_channel_bytes += len;
        if self.num_channel_bytes < expected {
            return Ok(Control::Continue);
        }

        if self.protocol() == Protocol::V3 && !self.live() {
            self.scope.config_set(":WAV:END").await?;
        }

        if self.channel_index + 1 < self.channels.len() {
            self.channel_index += 1;
            self.channel_start().await?;
            return Ok(Control::Continue);
        }

        self.sink.send_packet(Packet::FrameEnd)?;
        self.frame_open = false;
        self.num_frames += 1;
        tracing::debug!(frames = self.num_frames, "Frame completed");

        let limit = self.scope.settings.frame_limit;
        if (limit != 0 && self.num_frames >= limit) || !self.live() {
            self.finish().await?;
            return Ok(Control::Remove);
        }

        self.begin_frame().await?;
        Ok(Control::Continue)
    }

    /// Continue decoding a block header. `Ok(None)` while incomplete.
    async fn read_header(&mut self) -> Result<Option<usize>> {
        let status = match self.scope.scpi.read_block_header(&mut self.header).await {
            Ok(status) => status,
            Err(e @ Error::Protocol(_)) => return self.header_error(e),
            Err(e) => return Err(e),
        };
        let HeaderStatus::Complete(header) = status else {
            return Ok(None);
        };

        self.header.reset();
        self.block_requested = false;
        if header.byte_length == 0 {
            return self.header_error(Error::Protocol("empty data block".into()));
        }
        self.header_errors = 0;
        Ok(Some(header.byte_length))
    }

    fn header_error(&mut self, e: Error) -> Result<Option<usize>> {
        self.header.reset();
        self.block_requested = false;
        self.header_errors += 1;
        if self.header_errors >= MAX_HEADER_ERRORS {
            tracing::error!(error = %e, "Error while reading block header, aborting capture");
            return Err(e);
        }
        tracing::warn!(error = %e, attempt = self.header_errors, "Malformed block header, retrying");
        Ok(None)
    }

    fn emit(&mut self, channel: AcqChannel, len: usize) -> Result<()> {
        let data = &self.buffer[..len];
        let packet = match channel {
            AcqChannel::Analog(i) => {
                let scale = self.scope.ctx.analog[i].scale();
                Packet::Analog(AnalogPacket {
                    channel: channel.to_string(),
                    samples: scale.convert_all(self.scope.ctx.format, data),
                    quantity: Quantity::Voltage,
                    unit: Unit::Volt,
                    digits: scale.digits(),
                })
            }
            AcqChannel::LogicPod | AcqChannel::Digital(_) => Packet::Logic(LogicPacket {
                unit_size: if self.protocol() >= Protocol::V4 { 1 } else { 2 },
                data: data.to_vec(),
            }),
        };
        self.sink.send_packet(packet)
    }

    /// End the run normally.
    async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if self.frame_open {
            self.frame_open = false;
            self.sink.send_packet(Packet::FrameEnd)?;
        }
        self.sink.send_packet(Packet::End)?;
        self.scope.scpi.send(":STOP").await?;
        tracing::info!(frames = self.num_frames, "Acquisition stopped");
        Ok(())
    }

    /// End the run after `error`, keeping the packet stream well formed.
    async fn abort(&mut self, error: &Error) {
        tracing::error!(error = %error, frames = self.num_frames, "Acquisition aborted");
        if let Err(e) = self.finish().await {
            tracing::warn!(error = %e, "Failed to stop acquisition cleanly");
        }
    }
}

#[async_trait]
impl<'a, S: PacketSink> PollHandler for Acquisition<'a, S> {
    async fn poll(&mut self) -> Result<Control> {
        match self.step().await {
            Ok(control) => Ok(control),
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.finish().await
    }
}

/// Bring the instrument's channel state in line with the requested
/// enables and return the read sequence.
async fn sync_channels(scope: &mut RigolScope) -> Result<Vec<AcqChannel>> {
    let protocol = scope.ctx.protocol();
    let mut channels = Vec::new();

    for i in 0..scope.ctx.analog.len() {
        let current = scope.ctx.analog[i].enabled;
        let wanted = scope.settings.analog.get(i).copied().flatten().unwrap_or(current);
        if wanted {
            channels.push(AcqChannel::Analog(i));
        }
        if wanted != current {
            let state = if wanted { "ON" } else { "OFF" };
            scope.config_set(&format!(":CHAN{}:DISP {state}", i + 1)).await?;
            scope.ctx.analog[i].enabled = wanted;
        }
    }

    if scope.ctx.model.has_digital {
        let mut some_digital = false;
        for d in 0..scope.ctx.digital.len() {
            let current = scope.ctx.digital[d];
            let wanted = scope.settings.digital[d].unwrap_or(current);
            if wanted {
                if protocol >= Protocol::V4 {
                    channels.push(AcqChannel::Digital(d));
                } else if !some_digital {
                    channels.push(AcqChannel::LogicPod);
                }
                some_digital = true;
                if !scope.ctx.la_enabled {
                    let command = if protocol >= Protocol::V3 { ":LA:STAT ON" } else { ":LA:DISP ON" };
                    scope.config_set(command).await?;
                    scope.ctx.la_enabled = true;
                }
            }
            if wanted != current {
                let state = if wanted { "ON" } else { "OFF" };
                let command = if protocol >= Protocol::V3 {
                    format!(":LA:DIG{d}:DISP {state}")
                } else {
                    format!(":DIG{d}:TURN {state}")
                };
                scope.config_set(&command).await?;
                scope.ctx.digital[d] = wanted;
            }
        }

        if scope.ctx.la_enabled && !some_digital {
            let command = if protocol >= Protocol::V3 { ":LA:STAT OFF" } else { ":LA:DISP OFF" };
            scope.config_set(command).await?;
            scope.ctx.la_enabled = false;
        }
    }

    if channels.is_empty() {
        return Err(Error::InvalidArgument("no channels enabled".into()));
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RigolBuilder;
    use crate::models::NUM_DIGITAL_CHANNELS;
    use benchlib_test_harness::{MockInstrument, ieee_block};

    /// A scripted instrument with CH1 on and everything else off.
    fn instrument(idn: &str, analog_channels: usize, timebase: &str) -> MockInstrument {
        let mock = MockInstrument::new();
        mock.reply("*IDN?", idn);
        for n in 1..=analog_channels {
            mock.reply(&format!(":CHAN{n}:DISP?"), if n == 1 { "1" } else { "0" });
            mock.reply(&format!(":CHAN{n}:PROB?"), "1");
            mock.reply(&format!(":CHAN{n}:SCAL?"), "2.56");
            mock.reply(&format!(":CHAN{n}:OFFS?"), "0");
            mock.reply(&format!(":CHAN{n}:COUP?"), "DC");
        }
        mock.reply(":LA:STAT?", "0");
        for d in 0..NUM_DIGITAL_CHANNELS {
            mock.reply(&format!(":LA:DIG{d}:DISP?"), "0");
        }
        mock.reply(":WAV:YREF?", "127");
        mock.reply(":TIM:SCAL?", timebase);
        mock.reply(":TRIG:EDGE:SOUR?", "CHAN1");
        mock.reply(":TIM:OFFS?", "0");
        mock.reply(":TRIG:EDGE:SLOP?", "POS");
        mock.reply(":TRIG:EDGE:LEV?", "0");
        mock
    }

    fn ds1104z() -> MockInstrument {
        instrument("RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04.SP4", 4, "0.001")
    }

    fn ds2072() -> MockInstrument {
        instrument("RIGOL TECHNOLOGIES,DS2072,DS2A0001,00.01.01.00.02", 2, "0.001")
    }

    async fn open(mock: &MockInstrument, builder: RigolBuilder) -> RigolScope {
        builder.build_with_transport(Box::new(mock.clone())).await.unwrap()
    }

    // ---------------------------------------------------------------
    // naming
    // ---------------------------------------------------------------

    #[test]
    fn channel_names_and_sources() {
        assert_eq!(AcqChannel::Analog(0).to_string(), "CH1");
        assert_eq!(AcqChannel::LogicPod.to_string(), "LA");
        assert_eq!(AcqChannel::Digital(7).to_string(), "D7");
        assert_eq!(AcqChannel::Analog(3).source(), "CHAN4");
        assert_eq!(AcqChannel::LogicPod.source(), "LA");
        assert_eq!(AcqChannel::Digital(12).source(), "D12");
    }

    #[test]
    fn data_source_from_str() {
        assert_eq!("live".parse::<DataSource>().unwrap(), DataSource::Live);
        assert_eq!("Memory".parse::<DataSource>().unwrap(), DataSource::Memory);
        assert!("segmented".parse::<DataSource>().is_err());
    }

    // ---------------------------------------------------------------
    // block streaming
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn short_live_block_is_discarded() {
        let mock = ds1104z();
        mock.queue_raw(":WAV:DATA?", &ieee_block(&[127; 100]));
        mock.queue_raw(":WAV:DATA?", &ieee_block(&[137; 1200]));
        let mut scope = open(&mock, RigolBuilder::new()).await;
        let mut packets = Vec::new();

        let mut acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        assert_eq!(acq.channels(), &[AcqChannel::Analog(0)]);
        assert_eq!(acq.wait_event(), WaitEvent::Trigger);

        // Fast timebase: the trigger wait is a sleep.
        assert_eq!(acq.poll().await.unwrap(), Control::Continue);
        assert_eq!(acq.wait_event(), WaitEvent::Block);

        assert_eq!(acq.poll().await.unwrap(), Control::Continue);
        assert_eq!(acq.num_block_bytes, 0);
        assert_eq!(acq.num_channel_bytes, 0);
        assert_eq!(acq.sink.len(), 2);

        assert_eq!(acq.poll().await.unwrap(), Control::Remove);
        drop(acq);

        assert_eq!(mock.unread(), 0);
        assert_eq!(packets.len(), 5);
        assert!(matches!(packets[0], Packet::Header(_)));
        assert_eq!(packets[1], Packet::FrameBegin);
        let Packet::Analog(analog) = &packets[2] else {
            panic!("expected analog packet, got {:?}", packets[2]);
        };
        assert_eq!(analog.channel, "CH1");
        assert_eq!(analog.samples.len(), 1200);
        assert!((analog.samples[0] - 1.0).abs() < 1e-6);
        assert_eq!(packets[3], Packet::FrameEnd);
        assert_eq!(packets[4], Packet::End);
        assert_eq!(mock.count(":STOP"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_headers_abort_after_limit() {
        let mock = ds1104z();
        for _ in 0..MAX_HEADER_ERRORS {
            mock.queue_raw(":WAV:DATA?", b"??");
        }
        let mut scope = open(&mock, RigolBuilder::new()).await;
        let mut packets = Vec::new();

        let mut acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        acq.poll().await.unwrap();
        for attempt in 1..MAX_HEADER_ERRORS {
            assert_eq!(acq.poll().await.unwrap(), Control::Continue);
            assert_eq!(acq.header_errors, attempt);
        }
        let err = acq.poll().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        drop(acq);

        assert_eq!(mock.count(":WAV:DATA?"), MAX_HEADER_ERRORS as usize);
        assert_eq!(packets[packets.len() - 2], Packet::FrameEnd);
        assert_eq!(packets.last(), Some(&Packet::End));
        assert_eq!(mock.count(":STOP"), 1);
    }

    // ---------------------------------------------------------------
    // waits
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn block_wait_polls_until_idle() {
        let mock = ds2072();
        mock.reply_sequence(":WAV:STAT?", &["READ,700", "IDLE,1400"]);
        mock.queue_raw(":WAV:DATA?", &ieee_block(&[127; 1400]));
        let mut scope = open(&mock, RigolBuilder::new()).await;
        let mut packets = Vec::new();

        let mut acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        acq.poll().await.unwrap();
        assert_eq!(acq.wait_event(), WaitEvent::Block);
        assert_eq!(acq.poll().await.unwrap(), Control::Remove);
        drop(acq);

        assert_eq!(mock.count(":WAV:STAT?"), 2);
        assert_eq!(mock.unread(), 0);
        assert_eq!(packets.last(), Some(&Packet::End));
    }

    #[tokio::test(start_paused = true)]
    async fn block_wait_times_out() {
        let mock = ds2072();
        mock.reply(":WAV:STAT?", "READ,700");
        let mut scope = open(&mock, RigolBuilder::new()).await;
        let mut packets = Vec::new();

        let mut acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        let started = Instant::now();
        let err = loop {
            match acq.poll().await {
                Ok(Control::Continue) => {}
                Ok(Control::Remove) => panic!("acquisition finished without data"),
                Err(e) => break e,
            }
        };
        assert!(err.is_timeout());
        assert!(started.elapsed() >= EVENT_WAIT_TIMEOUT);
        drop(acq);
        assert_eq!(packets.last(), Some(&Packet::End));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_single_shot_is_rearmed() {
        let mock = ds2072();
        mock.reply(":TRIG:STAT?", "STOP");
        mock.reply_sequence("*ESR?", &["16", "16", "0"]);
        let mut scope = open(&mock, RigolBuilder::new().data_source(DataSource::Memory)).await;
        let mut packets = Vec::new();

        let mut acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        assert_eq!(acq.wait_event(), WaitEvent::Stop);
        assert_eq!(acq.analog_frame_size, 14_000);

        acq.poll().await.unwrap();
        assert_eq!((acq.wait_event(), acq.rearms), (WaitEvent::Stop, 1));
        acq.poll().await.unwrap();
        assert_eq!((acq.wait_event(), acq.rearms), (WaitEvent::Stop, 2));
        acq.poll().await.unwrap();
        assert_eq!((acq.wait_event(), acq.rearms), (WaitEvent::Block, 0));
        drop(acq);

        assert_eq!(mock.count(":SING"), 2);
        assert_eq!(mock.count(":WAV:POIN 14000"), 3);
        assert_eq!(mock.count(":ACQ:MDEP 14000"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_shot_gives_up_after_rearms() {
        let mock = ds2072();
        mock.reply(":TRIG:STAT?", "STOP");
        mock.reply("*ESR?", "16");
        let mut scope = open(&mock, RigolBuilder::new().data_source(DataSource::Memory)).await;
        let mut packets = Vec::new();

        let mut acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        for _ in 0..MAX_SINGLE_SHOT_REARMS {
            assert_eq!(acq.poll().await.unwrap(), Control::Continue);
        }
        let err = acq.poll().await.unwrap_err();
        assert!(matches!(err, Error::SingleShotFailed(MAX_SINGLE_SHOT_REARMS)));
        drop(acq);

        assert_eq!(mock.count(":SING"), MAX_SINGLE_SHOT_REARMS as usize);
        assert_eq!(packets.last(), Some(&Packet::End));
    }

    // ---------------------------------------------------------------
    // channel setup
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn channel_enables_are_synced() {
        let mock = ds1104z();
        let builder = RigolBuilder::new().analog_channel(1, false).analog_channel(3, true);
        let mut scope = open(&mock, builder).await;
        let mut packets = Vec::new();

        let acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        assert_eq!(acq.channels(), &[AcqChannel::Analog(2)]);
        drop(acq);

        assert_eq!(mock.count(":CHAN1:DISP OFF"), 1);
        assert_eq!(mock.count(":CHAN3:DISP ON"), 1);
        assert_eq!(mock.count(":CHAN2:DISP OFF"), 0);
        assert!(scope.context().analog[2].enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn no_channels_is_rejected() {
        let mock = ds1104z();
        let mut scope = open(&mock, RigolBuilder::new().analog_channel(1, false)).await;
        let mut packets: Vec<Packet> = Vec::new();

        let err = Acquisition::start(&mut scope, &mut packets).await.err().unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(packets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn memory_depth_is_shared_with_logic_pods() {
        let mock = instrument("RIGOL TECHNOLOGIES,MSO1104Z,DS1ZB0001,00.04.04", 4, "0.001");
        let builder = RigolBuilder::new()
            .data_source(DataSource::Memory)
            .digital_channel(0, true);
        let mut scope = open(&mock, builder).await;
        let mut packets = Vec::new();

        let acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        assert_eq!(acq.channels(), &[AcqChannel::Analog(0), AcqChannel::Digital(0)]);
        // CH1 plus D0-D7, which share CH3's memory.
        assert_eq!(acq.analog_frame_size, 6_000_000);
        assert_eq!(acq.digital_frame_size, 6_000_000);
        assert_eq!(acq.wait_event(), WaitEvent::Stop);
        drop(acq);

        assert_eq!(mock.count(":LA:STAT ON"), 1);
        assert_eq!(mock.count(":LA:DIG0:DISP ON"), 1);
        assert_eq!(mock.count(":SINGL"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_closes_packet_stream() {
        let mock = ds1104z();
        let mut scope = open(&mock, RigolBuilder::new()).await;
        let mut packets = Vec::new();

        let mut acq = Acquisition::start(&mut scope, &mut packets).await.unwrap();
        acq.cancel().await.unwrap();
        acq.cancel().await.unwrap();
        drop(acq);

        assert_eq!(packets.len(), 4);
        assert_eq!(packets[2], Packet::FrameEnd);
        assert_eq!(packets[3], Packet::End);
        assert_eq!(mock.count(":STOP"), 1);
    }
}
