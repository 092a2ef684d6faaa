//! Packets emitted by an acquisition onto the session bus.
//!
//! A run always has the shape `Header, (FrameBegin, data*, FrameEnd)*, End`.
//! Data packets are either [`AnalogPacket`]s carrying converted samples for
//! one channel, or [`LogicPacket`]s carrying raw logic-analyzer bytes.

use std::fmt;
use std::time::SystemTime;

/// One unit of data or framing emitted by an acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Start of a run.
    Header(Header),
    /// Start of one frame (all enabled channels captured once).
    FrameBegin,
    /// End of one frame.
    FrameEnd,
    /// Converted samples from an analog channel.
    Analog(AnalogPacket),
    /// Raw samples from the logic analyzer pod.
    Logic(LogicPacket),
    /// End of a run.
    End,
}

/// Run header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
}

impl Header {
    pub fn now() -> Self {
        Header {
            feed_version: 1,
            start_time: SystemTime::now(),
        }
    }
}

/// What an analog sample measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
}

/// Unit an analog sample is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Volt,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Volt => write!(f, "V"),
        }
    }
}

/// A run of converted analog samples from one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogPacket {
    /// Channel name, e.g. `CH1`.
    pub channel: String,
    pub samples: Vec<f32>,
    pub quantity: Quantity,
    pub unit: Unit,
    /// Significant decimal digits implied by the vertical resolution.
    pub digits: i32,
}

/// A run of logic-analyzer samples.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicPacket {
    /// Bytes per sample.
    pub unit_size: usize,
    pub data: Vec<u8>,
}

impl LogicPacket {
    /// Number of whole samples in this packet.
    pub fn num_samples(&self) -> usize {
        if self.unit_size == 0 {
            0
        } else {
            self.data.len() / self.unit_size
        }
    }
}
