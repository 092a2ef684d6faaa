//! benchlib-core: Core traits, packets, and error definitions for benchlib.
//!
//! This crate defines the instrument-agnostic abstractions that every
//! benchlib transport and driver builds on. Applications depend on these
//! types without pulling in any specific link or instrument driver.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel to an instrument
//! - [`EventLoop`] / [`PollHandler`] -- the host polling loop acquisitions run in
//! - [`Packet`] / [`PacketSink`] -- data emitted by an acquisition
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod packet;
pub mod session;
pub mod transport;

// Re-export key types at crate root for ergonomic `use benchlib_core::*`.
pub use error::{Error, ErrorKind, Result};
pub use packet::{AnalogPacket, Header, LogicPacket, Packet, Quantity, Unit};
pub use session::{Control, EventLoop, PacketSink, PollEvents, PollHandler, PollSource, SourceId};
pub use transport::Transport;
