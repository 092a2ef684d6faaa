//! Rigol DS oscilloscope driver for benchlib.
//!
//! This crate drives Rigol DS (and the rebadged Agilent DSO1000) digital
//! oscilloscopes over any benchlib transport. It provides:
//!
//! - **Model definitions** ([`models`]) -- supported models, their series,
//!   command generation and sample buffer sizes.
//! - **Sample conversion** ([`convert`]) -- raw waveform bytes to volts.
//! - **Device configuration** ([`device`]) -- channel, timebase and trigger
//!   settings read from the instrument.
//! - **Acquisition** ([`acquisition`]) -- the polled state machine that
//!   waits for triggers and streams waveform blocks as packets.
//! - **Scope driver** ([`scope`]) and **builder** ([`builder`]).
//!
//! # Command generations
//!
//! | Protocol | Series                     | Readout                          |
//! |----------|----------------------------|----------------------------------|
//! | V1       | VS5000                     | `:WAV:DATA? CHANn`, legacy bytes |
//! | V2       | DS1000E/D                  | `:WAV:DATA? CHANn`, `*OPC?`-less |
//! | V3       | DS2000, DS2000A, DSO1000   | `:WAV:SOUR` + `:WAV:STAT?` polls |
//! | V4       | DS1000Z, DS4000            | `:WAV:SOUR`, per-bit digital     |
//!
//! # Example
//!
//! ```no_run
//! use benchlib_core::Packet;
//! use benchlib_rigol::RigolBuilder;
//!
//! # async fn example() -> benchlib_core::Result<()> {
//! let mut scope = RigolBuilder::new()
//!     .connection("usbtmc//dev/usbtmc0".parse()?)
//!     .frame_limit(10)
//!     .build()
//!     .await?;
//!
//! let mut packets: Vec<Packet> = Vec::new();
//! scope.acquire(&mut packets).await?;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod builder;
pub mod convert;
pub mod device;
pub mod models;
pub mod scope;

pub use acquisition::{AcqChannel, Acquisition, DataSource, WaitEvent};
pub use builder::RigolBuilder;
pub use convert::VerticalScale;
pub use device::{AnalogChannel, DeviceContext};
pub use models::{DataFormat, Protocol, RigolModel, Series, Vendor};
pub use scope::{RigolScope, probe};
