//! # benchlib -- SCPI bench instrument control
//!
//! `benchlib` is an asynchronous Rust library for driving bench test
//! instruments over SCPI. It reaches instruments over serial ports, raw TCP
//! sockets, the Linux USB-TMC driver, VXI-11 and GPIB, and runs complete
//! oscilloscope acquisitions that stream converted samples as packets.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! benchlib = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Capture one frame from a Rigol DS1104Z on the LAN:
//!
//! ```no_run
//! use benchlib::Packet;
//! use benchlib::rigol::RigolBuilder;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> benchlib::Result<()> {
//!     let mut scope = RigolBuilder::new()
//!         .connection("tcp-raw/192.168.1.20/5555".parse()?)
//!         .analog_channel(1, true)
//!         .build()
//!         .await?;
//!
//!     let mut packets: Vec<Packet> = Vec::new();
//!     scope.acquire(&mut packets).await?;
//!     scope.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                 | Purpose                                          |
//! |-----------------------|--------------------------------------------------|
//! | `benchlib-core`       | [`Transport`] trait, event loop, packets, errors |
//! | `benchlib-transport`  | Serial, TCP, USB-TMC, VXI-11, GPIB transports    |
//! | `benchlib-scpi`       | SCPI engine and IEEE-488.2 block codec           |
//! | `benchlib-rigol`      | Rigol DS driver and acquisition state machine    |
//! | **`benchlib`**        | This facade crate -- re-exports everything       |
//!
//! ## Feature Flags
//!
//! | Feature | Enables                                  | Default |
//! |---------|------------------------------------------|---------|
//! | `rigol` | [`rigol`] module                         | yes     |
//! | `gpib`  | GPIB transport via linux-gpib            | no      |
//! | `full`  | Everything                               | no      |

pub use benchlib_core::*;

/// Links to instruments and connection string parsing.
///
/// [`ConnectionSpec`](transport::ConnectionSpec) turns strings such as
/// `tcp-raw/192.168.1.20/5555`, `usbtmc//dev/usbtmc0`, `vxi/10.0.0.5` or
/// `/dev/ttyUSB0` into an opened [`Transport`].
pub mod transport {
    pub use benchlib_transport::*;
}

/// SCPI request/response engine and block codec.
pub mod scpi {
    pub use benchlib_scpi::*;
}

/// Rigol DS oscilloscope driver.
///
/// Provides [`RigolScope`](rigol::RigolScope) and
/// [`RigolBuilder`](rigol::RigolBuilder). Covers the VS5000, DS1000E/D,
/// DS2000/A, DS1000Z and DS4000 series and the Agilent DSO1000A.
#[cfg(feature = "rigol")]
pub mod rigol {
    pub use benchlib_rigol::*;
}

/// A supported instrument model, as listed by [`supported_instruments`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentDefinition {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub series: &'static str,
    pub analog_channels: usize,
    pub digital_channels: usize,
}

/// Every instrument model supported by the enabled drivers.
///
/// ```
/// for instrument in benchlib::supported_instruments() {
///     println!("{} {} ({})", instrument.manufacturer, instrument.model, instrument.series);
/// }
/// ```
pub fn supported_instruments() -> Vec<InstrumentDefinition> {
    #[allow(unused_mut)]
    let mut instruments = Vec::new();

    #[cfg(feature = "rigol")]
    {
        instruments.extend(rigol::models::all_models().iter().map(|m| InstrumentDefinition {
            manufacturer: m.series.vendor.name(),
            model: m.name,
            series: m.series.name,
            analog_channels: m.analog_channels,
            digital_channels: if m.has_digital {
                rigol::models::NUM_DIGITAL_CHANNELS
            } else {
                0
            },
        }));
    }

    instruments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "rigol")]
    #[test]
    fn rigol_models_are_listed() {
        let instruments = supported_instruments();
        let ds1104z = instruments.iter().find(|i| i.model == "DS1104Z").unwrap();
        assert_eq!(ds1104z.manufacturer, "Rigol");
        assert_eq!(ds1104z.series, "DS1000Z");
        assert_eq!(ds1104z.analog_channels, 4);
        assert_eq!(ds1104z.digital_channels, 0);

        let dso = instruments.iter().find(|i| i.model == "DSO1014A").unwrap();
        assert_eq!(dso.manufacturer, "Agilent");
    }

    #[test]
    fn connection_strings_parse_through_facade() {
        let spec: transport::ConnectionSpec = "tcp-rigol/10.0.0.2/5555".parse().unwrap();
        assert_eq!(spec.to_string(), "tcp-rigol/10.0.0.2/5555");
    }
}
