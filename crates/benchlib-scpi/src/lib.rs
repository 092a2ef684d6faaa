//! SCPI engine and IEEE-488.2 block codec for benchlib.
//!
//! - [`engine`] -- [`ScpiSession`]: send, receive-with-retry, typed getters,
//!   `*OPC?` and `*IDN?`
//! - [`parse`] -- strict reply parsers
//! - [`block`] -- `#<n><len><bytes>` block headers

pub mod block;
pub mod engine;
pub mod parse;

pub use block::{BlockHeader, BlockHeaderReader, HeaderStatus, encode_block};
pub use engine::{HwInfo, ScpiSession, parse_idn};
pub use parse::PartialParse;
