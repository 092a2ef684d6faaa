//! benchlib-test-harness: Test utilities and mock transports for benchlib.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the SCPI engine without instrument hardware, [`MockInstrument`] for
//! driving whole acquisitions against a scripted oscilloscope, and
//! [`MockTcpServer`] for testing the TCP transport end to end.

pub mod mock_instrument;
pub mod mock_tcp;
pub mod mock_transport;

pub use mock_instrument::{MockInstrument, ieee_block};
pub use mock_tcp::{MockTcpServer, length_prefixed};
pub use mock_transport::MockTransport;
