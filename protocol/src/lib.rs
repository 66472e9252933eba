//! Netprobe Protocol Library
//!
//! Shared wire formats for the measurement pipeline: structured probe events,
//! InfluxDB line protocol points and the constants both sides agree on.

pub mod constants;
pub mod error;
pub mod events;
pub mod lineprotocol;

pub use constants::*;
pub use error::ProtocolError;
pub use events::ParsedEvent;
pub use lineprotocol::{FieldValue, LineProtocolPoint};
