//! Relay engine: header decoding, one-time-auth, per-port listeners

pub mod client;
pub mod header;
pub mod ota;
pub mod registry;
pub mod relay;
