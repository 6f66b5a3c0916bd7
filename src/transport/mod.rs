//! Transport layer: listener sockets and client socket tuning

pub mod socket;
