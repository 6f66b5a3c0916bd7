//! Stream wrappers

pub mod crypto_stream;

pub use crypto_stream::{CryptoReader, CryptoWriter};
