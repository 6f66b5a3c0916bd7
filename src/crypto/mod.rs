//! Crypto

pub mod cipher;
pub mod hash;

pub use cipher::{CipherTemplate, Keystream, Method, strip_auth_suffix};
