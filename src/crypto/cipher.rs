//! Stream cipher templates
//!
//! A `CipherTemplate` binds a method to the key derived from one port's
//! password. It holds no running state: every connection builds its own
//! `Keystream` pair from the template and the IVs exchanged on the wire, so
//! concurrent connections never share a keystream position.
//!
//! ## Zeroize policy
//!
//! - `CipherTemplate` stores the raw derived key and zeroizes it on drop.
//! - `Keystream` wraps opaque cipher types whose expanded key schedule
//!   cannot be zeroized from outside.

use std::fmt;
use std::str::FromStr;

use aes::{Aes128, Aes192, Aes256};
use chacha20::{ChaCha20, ChaCha20Legacy};
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use zeroize::Zeroize;

use crate::crypto::hash::evp_bytes_to_key;
use crate::error::{RelayError, Result};

/// Supported stream cipher methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    /// Original ChaCha20 with an 8-byte nonce.
    ChaCha20,
    /// RFC 7539 ChaCha20 with a 12-byte nonce.
    ChaCha20Ietf,
}

impl Method {
    pub fn key_len(self) -> usize {
        match self {
            Method::Aes128Ctr => 16,
            Method::Aes192Ctr => 24,
            Method::Aes256Ctr | Method::ChaCha20 | Method::ChaCha20Ietf => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            Method::Aes128Ctr | Method::Aes192Ctr | Method::Aes256Ctr => 16,
            Method::ChaCha20 => 8,
            Method::ChaCha20Ietf => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::Aes128Ctr => "aes-128-ctr",
            Method::Aes192Ctr => "aes-192-ctr",
            Method::Aes256Ctr => "aes-256-ctr",
            Method::ChaCha20 => "chacha20",
            Method::ChaCha20Ietf => "chacha20-ietf",
        }
    }
}

impl FromStr for Method {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-ctr" => Ok(Method::Aes128Ctr),
            "aes-192-ctr" => Ok(Method::Aes192Ctr),
            "aes-256-ctr" => Ok(Method::Aes256Ctr),
            "chacha20" => Ok(Method::ChaCha20),
            "chacha20-ietf" => Ok(Method::ChaCha20Ietf),
            _ => Err(RelayError::UnsupportedMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Split a trailing `-auth` off a method name.
///
/// Returns the bare method and whether one-time-auth was requested.
pub fn strip_auth_suffix(method: &str) -> (&str, bool) {
    let lower = method.to_ascii_lowercase();
    if lower.ends_with("-auth") {
        (&method[..method.len() - 5], true)
    } else {
        (method, false)
    }
}

// ============= Template =============

/// Method-specific key material for one port password.
#[derive(Clone)]
pub struct CipherTemplate {
    method: Method,
    key: Vec<u8>,
}

impl Drop for CipherTemplate {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for CipherTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherTemplate")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl CipherTemplate {
    pub fn from_method(method: Method, password: &str) -> Self {
        Self {
            method,
            key: evp_bytes_to_key(password.as_bytes(), method.key_len()),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv_len(&self) -> usize {
        self.method.iv_len()
    }

    /// Build a keystream positioned at the start of the stream for `iv`.
    pub fn keystream(&self, iv: &[u8]) -> Result<Keystream> {
        if iv.len() != self.iv_len() {
            return Err(RelayError::InvalidKeyLength { expected: self.iv_len(), got: iv.len() });
        }
        let bad_len = |_| RelayError::InvalidKeyLength { expected: self.method.key_len(), got: self.key.len() };
        Ok(match self.method {
            Method::Aes128Ctr => Keystream::Aes128Ctr(Ctr128BE::new_from_slices(&self.key, iv).map_err(bad_len)?),
            Method::Aes192Ctr => Keystream::Aes192Ctr(Ctr128BE::new_from_slices(&self.key, iv).map_err(bad_len)?),
            Method::Aes256Ctr => Keystream::Aes256Ctr(Ctr128BE::new_from_slices(&self.key, iv).map_err(bad_len)?),
            Method::ChaCha20 => Keystream::ChaCha20(ChaCha20Legacy::new_from_slices(&self.key, iv).map_err(bad_len)?),
            Method::ChaCha20Ietf => Keystream::ChaCha20Ietf(ChaCha20::new_from_slices(&self.key, iv).map_err(bad_len)?),
        })
    }
}

// ============= Keystream =============

/// Running cipher state for one direction of one connection.
///
/// Every supported method is a pure stream cipher, so encryption and
/// decryption are the same operation.
pub enum Keystream {
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
    ChaCha20(ChaCha20Legacy),
    ChaCha20Ietf(ChaCha20),
}

impl Keystream {
    /// Encrypt/decrypt data in-place
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Keystream::Aes128Ctr(c) => c.apply_keystream(data),
            Keystream::Aes192Ctr(c) => c.apply_keystream(data),
            Keystream::Aes256Ctr(c) => c.apply_keystream(data),
            Keystream::ChaCha20(c) => c.apply_keystream(data),
            Keystream::ChaCha20Ietf(c) => c.apply_keystream(data),
        }
    }
}

impl fmt::Debug for Keystream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Keystream::Aes128Ctr(_) => "aes-128-ctr",
            Keystream::Aes192Ctr(_) => "aes-192-ctr",
            Keystream::Aes256Ctr(_) => "aes-256-ctr",
            Keystream::ChaCha20(_) => "chacha20",
            Keystream::ChaCha20Ietf(_) => "chacha20-ietf",
        };
        f.debug_tuple("Keystream").field(&name).finish()
    }
}
