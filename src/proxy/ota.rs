//! One-time-auth
//!
//! Header digest: `HMAC-SHA1(iv || key, header)[..10]`, sent right after the
//! header. Once a connection is authenticated every client payload chunk is
//! framed as
//!
//! ```text
//! +----------+-----------+----------+
//! | DATA.LEN | HMAC-SHA1 |   DATA   |
//! +----------+-----------+----------+
//! |    2     |    10     | Variable |
//! +----------+-----------+----------+
//! ```
//!
//! with the chunk digest keyed by `iv || chunk_id` (`u32` big-endian,
//! counting from zero).

use std::io::ErrorKind;

use hmac::Mac;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::hash::HmacSha1;
use crate::error::{RelayError, Result};

pub const HMAC_LEN: usize = 10;
const CHUNK_HEADER_LEN: usize = 2 + HMAC_LEN;

fn keyed(key_parts: &[&[u8]]) -> HmacSha1 {
    let key: Vec<u8> = key_parts.concat();
    HmacSha1::new_from_slice(&key).expect("HMAC accepts any key length")
}

/// Check the transmitted header digest in constant time.
pub fn verify_header(iv: &[u8], key: &[u8], header: &[u8], digest: &[u8]) -> Result<()> {
    if digest.len() != HMAC_LEN {
        return Err(RelayError::AuthenticationFailed(format!(
            "digest is {} bytes, expected {HMAC_LEN}",
            digest.len()
        )));
    }
    let mut mac = keyed(&[iv, key]);
    mac.update(header);
    mac.verify_truncated_left(digest)
        .map_err(|_| RelayError::AuthenticationFailed(format!("header of {} bytes", header.len())))
}

/// Reads and verifies authenticated payload chunks.
pub struct OtaChunkReader<R> {
    inner: R,
    iv: Vec<u8>,
    chunk_id: u32,
}

impl<R: AsyncRead + Unpin> OtaChunkReader<R> {
    pub fn new(inner: R, iv: Vec<u8>) -> Self {
        Self { inner, iv, chunk_id: 0 }
    }

    pub fn chunk_id(&self) -> u32 {
        self.chunk_id
    }

    /// Read the next chunk into `buf`, replacing its contents.
    ///
    /// Returns `Ok(false)` on a clean end of stream at a chunk boundary.
    pub async fn next_chunk(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        let mut head = [0u8; CHUNK_HEADER_LEN];
        let first = self.inner.read(&mut head[..1]).await?;
        if first == 0 {
            return Ok(false);
        }
        self.read_exact_or_incomplete(&mut head[1..], "ota chunk header").await?;

        let len = u16::from_be_bytes([head[0], head[1]]) as usize;
        buf.clear();
        buf.resize(len, 0);
        self.read_exact_or_incomplete(buf, "ota chunk data").await?;

        let mut mac = keyed(&[self.iv.as_slice(), &self.chunk_id.to_be_bytes()[..]]);
        mac.update(&buf[..]);
        mac.verify_truncated_left(&head[2..])
            .map_err(|_| RelayError::AuthenticationFailed(format!("chunk {}", self.chunk_id)))?;

        self.chunk_id = self.chunk_id.wrapping_add(1);
        Ok(true)
    }

    async fn read_exact_or_incomplete(&mut self, buf: &mut [u8], what: &'static str) -> Result<()> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(RelayError::IncompleteHeader(what)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
fn truncated(mac: HmacSha1) -> [u8; HMAC_LEN] {
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&full[..HMAC_LEN]);
    out
}

/// Digest a client appends to an authenticated header.
#[cfg(test)]
pub(crate) fn header_digest(iv: &[u8], key: &[u8], header: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = keyed(&[iv, key]);
    mac.update(header);
    truncated(mac)
}

/// Digest for payload chunk number `chunk_id`.
#[cfg(test)]
pub(crate) fn chunk_digest(iv: &[u8], chunk_id: u32, data: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = keyed(&[iv, &chunk_id.to_be_bytes()[..]]);
    mac.update(data);
    truncated(mac)
}

#[cfg(test)]
pub(crate) fn frame_chunk(iv: &[u8], chunk_id: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + data.len());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(&chunk_digest(iv, chunk_id, data));
    out.extend_from_slice(data);
    out
}
