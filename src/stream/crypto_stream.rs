//! Encrypted stream wrappers
//!
//! `CryptoReader` decrypts in place into the caller's buffer. `CryptoWriter`
//! encrypts into a bounded pending buffer and drains it to the upstream
//! socket; its first bytes on the wire are the plaintext IV it was built with.
//!
//! The keystream position must advance exactly by the number of plaintext
//! bytes that are accepted. The writer therefore never accepts plaintext it
//! cannot hold as ciphertext in `pending`, and when `pending` is full and the
//! upstream is not ready, `poll_write` returns `Pending` without touching the
//! keystream.

use bytes::{Buf, BytesMut};
use std::io::{self, ErrorKind, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::crypto::Keystream;

// ============= Constants =============

/// Default bound for buffered ciphertext.
pub const DEFAULT_MAX_PENDING_WRITE: usize = 64 * 1024;

/// Lower bound so a freshly queued IV never fills the buffer on its own.
const MIN_PENDING_WRITE: usize = 4 * 1024;

fn poisoned_error(slot: &mut Option<io::Error>) -> io::Error {
    slot.take()
        .unwrap_or_else(|| io::Error::other("stream previously poisoned"))
}

// ============= CryptoReader =============

/// Reader that decrypts one direction of a tunnel.
pub struct CryptoReader<R> {
    upstream: R,
    decryptor: Keystream,
    iv: Vec<u8>,
    poisoned: bool,
    poison_error: Option<io::Error>,
}

impl<R> CryptoReader<R> {
    /// `iv` is the peer's IV, already consumed from `upstream`.
    pub fn new(upstream: R, decryptor: Keystream, iv: Vec<u8>) -> Self {
        Self {
            upstream,
            decryptor,
            iv,
            poisoned: false,
            poison_error: None,
        }
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    fn poison(&mut self, error: &io::Error) {
        self.poisoned = true;
        self.poison_error = Some(io::Error::new(error.kind(), error.to_string()));
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CryptoReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let this = self.get_mut();

        if this.poisoned {
            return Poll::Ready(Err(poisoned_error(&mut this.poison_error)));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.upstream).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.poison(&e);
                Poll::Ready(Err(e))
            }
            Poll::Ready(Ok(())) => {
                let after = buf.filled().len();
                if after > before {
                    this.decryptor.apply(&mut buf.filled_mut()[before..after]);
                    trace!(bytes_read = after - before, "CryptoReader decrypted chunk");
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

// ============= CryptoWriter =============

/// Writer that encrypts one direction of a tunnel.
pub struct CryptoWriter<W> {
    upstream: W,
    encryptor: Keystream,
    pending: BytesMut,
    max_pending: usize,
    poisoned: bool,
    poison_error: Option<io::Error>,
}

impl<W> CryptoWriter<W> {
    /// `iv` is queued in front of the first ciphertext bytes.
    pub fn new(upstream: W, encryptor: Keystream, iv: &[u8], max_pending_write: usize) -> Self {
        let max_pending = if max_pending_write == 0 {
            DEFAULT_MAX_PENDING_WRITE
        } else {
            max_pending_write
        };
        let mut pending = BytesMut::with_capacity(16 * 1024);
        pending.extend_from_slice(iv);
        Self {
            upstream,
            encryptor,
            pending,
            max_pending: max_pending.max(MIN_PENDING_WRITE),
            poisoned: false,
            poison_error: None,
        }
    }

    fn poison(&mut self, error: &io::Error) {
        self.poisoned = true;
        self.poison_error = Some(io::Error::new(error.kind(), error.to_string()));
    }
}

impl<W: AsyncWrite + Unpin> CryptoWriter<W> {
    /// Write out as much pending ciphertext as the upstream takes.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        while !self.pending.is_empty() {
            match Pin::new(&mut self.upstream).poll_write(cx, &self.pending) {
                Poll::Pending => {
                    trace!(pending_len = self.pending.len(), "CryptoWriter: upstream Pending");
                    return Poll::Pending;
                }
                Poll::Ready(Err(e)) => {
                    self.poison(&e);
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(Ok(0)) => {
                    let err = io::Error::new(ErrorKind::WriteZero, "upstream returned 0 bytes written");
                    self.poison(&err);
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(Ok(n)) => self.pending.advance(n),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CryptoWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize>> {
        let this = self.get_mut();

        if this.poisoned {
            return Poll::Ready(Err(poisoned_error(&mut this.poison_error)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending if this.pending.len() >= this.max_pending => return Poll::Pending,
            _ => {}
        }

        let room = this.max_pending - this.pending.len();
        let to_accept = buf.len().min(room);
        let start = this.pending.len();
        this.pending.extend_from_slice(&buf[..to_accept]);
        this.encryptor.apply(&mut this.pending[start..]);

        // Errors surface on the next call through the poison slot.
        let _ = this.poll_drain(cx);

        Poll::Ready(Ok(to_accept))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();

        if this.poisoned {
            return Poll::Ready(Err(poisoned_error(&mut this.poison_error)));
        }

        match this.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        Pin::new(&mut this.upstream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();

        if !this.poisoned {
            match this.poll_drain(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    debug!(error = %e, "CryptoWriter: dropping pending ciphertext on shutdown");
                }
                Poll::Ready(Ok(())) => {}
            }
        }

        Pin::new(&mut this.upstream).poll_shutdown(cx)
    }
}
