//! Bidirectional Relay

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::proxy::ota::OtaChunkReader;
use crate::stats::UsageMeter;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

// ============= Connection guard =============

/// Shared teardown state for both directions of one connection.
///
/// `close` flips the flag exactly once and wakes the other direction, which
/// then drops its halves. Whichever side finishes first wins, later calls are
/// no-ops.
#[derive(Debug, Default)]
pub struct ConnGuard {
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl ConnGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually closed the connection.
    pub fn close(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.cancel.cancel();
        }
        first
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

// ============= Sources =============

/// Client-to-remote payload source.
pub enum ClientSource<R> {
    Plain(R),
    /// One-time-auth connections carry payload in authenticated chunks.
    Ota(OtaChunkReader<R>),
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    fn record(self, meter: &UsageMeter, port: u16, n: usize) -> Result<()> {
        match self {
            Direction::Upstream => meter.record_upstream(port, n as i64),
            Direction::Downstream => meter.record_downstream(port, n as i64),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Direction::Upstream => "C->S",
            Direction::Downstream => "S->C",
        }
    }
}

/// Byte totals of a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    pub upstream: u64,
    pub downstream: u64,
}

async fn read_some<R>(reader: &mut R, buf: &mut [u8], idle: Option<Duration>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match idle {
        Some(limit) => timeout(limit, reader.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"))?,
        None => reader.read(buf).await,
    }
}

async fn write_through<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}

/// Port the relayed bytes are charged to.
#[derive(Clone)]
pub struct Metering {
    pub meter: Arc<UsageMeter>,
    pub port: u16,
}

impl Metering {
    /// Charge `n` relayed bytes. Unregistered ports end the connection.
    fn charge(&self, dir: Direction, n: usize) -> bool {
        match dir.record(&self.meter, self.port, n) {
            Ok(()) => true,
            Err(e) => {
                error!(port = self.port, dir = dir.label(), error = %e, "Dropping connection");
                false
            }
        }
    }
}

/// Copy until EOF, error, idle timeout or guard closure.
async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    dir: Direction,
    metering: &Metering,
    guard: &ConnGuard,
    idle: Option<Duration>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let step = async {
            let n = read_some(&mut reader, &mut buf, idle).await?;
            if n > 0 {
                write_through(&mut writer, &buf[..n]).await?;
            }
            Ok::<usize, io::Error>(n)
        };

        let result = tokio::select! {
            _ = guard.closed() => break,
            r = step => r,
        };

        match result {
            Ok(0) => {
                debug!(dir = dir.label(), total, "Peer closed connection");
                break;
            }
            Ok(n) => {
                if !metering.charge(dir, n) {
                    break;
                }
                total += n as u64;
                trace!(dir = dir.label(), bytes = n, total, "Relayed");
            }
            Err(e) => {
                debug!(dir = dir.label(), error = %e, total, "Relay stopped");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    total
}

/// Verify and forward authenticated chunks.
async fn pipe_ota<R, W>(
    mut reader: OtaChunkReader<R>,
    mut writer: W,
    metering: &Metering,
    guard: &ConnGuard,
    idle: Option<Duration>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = Vec::with_capacity(RELAY_BUFFER_SIZE);
    let mut total = 0u64;

    loop {
        let step = async {
            let more = match idle {
                Some(limit) => timeout(limit, reader.next_chunk(&mut chunk))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"))??,
                None => reader.next_chunk(&mut chunk).await?,
            };
            if more && !chunk.is_empty() {
                write_through(&mut writer, &chunk).await?;
            }
            Result::Ok(more)
        };

        let result = tokio::select! {
            _ = guard.closed() => break,
            r = step => r,
        };

        match result {
            Ok(false) => {
                debug!(total, chunks = reader.chunk_id(), "Client closed authenticated stream");
                break;
            }
            Ok(true) => {
                if !metering.charge(Direction::Upstream, chunk.len()) {
                    break;
                }
                total += chunk.len() as u64;
            }
            Err(e) if e.is_protocol_error() => {
                warn!(error = %e, total, "Dropping connection on bad chunk");
                break;
            }
            Err(e) => {
                debug!(error = %e, total, "Authenticated relay stopped");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    total
}

/// Relay a connection in both directions.
///
/// Client-to-remote runs in a spawned task, remote-to-client in the caller.
/// The first direction to finish closes the guard, which stops the other.
pub async fn relay_bidirectional<CR, CW, SR, SW>(
    client_reader: ClientSource<CR>,
    client_writer: CW,
    server_reader: SR,
    server_writer: SW,
    metering: Metering,
    guard: Arc<ConnGuard>,
    idle: Option<Duration>,
) -> RelayTotals
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    SR: AsyncRead + Unpin + Send + 'static,
    SW: AsyncWrite + Unpin + Send + 'static,
{
    let metering_c2s = metering.clone();
    let guard_c2s = Arc::clone(&guard);

    let c2s = tokio::spawn(async move {
        let total = match client_reader {
            ClientSource::Plain(reader) => {
                pipe(reader, server_writer, Direction::Upstream, &metering_c2s, &guard_c2s, idle).await
            }
            ClientSource::Ota(reader) => pipe_ota(reader, server_writer, &metering_c2s, &guard_c2s, idle).await,
        };
        guard_c2s.close();
        total
    });

    let downstream = pipe(server_reader, client_writer, Direction::Downstream, &metering, &guard, idle).await;
    guard.close();

    let upstream = match c2s.await {
        Ok(total) => total,
        Err(e) => {
            warn!(error = %e, "C->S task panicked");
            0
        }
    };

    debug!(upstream, downstream, "Relay finished");
    RelayTotals { upstream, downstream }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ota::frame_chunk;
    use tokio::io::duplex;

    const PORT: u16 = 8388;

    fn metering() -> (Metering, Arc<UsageMeter>) {
        let meter = Arc::new(UsageMeter::new());
        meter.add_stat(PORT);
        (Metering { meter: Arc::clone(&meter), port: PORT }, meter)
    }

    #[test]
    fn test_guard_closes_once() {
        let guard = ConnGuard::new();
        assert!(guard.close());
        assert!(!guard.close());
        assert!(!guard.close());
    }

    #[tokio::test]
    async fn test_guard_close_races() {
        let guard = Arc::new(ConnGuard::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                tokio::spawn(async move { guard.close() })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        guard.closed().await;
    }

    #[tokio::test]
    async fn test_relay_meters_both_directions() {
        let (client_app, client_side) = duplex(4096);
        let (server_side, server_app) = duplex(4096);
        let (c_read, c_write) = tokio::io::split(client_side);
        let (s_read, s_write) = tokio::io::split(server_side);

        let (metering, meter) = metering();
        let guard = Arc::new(ConnGuard::new());
        let relay = tokio::spawn(relay_bidirectional(
            ClientSource::Plain(c_read),
            c_write,
            s_read,
            s_write,
            metering,
            Arc::clone(&guard),
            None,
        ));

        let (mut client_app_r, mut client_app_w) = tokio::io::split(client_app);
        let (mut server_app_r, mut server_app_w) = tokio::io::split(server_app);

        client_app_w.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        server_app_r.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        server_app_w.write_all(b"pong!!").await.unwrap();
        let mut got = [0u8; 6];
        client_app_r.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong!!");

        // remote closes: both directions end
        drop(server_app_w);
        drop(server_app_r);

        let totals = relay.await.unwrap();
        assert_eq!(totals, RelayTotals { upstream: 4, downstream: 6 });
        assert!(!guard.close());

        let c = meter.get(PORT).unwrap().snapshot();
        assert_eq!(c.u, 4);
        assert_eq!(c.d, 6);
    }

    #[tokio::test]
    async fn test_ota_relay_forwards_verified_chunks() {
        let iv = vec![0x42u8; 16];
        let (mut client_app, client_side) = duplex(4096);
        let (server_side, mut server_app) = duplex(4096);
        let (c_read, c_write) = tokio::io::split(client_side);
        let (s_read, s_write) = tokio::io::split(server_side);

        let (metering, meter) = metering();
        let relay = tokio::spawn(relay_bidirectional(
            ClientSource::Ota(OtaChunkReader::new(c_read, iv.clone())),
            c_write,
            s_read,
            s_write,
            metering,
            Arc::new(ConnGuard::new()),
            None,
        ));

        client_app.write_all(&frame_chunk(&iv, 0, b"hello ")).await.unwrap();
        client_app.write_all(&frame_chunk(&iv, 1, b"world")).await.unwrap();
        let mut got = [0u8; 11];
        server_app.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello world");

        // replayed chunk id: connection dropped
        client_app.write_all(&frame_chunk(&iv, 1, b"again")).await.unwrap();
        let totals = relay.await.unwrap();
        assert_eq!(totals.upstream, 11);
        assert_eq!(meter.get(PORT).unwrap().snapshot().u, 11);

        let mut rest = Vec::new();
        server_app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_relay() {
        let (_client_app, client_side) = duplex(64);
        let (server_side, _server_app) = duplex(64);
        let (c_read, c_write) = tokio::io::split(client_side);
        let (s_read, s_write) = tokio::io::split(server_side);

        let totals = relay_bidirectional(
            ClientSource::Plain(c_read),
            c_write,
            s_read,
            s_write,
            metering().0,
            Arc::new(ConnGuard::new()),
            Some(Duration::from_millis(50)),
        )
        .await;
        assert_eq!(totals, RelayTotals::default());
    }

    #[tokio::test]
    async fn test_unregistered_port_ends_relay() {
        let (mut client_app, client_side) = duplex(4096);
        let (server_side, mut server_app) = duplex(4096);
        let (c_read, c_write) = tokio::io::split(client_side);
        let (s_read, s_write) = tokio::io::split(server_side);

        let meter = Arc::new(UsageMeter::new());
        let relay = tokio::spawn(relay_bidirectional(
            ClientSource::Plain(c_read),
            c_write,
            s_read,
            s_write,
            Metering { meter: Arc::clone(&meter), port: PORT },
            Arc::new(ConnGuard::new()),
            None,
        ));

        client_app.write_all(b"ping").await.unwrap();
        let totals = relay.await.unwrap();
        assert_eq!(totals, RelayTotals::default());
        assert!(meter.snapshot().is_empty());

        let mut rest = Vec::new();
        server_app.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ping");
    }
}
