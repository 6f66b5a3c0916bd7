//! Client Handler
//!
//! One accepted tunnel connection, from first byte to teardown:
//!
//! ```text
//! Accepted -> HeaderParsed -> Authenticated? -> Dialing -> Relaying -> Closed
//! ```
//!
//! Everything up to the end of authentication runs under the client read
//! deadline. Any failure before the dial closes the inbound socket only.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::crypto::{CipherTemplate, Method};
use crate::error::{RelayError, Result};
use crate::proxy::header::{RequestHeader, read_request};
use crate::proxy::ota::{HMAC_LEN, OtaChunkReader, verify_header};
use crate::proxy::relay::{ClientSource, ConnGuard, Metering, relay_bidirectional};
use crate::stats::UsageMeter;
use crate::stream::{CryptoReader, CryptoWriter};
use crate::transport::socket::{
    CLIENT_KEEPALIVE, configure_client_socket, configure_remote_socket, normalize_ip,
};

/// Connection milestones are logged every this many connections.
pub const CONN_LOG_STEP: u64 = 100;

// ============= Settings =============

/// Runtime knobs every listener and connection reads.
#[derive(Debug, Clone)]
pub struct ServeSettings {
    pub method: Method,
    pub listen_ip: IpAddr,
    pub client_read: Duration,
    pub connect: Duration,
    /// `None` leaves the bulk relay unbounded.
    pub relay_idle: Option<Duration>,
}

impl ServeSettings {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let listen_ip = config
            .server
            .listen_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("server.listen_addr: {e}")))?;
        Ok(Self {
            method: config.general.method.parse()?,
            listen_ip,
            client_read: Duration::from_secs(config.timeouts.client_read),
            connect: Duration::from_secs(config.timeouts.connect),
            relay_idle: match config.timeouts.relay_idle {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }
}

// ============= Connection counter =============

/// Approximate count of live connections.
///
/// Relaxed atomics only: the count feeds log lines, never decisions.
#[derive(Debug)]
pub struct ConnCounter {
    live: AtomicU64,
    next_log: AtomicU64,
}

impl Default for ConnCounter {
    fn default() -> Self {
        Self {
            live: AtomicU64::new(0),
            next_log: AtomicU64::new(CONN_LOG_STEP),
        }
    }
}

impl ConnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection. Returns the count when it crossed a milestone;
    /// racing callers cannot both win the same milestone.
    pub fn enter(&self) -> Option<u64> {
        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        let next = self.next_log.load(Ordering::Relaxed);
        if live >= next
            && self
                .next_log
                .compare_exchange(next, next + CONN_LOG_STEP, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(live);
        }
        None
    }

    pub fn leave(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn live(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }
}

struct LiveSlot(Arc<ConnCounter>);

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.0.leave();
    }
}

// ============= Handler =============

/// Per-listener state each connection receives a copy of.
#[derive(Clone)]
pub struct ClientContext {
    pub port: u16,
    pub template: CipherTemplate,
    /// Force one-time-auth regardless of the header flag.
    pub auth: bool,
    pub meter: Arc<UsageMeter>,
    pub settings: Arc<ServeSettings>,
    pub counter: Arc<ConnCounter>,
}

/// Outcome of the deadline-bounded opening phase.
struct Opened {
    reader: CryptoReader<OwnedReadHalf>,
    header: RequestHeader,
    ota: bool,
}

async fn read_exact_or_incomplete<R>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RelayError::IncompleteHeader(what)),
        Err(e) => Err(e.into()),
    }
}

async fn open_tunnel(mut read_half: OwnedReadHalf, ctx: &ClientContext) -> Result<Opened> {
    let mut iv = vec![0u8; ctx.template.iv_len()];
    read_exact_or_incomplete(&mut read_half, &mut iv, "iv").await?;

    let keystream = ctx.template.keystream(&iv)?;
    let mut reader = CryptoReader::new(read_half, keystream, iv);
    let header = read_request(&mut reader).await?;

    let ota = header.ota || ctx.auth;
    if ota {
        let mut digest = [0u8; HMAC_LEN];
        read_exact_or_incomplete(&mut reader, &mut digest, "auth digest").await?;
        verify_header(reader.iv(), ctx.template.key(), &header.raw, &digest)?;
    }

    Ok(Opened { reader, header, ota })
}

async fn dial(addr: &str, limit: Duration) -> Result<TcpStream> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(RelayError::DialFailed { addr: addr.to_string(), source }),
        Err(_) => Err(RelayError::DialFailed {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"),
        }),
    }
}

/// Serve one accepted tunnel connection to completion.
pub async fn handle_client(stream: TcpStream, peer: SocketAddr, ctx: ClientContext) -> Result<()> {
    let peer = normalize_ip(peer);
    let _slot = LiveSlot(Arc::clone(&ctx.counter));
    if let Some(live) = ctx.counter.enter() {
        info!(live, "Number of client connections reaches {}", live);
    }

    if let Err(e) = configure_client_socket(&stream, CLIENT_KEEPALIVE) {
        debug!(peer = %peer, error = %e, "Failed to configure client socket");
    }
    debug!(port = ctx.port, peer = %peer, "New connection");

    let (read_half, write_half) = stream.into_split();

    // Phase 1: header and auth (with deadline)
    let opened = match timeout(ctx.settings.client_read, open_tunnel(read_half, &ctx)).await {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => {
            match &e {
                RelayError::IncompleteHeader(_) => debug!(port = ctx.port, peer = %peer, error = %e, "Error getting request"),
                _ => warn!(port = ctx.port, peer = %peer, error = %e, "Rejected request"),
            }
            return Err(e);
        }
        Err(_) => {
            debug!(port = ctx.port, peer = %peer, "Request header timeout");
            return Err(RelayError::HeaderTimeout(ctx.settings.client_read));
        }
    };

    // Phase 2: dial
    let target = opened.header.target.to_string();
    debug!(port = ctx.port, peer = %peer, target = %target, ota = opened.ota, "Connecting");
    let remote = match dial(&target, ctx.settings.connect).await {
        Ok(remote) => remote,
        Err(e) => {
            if e.is_resource_exhausted() {
                debug!(target = %target, error = %e, "Dial failed: out of descriptors");
            } else {
                warn!(target = %target, error = %e, "Dial failed");
            }
            return Err(e);
        }
    };
    if let Err(e) = configure_remote_socket(&remote) {
        debug!(target = %target, error = %e, "Failed to configure remote socket");
    }

    // Phase 3: relay
    let mut server_iv = vec![0u8; ctx.template.iv_len()];
    rand::rng().fill_bytes(&mut server_iv);
    let writer = CryptoWriter::new(write_half, ctx.template.keystream(&server_iv)?, &server_iv, 0);

    let source = if opened.ota {
        let iv = opened.reader.iv().to_vec();
        ClientSource::Ota(OtaChunkReader::new(opened.reader, iv))
    } else {
        ClientSource::Plain(opened.reader)
    };

    let (remote_read, remote_write) = remote.into_split();
    let guard = Arc::new(ConnGuard::new());
    let totals = relay_bidirectional(
        source,
        writer,
        remote_read,
        remote_write,
        Metering { meter: Arc::clone(&ctx.meter), port: ctx.port },
        guard,
        ctx.settings.relay_idle,
    )
    .await;

    debug!(
        port = ctx.port,
        peer = %peer,
        target = %target,
        upstream = totals.upstream,
        downstream = totals.downstream,
        "Closed pipe"
    );
    Ok(())
}
