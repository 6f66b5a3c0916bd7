//! TCP Socket Configuration

use std::io::Result;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Keepalive probe interval for accepted tunnel sockets.
pub const CLIENT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Configure socket for accepting client connections
pub fn configure_client_socket(stream: &TcpStream, keepalive: Duration) -> Result<()> {
    let socket = SockRef::from(stream);

    // Disable Nagle's algorithm
    socket.set_nodelay(true)?;

    let ka = TcpKeepalive::new().with_time(keepalive);

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
    let ka = ka.with_interval(keepalive);

    socket.set_tcp_keepalive(&ka)?;

    Ok(())
}

/// Configure a dialed destination socket
pub fn configure_remote_socket(stream: &TcpStream) -> Result<()> {
    SockRef::from(stream).set_nodelay(true)
}

/// Fold IPv4-mapped IPv6 peers back to IPv4 for logging and whitelisting
pub fn normalize_ip(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        _ => addr,
    }
}

/// Socket options for per-port listeners
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Enable SO_REUSEADDR so a re-keyed port can rebind right away
    pub reuse_addr: bool,
    /// Enable SO_REUSEPORT (Linux/BSD). Off: one listener per port.
    pub reuse_port: bool,
    /// Backlog size
    pub backlog: u32,
    /// IPv6 only (disable dual-stack)
    pub ipv6_only: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            reuse_port: false,
            backlog: 1024,
            ipv6_only: false,
        }
    }
}

/// Create a listening socket with the specified options
pub fn create_listener(addr: SocketAddr, options: &ListenOptions) -> Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if options.reuse_addr {
        socket.set_reuse_address(true)?;
    }

    #[cfg(unix)]
    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }

    if addr.is_ipv6() && options.ipv6_only {
        socket.set_only_v6(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(options.backlog as i32)?;

    debug!(addr = %addr, "Created listening socket");

    Ok(socket)
}

/// Bind a tokio listener through `create_listener`.
pub fn bind_listener(addr: SocketAddr, options: &ListenOptions) -> Result<TcpListener> {
    let socket = create_listener(addr, options)?;
    TcpListener::from_std(socket.into())
}
