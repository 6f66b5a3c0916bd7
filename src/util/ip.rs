//! Public address discovery for server registration

use std::net::{IpAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

const IP_SERVICE_URLS: &[&str] = &[
    "http://v4.ident.me/",
    "http://ipv4.icanhazip.com/",
    "http://api.ipify.org/",
];

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Address of the interface that routes to `target`. No packet is sent.
fn routed_local_ip(target: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback() || ipv6.is_unspecified() || (ipv6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Parse a plain-text IP service response.
pub fn parse_ip_response(body: &str) -> Option<IpAddr> {
    body.trim().parse().ok()
}

async fn fetch_ip(client: &reqwest::Client, url: &str) -> Option<IpAddr> {
    let response = client.get(url).send().await.ok()?;
    let text = response.text().await.ok()?;
    parse_ip_response(&text)
}

/// Public IPv4 of this host.
///
/// A public routed interface address is used as is; behind NAT the external
/// services are asked in order.
pub async fn discover_public_ip() -> Result<IpAddr> {
    if let Some(ip) = routed_local_ip("8.8.8.8:80")
        && !is_private_ip(ip)
    {
        debug!(ip = %ip, "Using routed interface address");
        return Ok(ip);
    }

    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| RelayError::Config(format!("HTTP client: {e}")))?;

    for url in IP_SERVICE_URLS {
        match fetch_ip(&client, url).await {
            Some(ip) if ip.is_ipv4() => {
                debug!(ip = %ip, url, "Detected public address");
                return Ok(ip);
            }
            _ => debug!(url, "IP service gave no usable answer"),
        }
    }

    warn!("Failed to detect public IP address");
    Err(RelayError::Config(
        "cannot discover public address, set general.server_addr".to_string(),
    ))
}
