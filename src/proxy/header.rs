//! Request header codec
//!
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! The low nibble of ATYP selects the address form, bit 4 requests
//! one-time-auth for this connection.

use std::fmt;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RelayError, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const ATYP_MASK: u8 = 0x0f;
pub const OTA_FLAG: u8 = 0x10;

/// Destination decoded from the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

/// `host:port`, with IPv6 hosts bracketed so the string dials as-is.
impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{ip}]:{port}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// A decoded request header.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub target: TargetAddr,
    /// Exact bytes consumed, ATYP included. This is the OTA digest input.
    pub raw: Vec<u8>,
    /// The client set the one-time-auth bit.
    pub ota: bool,
}

async fn read_part<R>(reader: &mut R, raw: &mut Vec<u8>, len: usize, what: &'static str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let start = raw.len();
    raw.resize(start + len, 0);
    match reader.read_exact(&mut raw[start..]).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(RelayError::IncompleteHeader(what)),
        Err(e) => Err(e.into()),
    }
}

/// Read exactly one request header from a freshly decrypted stream.
///
/// Reads only as many bytes as the header declares, so the relay payload
/// that follows stays in the stream.
pub async fn read_request<R>(reader: &mut R) -> Result<RequestHeader>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(1 + 1 + 255 + 2);
    read_part(reader, &mut raw, 1, "address type").await?;
    let atyp = raw[0];

    let target = match atyp & ATYP_MASK {
        ATYP_IPV4 => {
            read_part(reader, &mut raw, 4 + 2, "ipv4 address").await?;
            let ip = Ipv4Addr::new(raw[1], raw[2], raw[3], raw[4]);
            TargetAddr::Ipv4(ip, u16::from_be_bytes([raw[5], raw[6]]))
        }
        ATYP_IPV6 => {
            read_part(reader, &mut raw, 16 + 2, "ipv6 address").await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[1..17]);
            TargetAddr::Ipv6(Ipv6Addr::from(octets), u16::from_be_bytes([raw[17], raw[18]]))
        }
        ATYP_DOMAIN => {
            read_part(reader, &mut raw, 1, "domain length").await?;
            let len = raw[1] as usize;
            read_part(reader, &mut raw, len + 2, "domain").await?;
            let host = std::str::from_utf8(&raw[2..2 + len])
                .map_err(|_| RelayError::InvalidDomain)?
                .to_string();
            TargetAddr::Domain(host, u16::from_be_bytes([raw[2 + len], raw[3 + len]]))
        }
        _ => return Err(RelayError::UnsupportedAddressType(atyp & ATYP_MASK)),
    };

    Ok(RequestHeader {
        target,
        raw,
        ota: atyp & OTA_FLAG != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn domain_header(host: &str, port: u16) -> Vec<u8> {
        let mut buf = vec![ATYP_DOMAIN, host.len() as u8];
        buf.extend_from_slice(host.as_bytes());
        buf.extend_from_slice(&port.to_be_bytes());
        buf
    }

    #[tokio::test]
    async fn test_domain_localhost() {
        let raw = domain_header("localhost", 80);
        let mut cursor = Cursor::new(raw.clone());
        let header = read_request(&mut cursor).await.unwrap();

        assert_eq!(header.target.to_string(), "localhost:80");
        assert_eq!(header.raw, raw);
        assert!(!header.ota);
    }

    #[tokio::test]
    async fn test_ipv4_and_ipv6() {
        let mut raw = vec![ATYP_IPV4, 10, 0, 0, 1];
        raw.extend_from_slice(&443u16.to_be_bytes());
        let header = read_request(&mut Cursor::new(raw)).await.unwrap();
        assert_eq!(header.target.to_string(), "10.0.0.1:443");

        let mut raw = vec![ATYP_IPV6];
        raw.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        raw.extend_from_slice(&8080u16.to_be_bytes());
        let header = read_request(&mut Cursor::new(raw)).await.unwrap();
        assert_eq!(header.target.to_string(), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_ota_flag_and_payload_left_unread() {
        let mut raw = domain_header("example.com", 443);
        raw[0] |= OTA_FLAG;
        let header_len = raw.len();
        raw.extend_from_slice(b"payload");

        let mut cursor = Cursor::new(raw);
        let header = read_request(&mut cursor).await.unwrap();
        assert!(header.ota);
        assert_eq!(header.target.to_string(), "example.com:443");
        assert_eq!(header.raw.len(), header_len);
        assert_eq!(header.raw[0], ATYP_DOMAIN | OTA_FLAG);
        assert_eq!(cursor.position() as usize, header_len);
    }

    #[tokio::test]
    async fn test_non_utf8_domain_rejected() {
        let mut raw = vec![ATYP_DOMAIN, 4, b'h', 0xff, b's', b't'];
        raw.extend_from_slice(&80u16.to_be_bytes());
        let err = read_request(&mut Cursor::new(raw)).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidDomain));
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_unsupported_address_type() {
        let err = read_request(&mut Cursor::new(vec![0x05, 1, 2, 3])).await.unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedAddressType(5)));
    }

    #[tokio::test]
    async fn test_every_truncation_is_incomplete() {
        let mut ipv4 = vec![ATYP_IPV4, 127, 0, 0, 1];
        ipv4.extend_from_slice(&80u16.to_be_bytes());
        let mut ipv6 = vec![ATYP_IPV6];
        ipv6.extend_from_slice(&[0u8; 16]);
        ipv6.extend_from_slice(&80u16.to_be_bytes());

        for full in [domain_header("localhost", 80), ipv4, ipv6] {
            for cut in 0..full.len() {
                let mut cursor = Cursor::new(full[..cut].to_vec());
                let err = read_request(&mut cursor).await.unwrap_err();
                assert!(
                    matches!(err, RelayError::IncompleteHeader(_)),
                    "prefix {cut} of {full:?} gave {err:?}"
                );
                assert!(cursor.position() as usize <= cut);
            }
        }
    }
}
