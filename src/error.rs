//! Error Types

use std::io;
use thiserror::Error;

// ============= Main Relay Errors =============

#[derive(Error, Debug)]
pub enum RelayError {
    // ============= Protocol Errors =============

    #[error("addr type {0} not supported")]
    UnsupportedAddressType(u8),

    #[error("incomplete request header: short read of {0}")]
    IncompleteHeader(&'static str),

    #[error("destination host is not valid UTF-8")]
    InvalidDomain,

    #[error("verify one time auth failed: {0}")]
    AuthenticationFailed(String),

    #[error("request header not received within {0:?}")]
    HeaderTimeout(std::time::Duration),

    // ============= Network Errors =============

    #[error("error connecting to {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("error listening port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // ============= Crypto Errors =============

    #[error("unsupported encryption method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // ============= Metering Errors =============

    #[error("port {0} has no usage counters")]
    UnknownPort(u16),

    #[error("backing store rejected flush: {0}")]
    StoreFlushFailed(String),

    #[error("failsafe log write failed: {0}")]
    FailsafeWriteFailed(#[source] io::Error),

    #[error("backing store error: {0}")]
    Store(String),

    // ============= Config Errors =============

    #[error("Config error: {0}")]
    Config(String),

    #[error("no active tenants: refusing configuration with zero ports")]
    DegenerateConfig,
}

impl RelayError {
    /// Errors raised by a single connection's wire input. They abort that
    /// connection only and are never retried.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedAddressType(_)
                | Self::IncompleteHeader(_)
                | Self::InvalidDomain
                | Self::AuthenticationFailed(_)
                | Self::HeaderTimeout(_)
        )
    }

    /// Dial failed because the process or the system ran out of descriptors.
    pub fn is_resource_exhausted(&self) -> bool {
        match self {
            Self::DialFailed { source, .. } => is_fd_exhaustion(source),
            _ => false,
        }
    }
}

/// EMFILE is the per-process descriptor limit, ENFILE the system-wide one.
pub fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EMFILE || code == libc::ENFILE)
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        RelayError::Store(err.to_string())
    }
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_classified() {
        assert!(RelayError::UnsupportedAddressType(7).is_protocol_error());
        assert!(RelayError::IncompleteHeader("port").is_protocol_error());
        assert!(RelayError::InvalidDomain.is_protocol_error());
        assert!(RelayError::AuthenticationFailed("x".into()).is_protocol_error());
        assert!(!RelayError::DegenerateConfig.is_protocol_error());
    }

    #[test]
    fn test_dial_resource_exhaustion() {
        let err = RelayError::DialFailed {
            addr: "example.com:80".into(),
            source: io::Error::from_raw_os_error(libc::EMFILE),
        };
        assert!(err.is_resource_exhausted());

        let err = RelayError::DialFailed {
            addr: "example.com:80".into(),
            source: io::Error::from_raw_os_error(libc::ENFILE),
        };
        assert!(err.is_resource_exhausted());

        let err = RelayError::DialFailed {
            addr: "example.com:80".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(!err.is_resource_exhausted());
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::UnsupportedAddressType(9);
        assert!(err.to_string().contains("addr type 9"));

        let err = RelayError::DialFailed {
            addr: "1.2.3.4:443".into(),
            source: io::Error::from(io::ErrorKind::TimedOut),
        };
        assert!(err.to_string().contains("1.2.3.4:443"));
    }
}
