use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

use super::defaults::*;

// ============= Log Level =============

/// Logging verbosity level.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// All messages including trace (trace + debug + info + warn + error).
    Debug,
    /// Detailed operational logs (debug + info + warn + error).
    Verbose,
    /// Standard operational logs (info + warn + error).
    #[default]
    Normal,
    /// Only warnings and errors. Startup lines are still printed before the
    /// filter is applied.
    Silent,
}

impl LogLevel {
    /// Convert to tracing EnvFilter directive string.
    pub fn to_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "trace",
            LogLevel::Verbose => "debug",
            LogLevel::Normal => "info",
            LogLevel::Silent => "warn",
        }
    }

    /// Parse from a loose string (CLI argument).
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "verbose" => LogLevel::Verbose,
            "normal" | "info" => LogLevel::Normal,
            "silent" | "quiet" | "error" | "warn" => LogLevel::Silent,
            _ => LogLevel::Normal,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Verbose => write!(f, "verbose"),
            LogLevel::Normal => write!(f, "normal"),
            LogLevel::Silent => write!(f, "silent"),
        }
    }
}

// ============= Tenants =============

/// One serving port: its password and, with a database, the tenant row id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "TenantEntry")]
pub struct Tenant {
    pub password: String,
    pub id: Option<u64>,
}

impl Tenant {
    pub fn new(password: impl Into<String>, id: Option<u64>) -> Self {
        Self { password: password.into(), id }
    }
}

/// `8388 = "secret"` or `8388 = { password = "secret", id = 1 }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum TenantEntry {
    Password(String),
    Full {
        password: String,
        #[serde(default)]
        id: Option<u64>,
    },
}

impl From<TenantEntry> for Tenant {
    fn from(entry: TenantEntry) -> Self {
        match entry {
            TenantEntry::Password(password) => Tenant::new(password, None),
            TenantEntry::Full { password, id } => Tenant::new(password, id),
        }
    }
}

/// TOML keys are strings; ports are parsed here so a typo fails the load.
fn deserialize_tenants<'de, D>(deserializer: D) -> std::result::Result<HashMap<u16, Tenant>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw: HashMap<String, Tenant> = HashMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, tenant)| {
            let port: u16 = key
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("tenant key '{key}' is not a port number")))?;
            Ok((port, tenant))
        })
        .collect()
}

// ============= Sections =============

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Cipher method. A trailing `-auth` is stripped at load and turns
    /// `auth` on.
    #[serde(default = "default_method")]
    pub method: String,

    /// Require one-time-auth on every connection.
    #[serde(default)]
    pub auth: bool,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Name of this server's row in the database.
    #[serde(default)]
    pub server_tag: String,

    /// Address registered for this server. Discovered when absent.
    #[serde(default)]
    pub server_addr: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            auth: false,
            log_level: LogLevel::Normal,
            server_tag: String::new(),
            server_addr: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub status_port: Option<u16>,

    #[serde(default = "default_status_whitelist")]
    pub status_whitelist: Vec<IpNetwork>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            status_port: None,
            status_whitelist: default_status_whitelist(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Deadline in seconds for the IV, header and auth digest.
    #[serde(default = "default_client_read_timeout")]
    pub client_read: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect: u64,

    /// Relay idle limit in seconds, 0 for none.
    #[serde(default)]
    pub relay_idle: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            client_read: default_client_read_timeout(),
            connect: default_connect_timeout(),
            relay_idle: 0,
        }
    }
}

/// Upper bound for `metering.flush_interval_secs`.
pub const MAX_FLUSH_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
pub struct MeteringConfig {
    /// Seconds between flushes, at most `MAX_FLUSH_INTERVAL_SECS`.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Append-only file receiving statements the database rejected.
    #[serde(default = "default_failsafe_log")]
    pub failsafe_log: String,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            failsafe_log: default_failsafe_log(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

// ============= Root =============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub metering: MeteringConfig,

    /// When present the database is the tenant source of truth.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    #[serde(default, deserialize_with = "deserialize_tenants")]
    pub tenants: HashMap<u16, Tenant>,
}
