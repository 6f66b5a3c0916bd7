//! Backing store for tenants and metered usage
//!
//! The relay only needs a handful of operations from the database: run a
//! prepared flush statement, list active tenants, and resolve this server's
//! row. Everything goes through `UsageStore` so metering can be exercised
//! without a live database.

pub mod mysql;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

pub use crate::config::Tenant;
pub use mysql::MySqlStore;

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Execute one literal statement.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Refresh quota activation and return active tenants by port.
    ///
    /// `None` means this store is not a tenant source and the config file's
    /// tenant table stays authoritative.
    async fn fetch_tenants(&self, server_id: u64) -> Result<Option<HashMap<u16, Tenant>>>;

    /// Look up the server row by tag, registering it with `addr` when absent.
    async fn resolve_server(&self, tag: &str, addr: Option<&str>) -> Result<u64>;

    /// Open connections, for the status page.
    fn pool_size(&self) -> u32;
}

/// Store used when no database is configured.
///
/// Flush statements are accepted and dropped, tenants come from the config
/// file.
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl UsageStore for NullStore {
    async fn execute(&self, sql: &str) -> Result<()> {
        tracing::trace!(sql, "No database configured, statement dropped");
        Ok(())
    }

    async fn fetch_tenants(&self, _server_id: u64) -> Result<Option<HashMap<u16, Tenant>>> {
        Ok(None)
    }

    async fn resolve_server(&self, _tag: &str, _addr: Option<&str>) -> Result<u64> {
        Ok(0)
    }

    fn pool_size(&self) -> u32 {
        0
    }
}
