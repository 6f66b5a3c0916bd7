//! MySQL store over an sqlx pool

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tracing::{debug, info, warn};

use super::{Tenant, UsageStore};
use crate::config::DatabaseConfig;
use crate::error::{RelayError, Result};

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(cfg.max_connections)
            .min_connections(cfg.min_connections)
            .connect(&cfg.url)
            .await?;
        info!(
            max = cfg.max_connections,
            min = cfg.min_connections,
            "Database pool ready"
        );
        Ok(Self { pool })
    }
}

#[async_trait]
impl UsageStore for MySqlStore {
    async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_tenants(&self, server_id: u64) -> Result<Option<HashMap<u16, Tenant>>> {
        // Quota activation is best effort, a failure leaves last cycle's flags.
        for sql in [
            "UPDATE ss_user SET active = 1 WHERE u + d < limits AND active = 0",
            "UPDATE ss_user SET active = 0 WHERE u + d >= limits AND active = 1",
        ] {
            if let Err(e) = sqlx::query(sql).execute(&self.pool).await {
                warn!(error = %e, "Quota activation refresh failed");
            }
        }

        sqlx::query(
            "INSERT IGNORE INTO ss_detail (server_id, user_id) SELECT ?, id FROM ss_user WHERE active = 1",
        )
        .bind(server_id)
        .execute(&self.pool)
        .await?;

        let rows = sqlx::query("SELECT id, port, passwd FROM ss_user WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;

        let mut tenants = HashMap::with_capacity(rows.len());
        for row in rows {
            // Signed decode accepts any integer column width.
            let id: i64 = row.try_get("id")?;
            let port: i64 = row.try_get("port")?;
            let password: String = row.try_get("passwd")?;
            let (Ok(id), Ok(port)) = (u64::try_from(id), u16::try_from(port)) else {
                warn!(id, port, "Skipping tenant with out-of-range id or port");
                continue;
            };
            if port == 0 || password.is_empty() {
                debug!(id, port, "Skipping tenant without port or password");
                continue;
            }
            tenants.insert(port, Tenant::new(password, Some(id)));
        }
        debug!(count = tenants.len(), "Active tenants fetched");
        Ok(Some(tenants))
    }

    async fn resolve_server(&self, tag: &str, addr: Option<&str>) -> Result<u64> {
        let existing = sqlx::query("SELECT id FROM ss_server WHERE name = ? LIMIT 1")
            .bind(tag)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = existing {
            let id: i64 = row.try_get("id")?;
            return u64::try_from(id)
                .map_err(|_| RelayError::Store(format!("server '{tag}' has invalid id {id}")));
        }

        let addr = addr.ok_or_else(|| {
            RelayError::Config(format!("server '{tag}' is not registered and no address is known"))
        })?;
        let done = sqlx::query("INSERT INTO ss_server (name, addr) VALUES (?, ?)")
            .bind(tag)
            .bind(addr)
            .execute(&self.pool)
            .await?;
        info!(tag, addr, id = done.last_insert_id(), "Server registered");
        Ok(done.last_insert_id())
    }

    fn pool_size(&self) -> u32 {
        self.pool.size()
    }
}
