//! Periodic flush of metered usage into the backing store
//!
//! Every interval the meter is drained and turned into two batched updates:
//! one against `ss_user` keyed by port, one against this server's `ss_detail`
//! rows keyed by tenant id. A statement the store rejects goes to the
//! failsafe log verbatim; the drained delta is not put back.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MAX_FLUSH_INTERVAL_SECS, RelayConfig, Tenant};
use crate::error::{RelayError, Result};
use crate::store::UsageStore;

use super::{FailsafeLog, PortDelta, UsageMeter};

const COLUMNS: [&str; 4] = ["u", "d", "ue", "de"];

fn column(delta: &PortDelta, name: &str) -> i64 {
    match name {
        "u" => delta.u,
        "d" => delta.d,
        "ue" => delta.ue,
        _ => delta.de,
    }
}

/// `u = CASE key WHEN k THEN u+x ... END, d = ..., t = now`
fn set_clause(key: &str, rows: &[(u64, &PortDelta)], now: i64) -> String {
    let mut sql = String::new();
    for (i, name) in COLUMNS.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        let _ = write!(sql, "{name} = CASE {key}");
        for (id, delta) in rows {
            let _ = write!(sql, " WHEN {id} THEN {name}+{}", column(delta, name));
        }
        sql.push_str(" END");
    }
    let _ = write!(sql, ", t = {now}");
    sql
}

fn id_list(rows: &[(u64, &PortDelta)]) -> String {
    rows.iter()
        .map(|(id, _)| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Statements for one flush cycle, aggregate table first.
///
/// Ports without a known tenant id are left out of the detail statement,
/// which is skipped when no port has one.
pub fn build_statements(
    deltas: &[PortDelta],
    tenants: &HashMap<u16, Tenant>,
    server_id: u64,
    now: i64,
) -> Vec<String> {
    if deltas.is_empty() {
        return Vec::new();
    }

    let by_port: Vec<(u64, &PortDelta)> = deltas.iter().map(|d| (u64::from(d.port), d)).collect();
    let mut statements = vec![format!(
        "UPDATE ss_user SET {} WHERE port IN ({});",
        set_clause("port", &by_port, now),
        id_list(&by_port)
    )];

    let by_tenant: Vec<(u64, &PortDelta)> = deltas
        .iter()
        .filter_map(|d| match tenants.get(&d.port).and_then(|t| t.id) {
            Some(id) => Some((id, d)),
            None => {
                debug!(port = d.port, "No tenant id, port left out of detail update");
                None
            }
        })
        .collect();
    if !by_tenant.is_empty() {
        statements.push(format!(
            "UPDATE ss_detail SET {} WHERE user_id IN ({}) AND server_id = {server_id};",
            set_clause("user_id", &by_tenant, now),
            id_list(&by_tenant)
        ));
    }

    statements
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub ports: usize,
    pub executed: usize,
    pub failed: usize,
}

pub struct UsageFlusher {
    meter: Arc<UsageMeter>,
    store: Arc<dyn UsageStore>,
    failsafe: FailsafeLog,
    server_id: u64,
    config_rx: watch::Receiver<Arc<RelayConfig>>,
}

impl UsageFlusher {
    pub fn new(
        meter: Arc<UsageMeter>,
        store: Arc<dyn UsageStore>,
        failsafe: FailsafeLog,
        server_id: u64,
        config_rx: watch::Receiver<Arc<RelayConfig>>,
    ) -> Self {
        Self {
            meter,
            store,
            failsafe,
            server_id,
            config_rx,
        }
    }

    /// Drain the meter once and persist it.
    ///
    /// Only a failsafe write failure is returned as an error.
    pub async fn flush(&self) -> Result<FlushReport> {
        let deltas = self.meter.drain();
        if deltas.is_empty() {
            debug!("No new upstream traffic, nothing to save");
            return Ok(FlushReport::default());
        }

        let config = Arc::clone(&*self.config_rx.borrow());
        let statements = build_statements(
            &deltas,
            &config.tenants,
            self.server_id,
            Utc::now().timestamp(),
        );

        let mut report = FlushReport { ports: deltas.len(), ..Default::default() };
        for sql in &statements {
            debug!(sql = %sql, "Saving usage");
            match self.store.execute(sql).await {
                Ok(()) => report.executed += 1,
                Err(e) => {
                    let e = RelayError::StoreFlushFailed(e.to_string());
                    error!(error = %e, path = %self.failsafe.path().display(), "Saving to failsafe log");
                    self.failsafe.append(sql).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Flush on a timer until `shutdown`, then flush one last time.
    ///
    /// The interval follows `metering.flush_interval_secs` across reloads.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut interval_secs = self.interval_secs();
        let mut next_tick = tokio::time::Instant::now() + Duration::from_secs(interval_secs);
        let mut config_open = true;
        info!(interval_secs, "Usage flusher started");

        loop {
            let sleep = tokio::time::sleep_until(next_tick);
            tokio::pin!(sleep);

            tokio::select! {
                _ = &mut sleep => {
                    let report = self.flush().await?;
                    if report.ports > 0 {
                        debug!(ports = report.ports, executed = report.executed, failed = report.failed, "Usage flushed");
                    }
                    next_tick = tokio::time::Instant::now() + Duration::from_secs(interval_secs);
                }
                changed = self.config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        warn!("Config channel closed, flush interval is now fixed");
                        config_open = false;
                        continue;
                    }
                    let new_secs = self.interval_secs();
                    if new_secs != interval_secs {
                        info!(
                            old_interval_secs = interval_secs,
                            new_interval_secs = new_secs,
                            "Flush interval changed"
                        );
                        interval_secs = new_secs;
                        next_tick = tokio::time::Instant::now() + Duration::from_secs(interval_secs);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Stop signal received, dumping usage to database");
        let report = self.flush().await?;
        info!(ports = report.ports, failed = report.failed, "Final usage flush done");
        Ok(())
    }

    fn interval_secs(&self) -> u64 {
        self.config_rx
            .borrow()
            .metering
            .flush_interval_secs
            .clamp(1, MAX_FLUSH_INTERVAL_SECS)
    }
}
