//! Per-port usage metering
//!
//! Every serving port owns one `PortStat`. Relay directions add to it on
//! every byte batch, the flush task drains it by subtracting a snapshot, so
//! increments that land while a flush is running are kept for the next one.

pub mod failsafe;
pub mod flush;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RelayError, Result};

pub use failsafe::FailsafeLog;
pub use flush::UsageFlusher;

/// Overhead units charged per update call, on top of the raw byte count.
pub const EFFECTIVE_STEP: i64 = 534;

// ============= PortStat =============

/// Counter values for one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounters {
    /// Bytes from the client towards the destination.
    pub u: i64,
    /// Bytes from the destination back to the client.
    pub d: i64,
    pub ue: i64,
    pub de: i64,
    /// Unix seconds of the last update.
    pub t: i64,
}

/// Counters for one port behind their own lock.
#[derive(Debug, Default)]
pub struct PortStat {
    counters: Mutex<PortCounters>,
}

impl PortStat {
    pub fn add_upstream(&self, n: i64) {
        if n <= 0 {
            return;
        }
        let mut c = self.counters.lock();
        c.u += n;
        c.ue += EFFECTIVE_STEP;
        c.t = Utc::now().timestamp();
    }

    pub fn add_downstream(&self, n: i64) {
        if n <= 0 {
            return;
        }
        let mut c = self.counters.lock();
        c.d += n;
        c.de += EFFECTIVE_STEP;
        c.t = Utc::now().timestamp();
    }

    pub fn snapshot(&self) -> PortCounters {
        *self.counters.lock()
    }

    /// Snapshot-and-subtract, skipped when nothing went upstream.
    fn drain(&self) -> Option<PortCounters> {
        let mut c = self.counters.lock();
        if c.u == 0 {
            return None;
        }
        let taken = *c;
        c.u -= taken.u;
        c.d -= taken.d;
        c.ue -= taken.ue;
        c.de -= taken.de;
        Some(taken)
    }
}

/// Drained counters of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDelta {
    pub port: u16,
    pub u: i64,
    pub d: i64,
    pub ue: i64,
    pub de: i64,
}

// ============= UsageMeter =============

/// Process-wide port → counters map.
#[derive(Default)]
pub struct UsageMeter {
    ports: DashMap<u16, Arc<PortStat>>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port before it serves. Existing counters are kept.
    pub fn add_stat(&self, port: u16) -> Arc<PortStat> {
        self.ports
            .entry(port)
            .or_insert_with(|| {
                debug!(port, "Usage counters created");
                Arc::new(PortStat::default())
            })
            .clone()
    }

    pub fn get(&self, port: u16) -> Option<Arc<PortStat>> {
        self.ports.get(&port).map(|s| Arc::clone(s.value()))
    }

    pub fn record_upstream(&self, port: u16, n: i64) -> Result<()> {
        self.get(port).ok_or(RelayError::UnknownPort(port))?.add_upstream(n);
        Ok(())
    }

    pub fn record_downstream(&self, port: u16, n: i64) -> Result<()> {
        self.get(port).ok_or(RelayError::UnknownPort(port))?.add_downstream(n);
        Ok(())
    }

    /// Drain every port with a nonzero upstream delta, ordered by port.
    pub fn drain(&self) -> Vec<PortDelta> {
        let stats: Vec<(u16, Arc<PortStat>)> = self
            .ports
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        let mut deltas: Vec<PortDelta> = stats
            .into_iter()
            .filter_map(|(port, stat)| match stat.drain() {
                Some(c) => Some(PortDelta { port, u: c.u, d: c.d, ue: c.ue, de: c.de }),
                None => {
                    let c = stat.snapshot();
                    if c.d != 0 {
                        debug!(port, d = c.d, de = c.de, "No upstream traffic, downstream deferred");
                    }
                    None
                }
            })
            .collect();
        deltas.sort_by_key(|d| d.port);
        deltas
    }

    /// Current counters of every port, ordered by port.
    pub fn snapshot(&self) -> Vec<(u16, PortCounters)> {
        let mut all: Vec<(u16, PortCounters)> = self
            .ports
            .iter()
            .map(|e| (*e.key(), e.value().snapshot()))
            .collect();
        all.sort_by_key(|(port, _)| *port);
        all
    }
}
