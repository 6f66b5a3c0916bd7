//! Reload Coordinator
//!
//! On SIGHUP the config file is parsed again, command-line overrides are
//! re-applied and, with a database, the tenant table is refreshed from it.
//! The result is diffed against the running listeners:
//!
//! - a desired port is started, kept, or restarted when its password changed;
//! - a running port absent from the new set is closed;
//! - a new method, auth mode or listen address restarts every port, since
//!   cipher templates are built once per listener.
//!
//! A set with no tenants is rejected before anything is touched. The new
//! config is published on the watch channel only after the diff completes.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cli::CliOverrides;
use crate::error::{RelayError, Result};
use crate::proxy::client::ServeSettings;
use crate::proxy::registry::{ListenerRegistry, PasswordUpdate};
use crate::store::UsageStore;

use super::types::RelayConfig;

/// Replace the file's tenants with the store's when the store is the source
/// of truth.
pub async fn resolve_tenants(
    config: &mut RelayConfig,
    store: &dyn UsageStore,
    server_id: u64,
) -> Result<()> {
    if let Some(tenants) = store.fetch_tenants(server_id).await? {
        config.tenants = tenants;
    }
    Ok(())
}

/// Outcome of one reload pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub added: Vec<u16>,
    pub restarted: Vec<u16>,
    pub removed: Vec<u16>,
    pub failed: Vec<u16>,
    pub unchanged: usize,
    /// Every listener was restarted for new cipher settings.
    pub rekeyed: bool,
}

pub struct ReloadCoordinator {
    config_path: PathBuf,
    overrides: CliOverrides,
    store: Arc<dyn UsageStore>,
    server_id: u64,
    registry: Arc<ListenerRegistry>,
    config_tx: watch::Sender<Arc<RelayConfig>>,
}

impl ReloadCoordinator {
    pub fn new(
        config_path: PathBuf,
        overrides: CliOverrides,
        store: Arc<dyn UsageStore>,
        server_id: u64,
        registry: Arc<ListenerRegistry>,
        config_tx: watch::Sender<Arc<RelayConfig>>,
    ) -> Self {
        Self {
            config_path,
            overrides,
            store,
            server_id,
            registry,
            config_tx,
        }
    }

    pub fn current(&self) -> Arc<RelayConfig> {
        Arc::clone(&*self.config_tx.borrow())
    }

    /// Build the desired config: file, then flags, then store tenants.
    pub async fn load_desired(&self) -> Result<RelayConfig> {
        let mut config = RelayConfig::load(&self.config_path)?;
        self.overrides.apply(&mut config);
        config.validate()?;
        resolve_tenants(&mut config, self.store.as_ref(), self.server_id).await?;
        Ok(config)
    }

    pub async fn reload(&self) -> Result<ReloadReport> {
        let desired = self.load_desired().await?;
        self.apply(desired).await
    }

    /// Drive the registry to `desired` and publish it.
    ///
    /// Nothing is published when no desired port ends up serving, or when a
    /// rekey cannot bind every port; the running listeners are kept then.
    pub async fn apply(&self, desired: RelayConfig) -> Result<ReloadReport> {
        if desired.tenants.is_empty() {
            return Err(RelayError::DegenerateConfig);
        }

        let settings = ServeSettings::from_config(&desired)?;
        let running = self.registry.settings();
        let previous = self.current();
        let before = self.registry.ports();
        let rekey = !self.registry.is_empty()
            && (settings.method != running.method
                || settings.listen_ip != running.listen_ip
                || desired.general.auth != previous.general.auth);

        let mut ports: Vec<(u16, String)> = desired
            .tenants
            .iter()
            .map(|(port, tenant)| (*port, tenant.password.clone()))
            .collect();
        ports.sort_unstable_by_key(|(port, _)| *port);

        let mut report = ReloadReport { rekeyed: rekey, ..Default::default() };

        if rekey {
            info!(method = %desired.general.method, auth = desired.general.auth, "Cipher settings changed, restarting all listeners");
            self.registry.rekey(settings, &ports, desired.general.auth).await?;
            report.added = ports.iter().map(|(port, _)| *port).collect();
            report.removed = before
                .into_iter()
                .filter(|port| !desired.tenants.contains_key(port))
                .collect();
        } else {
            let mut first_error = None;
            for (port, password) in &ports {
                match self
                    .registry
                    .update_password(*port, password, desired.general.auth)
                    .await
                {
                    Ok(PasswordUpdate::Added) => report.added.push(*port),
                    Ok(PasswordUpdate::Restarted) => report.restarted.push(*port),
                    Ok(PasswordUpdate::Unchanged) => report.unchanged += 1,
                    Err(e) => {
                        match self.registry.get(*port) {
                            Some(kept) => warn!(port, addr = %kept.local_addr, auth = kept.auth, error = %e, "Password not updated, previous listener kept"),
                            None => warn!(port, error = %e, "Failed to start listener"),
                        }
                        report.failed.push(*port);
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }

            if !ports.iter().any(|(port, _)| self.registry.get(*port).is_some()) {
                return Err(first_error.unwrap_or(RelayError::DegenerateConfig));
            }
            self.registry.set_settings(settings);

            for port in before {
                if !desired.tenants.contains_key(&port) {
                    info!(port, "Closing port");
                    self.registry.remove(port).await;
                    report.removed.push(port);
                }
            }
        }

        self.config_tx.send_replace(Arc::new(desired));
        Ok(report)
    }
}

fn log_report(report: &ReloadReport) {
    info!(
        added = report.added.len(),
        restarted = report.restarted.len(),
        removed = report.removed.len(),
        unchanged = report.unchanged,
        failed = report.failed.len(),
        rekeyed = report.rekeyed,
        "Config reloaded"
    );
}

/// Run a reload on every SIGHUP.
#[cfg(unix)]
pub fn spawn_reload_listener(coordinator: Arc<ReloadCoordinator>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading config");
            match coordinator.reload().await {
                Ok(report) => log_report(&report),
                Err(RelayError::DegenerateConfig) => {
                    error!("Reload rejected: no active tenants, keeping current listeners");
                }
                Err(e) => error!(error = %e, "Reload failed, keeping current listeners"),
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_reload_listener(_coordinator: Arc<ReloadCoordinator>) -> Result<JoinHandle<()>> {
    warn!("Reload signal is not supported on this platform");
    Ok(tokio::spawn(async {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Method;
    use crate::stats::UsageMeter;
    use crate::store::NullStore;
    use crate::config::Tenant;
    use crate::store::testing::RecordingStore;
    use tokio::net::{TcpListener, TcpStream};

    async fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    fn config(tenants: &[(u16, &str)]) -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.server.listen_addr = "127.0.0.1".into();
        cfg.tenants = tenants.iter().map(|(p, pw)| (*p, Tenant::new(*pw, None))).collect();
        cfg
    }

    fn coordinator(store: Arc<dyn UsageStore>, path: PathBuf) -> (ReloadCoordinator, Arc<ListenerRegistry>) {
        let initial = config(&[]);
        let settings = ServeSettings::from_config(&initial).unwrap();
        let registry = Arc::new(ListenerRegistry::new(settings, Arc::new(UsageMeter::new())));
        let (tx, _rx) = watch::channel(Arc::new(initial));
        (
            ReloadCoordinator::new(path, CliOverrides::default(), store, 7, Arc::clone(&registry), tx),
            registry,
        )
    }

    #[tokio::test]
    async fn zero_tenants_rejected_without_changes() {
        let (coord, registry) = coordinator(Arc::new(NullStore), PathBuf::from("unused.toml"));
        let a = free_port().await;
        coord.apply(config(&[(a, "pw")])).await.unwrap();

        let err = coord.apply(config(&[])).await.unwrap_err();
        assert!(matches!(err, RelayError::DegenerateConfig));
        assert_eq!(registry.ports(), vec![a]);
        assert!(coord.current().tenants.contains_key(&a));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn diff_adds_restarts_and_removes() {
        let (coord, registry) = coordinator(Arc::new(NullStore), PathBuf::from("unused.toml"));
        let (a, b, c) = (free_port().await, free_port().await, free_port().await);

        let report = coord.apply(config(&[(a, "one"), (b, "two")])).await.unwrap();
        let mut added = report.added.clone();
        added.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(added, expected);
        assert!(!report.rekeyed);

        let report = coord.apply(config(&[(a, "one"), (b, "deux"), (c, "three")])).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.restarted, vec![b]);
        assert_eq!(report.added, vec![c]);
        assert!(report.removed.is_empty());
        assert_eq!(registry.get(b).unwrap().password, "deux");

        let report = coord.apply(config(&[(a, "one")])).await.unwrap();
        let mut removed = report.removed.clone();
        removed.sort_unstable();
        let mut expected = vec![b, c];
        expected.sort_unstable();
        assert_eq!(removed, expected);
        assert_eq!(registry.ports(), vec![a]);
        assert!(registry.get(c).is_none());
        assert_eq!(coord.current().tenants.len(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn method_change_restarts_every_listener() {
        let (coord, registry) = coordinator(Arc::new(NullStore), PathBuf::from("unused.toml"));
        let a = free_port().await;
        coord.apply(config(&[(a, "pw")])).await.unwrap();

        let mut next = config(&[(a, "pw")]);
        next.general.method = "chacha20-ietf".into();
        let report = coord.apply(next).await.unwrap();
        assert!(report.rekeyed);
        assert_eq!(report.added, vec![a]);
        assert_eq!(registry.settings().method, Method::ChaCha20Ietf);
        assert_eq!(registry.ports(), vec![a]);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn store_tenants_win_over_file() {
        let a = free_port().await;
        let b = free_port().await;
        let path = std::env::temp_dir().join(format!("ssrelay_reload_{}_{a}.toml", std::process::id()));
        std::fs::write(
            &path,
            format!("[server]\nlisten_addr = \"127.0.0.1\"\n[tenants]\n{a} = \"from-file\"\n"),
        )
        .unwrap();

        let store = Arc::new(RecordingStore::default());
        let (coord, registry) = coordinator(store.clone(), path.clone());

        let desired = coord.load_desired().await.unwrap();
        assert_eq!(desired.tenants[&a].password, "from-file");

        store.set_tenants(&[(b, "from-db", 3)]);
        let report = coord.reload().await.unwrap();
        assert_eq!(report.added, vec![b]);
        assert_eq!(registry.get(b).unwrap().password, "from-db");
        assert!(registry.get(a).is_none());
        assert_eq!(coord.current().tenants[&b].id, Some(3));

        registry.shutdown().await;
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn unbindable_listen_addr_keeps_running_listeners() {
        let (coord, registry) = coordinator(Arc::new(NullStore), PathBuf::from("unused.toml"));
        let a = free_port().await;
        coord.apply(config(&[(a, "pw")])).await.unwrap();

        let mut next = config(&[(a, "pw")]);
        next.server.listen_addr = "203.0.113.77".into();
        let err = coord.apply(next).await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { port, .. } if port == a));

        assert_eq!(registry.ports(), vec![a]);
        assert_eq!(registry.settings().listen_ip.to_string(), "127.0.0.1");
        assert_eq!(coord.current().server.listen_addr, "127.0.0.1");
        assert!(TcpStream::connect(("127.0.0.1", a)).await.is_ok());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn nothing_bindable_is_rejected_without_changes() {
        let (coord, registry) = coordinator(Arc::new(NullStore), PathBuf::from("unused.toml"));
        let a = free_port().await;
        coord.apply(config(&[(a, "pw")])).await.unwrap();

        // held by someone else
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = taken.local_addr().unwrap().port();

        let err = coord.apply(config(&[(b, "pw")])).await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { port, .. } if port == b));
        assert_eq!(registry.ports(), vec![a]);
        assert!(coord.current().tenants.contains_key(&a));

        let report = coord.apply(config(&[(a, "pw"), (b, "pw")])).await.unwrap();
        assert_eq!(report.failed, vec![b]);
        assert_eq!(report.unchanged, 1);

        registry.shutdown().await;
    }
}
