//! ssrelay: multi-tenant encrypted relay server

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

mod cli;
mod config;
mod crypto;
mod error;
mod proxy;
mod stats;
mod status;
mod store;
mod stream;
mod transport;
mod util;

use crate::cli::{CliOverrides, Command};
use crate::config::{RelayConfig, ReloadCoordinator, resolve_tenants, spawn_reload_listener};
use crate::error::{RelayError, Result};
use crate::proxy::client::ServeSettings;
use crate::proxy::registry::ListenerRegistry;
use crate::stats::{FailsafeLog, UsageFlusher, UsageMeter};
use crate::store::{MySqlStore, NullStore, UsageStore};

fn parse_cli() -> (String, CliOverrides) {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match cli::parse_args(&args) {
        Ok(Command::Run { config_path, overrides }) => (config_path, overrides),
        Ok(Command::Help) => {
            eprint!("{}", cli::usage());
            std::process::exit(0);
        }
        Ok(Command::Version) => {
            println!("ssrelay {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("[ssrelay] {}", e);
            eprint!("{}", cli::usage());
            std::process::exit(2);
        }
    }
}

fn fatal(context: &str, e: impl std::fmt::Display) -> ! {
    error!("{}: {}", context, e);
    std::process::exit(1);
}

async fn open_store(config: &RelayConfig) -> Result<Arc<dyn UsageStore>> {
    match &config.database {
        Some(db) => {
            let store = MySqlStore::connect(db).await?;
            info!(pool = store.pool_size(), "Database connected");
            Ok(Arc::new(store))
        }
        None => {
            info!("No [database]: tenants come from the config file, usage is not persisted");
            Ok(Arc::new(NullStore))
        }
    }
}

async fn resolve_server_id(config: &RelayConfig, store: &dyn UsageStore) -> Result<u64> {
    if config.database.is_none() {
        return Ok(0);
    }
    let addr = match &config.general.server_addr {
        Some(addr) => Some(addr.clone()),
        None => match util::ip::discover_public_ip().await {
            Ok(ip) => Some(ip.to_string()),
            Err(e) => {
                warn!(error = %e, "Public address unknown");
                None
            }
        },
    };
    let id = store
        .resolve_server(&config.general.server_tag, addr.as_deref())
        .await?;
    info!(server_tag = %config.general.server_tag, server_id = id, "Server identity resolved");
    Ok(id)
}

/// Resolves on SIGTERM or Ctrl-C.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => info!("SIGTERM received"),
                    r = signal::ctrl_c() => {
                        if let Err(e) = r {
                            error!("Signal error: {}", e);
                        }
                    }
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = signal::ctrl_c().await {
        error!("Signal error: {}", e);
    }
}

async fn spawn_flusher(
    config: &RelayConfig,
    meter: &Arc<UsageMeter>,
    store: &Arc<dyn UsageStore>,
    server_id: u64,
    config_rx: watch::Receiver<Arc<RelayConfig>>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    if config.database.is_none() {
        return Ok(tokio::spawn(async move {
            shutdown.cancelled().await;
            Ok(())
        }));
    }
    let failsafe = FailsafeLog::open(&config.metering.failsafe_log).await?;
    let flusher = UsageFlusher::new(Arc::clone(meter), Arc::clone(store), failsafe, server_id, config_rx);
    Ok(tokio::spawn(flusher.run(shutdown)))
}

fn exit_on_flusher_failure(joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => fatal("Usage can no longer be persisted, exiting", e),
        Err(e) => fatal("Usage flusher panicked", e),
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let (config_path, overrides) = parse_cli();

    let mut config = match RelayConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[ssrelay] Error: {}", e);
            std::process::exit(1);
        }
    };
    overrides.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("[ssrelay] Invalid config: {}", e);
        std::process::exit(1);
    }

    let has_rust_log = std::env::var("RUST_LOG").is_ok();
    let (filter_layer, filter_handle) = reload::Layer::new(EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::Layer::default())
        .init();

    info!("ssrelay v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.general.log_level);
    info!(method = %config.general.method, auth = config.general.auth, "Cipher");

    let store = match open_store(&config).await {
        Ok(s) => s,
        Err(e) => fatal("Cannot open database", e),
    };
    let server_id = match resolve_server_id(&config, store.as_ref()).await {
        Ok(id) => id,
        Err(e) => fatal("Cannot resolve server identity", e),
    };
    if let Err(e) = resolve_tenants(&mut config, store.as_ref(), server_id).await {
        fatal("Cannot load tenants", e);
    }
    if config.tenants.is_empty() {
        fatal("Refusing to start", RelayError::DegenerateConfig);
    }

    let settings = match ServeSettings::from_config(&config) {
        Ok(s) => s,
        Err(e) => fatal("Invalid config", e),
    };
    let listen_ip: IpAddr = settings.listen_ip;
    let meter = Arc::new(UsageMeter::new());
    let registry = Arc::new(ListenerRegistry::new(settings, Arc::clone(&meter)));

    let (config_tx, config_rx) = watch::channel(Arc::new(config.clone()));
    let coordinator = Arc::new(ReloadCoordinator::new(
        PathBuf::from(&config_path),
        overrides,
        Arc::clone(&store),
        server_id,
        Arc::clone(&registry),
        config_tx,
    ));

    match coordinator.apply(config.clone()).await {
        Ok(report) if report.failed.is_empty() => info!(ports = registry.len(), "Listeners started"),
        Ok(report) => {
            registry.shutdown().await;
            fatal("Cannot listen on every port", format!("failed ports {:?}", report.failed));
        }
        Err(e) => fatal("Cannot start listeners", e),
    }

    let runtime_filter = if has_rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.general.log_level.to_filter_str())
    };
    if let Err(e) = filter_handle.reload(runtime_filter) {
        warn!("Failed to switch log filter: {}", e);
    }

    // Follow log_level across reloads.
    let mut level_rx = config_rx.clone();
    tokio::spawn(async move {
        let mut current = level_rx.borrow().general.log_level.clone();
        while level_rx.changed().await.is_ok() {
            let level = level_rx.borrow_and_update().general.log_level.clone();
            if has_rust_log || level == current {
                continue;
            }
            current = level;
            if let Err(e) = filter_handle.reload(EnvFilter::new(current.to_filter_str())) {
                error!("config reload: failed to update log filter: {}", e);
            }
        }
    });

    if let Err(e) = spawn_reload_listener(Arc::clone(&coordinator)) {
        warn!("Config reload on SIGHUP unavailable: {}", e);
    }

    let shutdown = CancellationToken::new();

    if let Some(port) = config.server.status_port {
        let addr = SocketAddr::new(listen_ip, port);
        let whitelist = config.server.status_whitelist.clone();
        tokio::spawn(status::serve(
            addr,
            Arc::clone(&meter),
            Arc::clone(&store),
            whitelist,
            shutdown.clone(),
        ));
    }

    let mut flusher_task = match spawn_flusher(
        &config,
        &meter,
        &store,
        server_id,
        config_rx,
        shutdown.clone(),
    )
    .await
    {
        Ok(task) => task,
        Err(e) => fatal("Cannot open failsafe log", e),
    };

    tokio::select! {
        _ = wait_for_shutdown() => info!("Shutting down..."),
        joined = &mut flusher_task => {
            exit_on_flusher_failure(joined);
            fatal("Usage flusher stopped", "unexpected exit");
        }
    }

    registry.shutdown().await;
    debug!(live = registry.connections(), "Listeners closed");
    shutdown.cancel();
    exit_on_flusher_failure(flusher_task.await);

    Ok(())
}
