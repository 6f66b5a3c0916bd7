//! Per-port listener registry
//!
//! Owns one accept loop per serving port together with the password it was
//! keyed with. Entries hold the loop's `JoinHandle` and a cancellation token,
//! so closing a listener is: take the entry out of the map, cancel, await the
//! task. The map lock is a plain mutex that is never held across an await;
//! a separate async lock serializes whole add/remove/update operations
//! between startup and reload.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::crypto::CipherTemplate;
use crate::error::{RelayError, Result, is_fd_exhaustion};
use crate::proxy::client::{ClientContext, ConnCounter, ServeSettings, handle_client};
use crate::stats::UsageMeter;
use crate::transport::socket::{ListenOptions, bind_listener};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct ListenerEntry {
    password: String,
    auth: bool,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerEntry {
    /// Stop the accept loop and wait until its socket is closed.
    async fn close(self, port: u16) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(port, error = %e, "Accept loop panicked");
        }
    }
}

/// Read-only view of a registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub password: String,
    pub auth: bool,
    pub local_addr: SocketAddr,
}

/// What `update_password` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordUpdate {
    Unchanged,
    Added,
    Restarted,
}

/// State shared with every accept loop.
struct Shared {
    settings: RwLock<Arc<ServeSettings>>,
    meter: Arc<UsageMeter>,
    counter: Arc<ConnCounter>,
}

impl Shared {
    fn settings(&self) -> Arc<ServeSettings> {
        Arc::clone(&*self.settings.read())
    }
}

pub struct ListenerRegistry {
    entries: Mutex<HashMap<u16, ListenerEntry>>,
    ops: tokio::sync::Mutex<()>,
    shared: Arc<Shared>,
    listen_options: ListenOptions,
}

impl ListenerRegistry {
    pub fn new(settings: ServeSettings, meter: Arc<UsageMeter>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ops: tokio::sync::Mutex::new(()),
            shared: Arc::new(Shared {
                settings: RwLock::new(Arc::new(settings)),
                meter,
                counter: Arc::new(ConnCounter::new()),
            }),
            listen_options: ListenOptions::default(),
        }
    }

    pub fn settings(&self) -> Arc<ServeSettings> {
        self.shared.settings()
    }

    /// Settings for connections accepted from now on.
    pub fn set_settings(&self, settings: ServeSettings) {
        *self.shared.settings.write() = Arc::new(settings);
    }

    pub fn connections(&self) -> u64 {
        self.shared.counter.live()
    }

    /// Start serving `port` on an already bound listener.
    ///
    /// Usage counters for the port exist before the first accept.
    pub fn add(&self, port: u16, password: &str, listener: TcpListener, auth: bool) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let mut entries = self.entries.lock();
        if entries.contains_key(&port) {
            return Err(RelayError::Bind {
                port,
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            });
        }

        self.shared.meter.add_stat(port);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            port,
            password.to_string(),
            auth,
            listener,
            Arc::clone(&self.shared),
            shutdown.clone(),
        ));

        entries.insert(
            port,
            ListenerEntry {
                password: password.to_string(),
                auth,
                local_addr,
                shutdown,
                task,
            },
        );
        Ok(())
    }

    pub fn get(&self, port: u16) -> Option<ListenerInfo> {
        self.entries.lock().get(&port).map(|e| ListenerInfo {
            password: e.password.clone(),
            auth: e.auth,
            local_addr: e.local_addr,
        })
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.entries.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the port's listener and forget it. In-flight connections keep
    /// running.
    pub async fn remove(&self, port: u16) -> bool {
        let _ops = self.ops.lock().await;
        self.remove_locked(port).await
    }

    async fn remove_locked(&self, port: u16) -> bool {
        let entry = self.entries.lock().remove(&port);
        match entry {
            Some(entry) => {
                entry.close(port).await;
                info!(port, "Listener closed");
                true
            }
            None => false,
        }
    }

    /// Make `port` serve with `password`, restarting its listener only when
    /// the password or auth mode changed.
    ///
    /// If the new listener cannot be bound, the previous one is put back and
    /// the bind error is returned.
    pub async fn update_password(&self, port: u16, password: &str, auth: bool) -> Result<PasswordUpdate> {
        let _ops = self.ops.lock().await;

        match self.get(port) {
            Some(current) if current.password == password && current.auth == auth => Ok(PasswordUpdate::Unchanged),
            Some(current) => {
                info!(port, "Closing port to update password");
                self.remove_locked(port).await;
                if let Err(e) = self.bind_and_add(port, password, auth) {
                    warn!(port, error = %e, "Restoring previous listener");
                    if let Err(restore) = self.bind_and_add(port, &current.password, current.auth) {
                        warn!(port, error = %restore, "Previous listener could not be restored");
                    }
                    return Err(e);
                }
                Ok(PasswordUpdate::Restarted)
            }
            None => {
                info!(port, "New port added");
                self.bind_and_add(port, password, auth)?;
                Ok(PasswordUpdate::Added)
            }
        }
    }

    /// Replace every listener under new cipher settings.
    ///
    /// The old listeners are closed first, since the new ones usually need
    /// the same addresses. All new sockets are bound before any is put into
    /// service; if one fails, the bound ones are dropped, the old settings
    /// and listeners come back, and the bind error is returned.
    pub async fn rekey(&self, settings: ServeSettings, ports: &[(u16, String)], auth: bool) -> Result<()> {
        let _ops = self.ops.lock().await;

        let previous: Vec<(u16, ListenerEntry)> = self.entries.lock().drain().collect();
        let mut restore = Vec::with_capacity(previous.len());
        for (port, entry) in previous {
            restore.push((port, entry.password.clone(), entry.auth));
            entry.close(port).await;
        }

        let mut staged = Vec::with_capacity(ports.len());
        let mut failure = None;
        for (port, password) in ports {
            let addr = SocketAddr::new(settings.listen_ip, *port);
            match bind_listener(addr, &self.listen_options) {
                Ok(listener) => staged.push((*port, password, listener)),
                Err(source) => {
                    failure = Some(RelayError::Bind { port: *port, source });
                    break;
                }
            }
        }

        if let Some(e) = failure {
            drop(staged);
            warn!(error = %e, "Rekey aborted, restoring previous listeners");
            for (port, password, auth) in restore {
                if let Err(restore_err) = self.bind_and_add(port, &password, auth) {
                    warn!(port, error = %restore_err, "Previous listener could not be restored");
                }
            }
            return Err(e);
        }

        self.set_settings(settings);
        for (port, password, listener) in staged {
            self.add(port, password, listener, auth)?;
        }
        Ok(())
    }

    fn bind_and_add(&self, port: u16, password: &str, auth: bool) -> Result<()> {
        let addr = SocketAddr::new(self.shared.settings().listen_ip, port);
        let listener = bind_listener(addr, &self.listen_options)
            .map_err(|source| RelayError::Bind { port, source })?;
        self.add(port, password, listener, auth)
    }

    /// Close every listener.
    pub async fn shutdown(&self) {
        let _ops = self.ops.lock().await;
        let drained: Vec<(u16, ListenerEntry)> = self.entries.lock().drain().collect();
        for (port, entry) in drained {
            entry.close(port).await;
        }
    }
}

async fn accept_loop(
    port: u16,
    password: String,
    auth: bool,
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(port, addr = %addr, auth, "Server listening");
    }
    // Built on first accept, cloned into every connection.
    let mut template: Option<CipherTemplate> = None;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => r,
        };

        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                if is_fd_exhaustion(&e) {
                    debug!(port, error = %e, "Accept failed: out of descriptors");
                } else {
                    warn!(port, error = %e, "Accept error");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                }
            }
        };

        let settings = shared.settings();
        let template = template
            .get_or_insert_with(|| {
                debug!(port, method = %settings.method, "Creating cipher");
                CipherTemplate::from_method(settings.method, &password)
            })
            .clone();

        let ctx = ClientContext {
            port,
            template,
            auth,
            meter: Arc::clone(&shared.meter),
            settings,
            counter: Arc::clone(&shared.counter),
        };
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, ctx).await {
                trace!(port, error = %e, "Connection ended with error");
            }
        });
    }

    debug!(port, "Accept loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keystream, Method};
    use crate::proxy::header::ATYP_IPV4;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    fn settings() -> ServeSettings {
        ServeSettings {
            method: Method::Aes128Ctr,
            listen_ip: "127.0.0.1".parse().unwrap(),
            client_read: Duration::from_secs(5),
            connect: Duration::from_secs(2),
            relay_idle: None,
        }
    }

    fn registry() -> (ListenerRegistry, Arc<UsageMeter>) {
        let meter = Arc::new(UsageMeter::new());
        (ListenerRegistry::new(settings(), Arc::clone(&meter)), meter)
    }

    async fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    async fn bound() -> (u16, TcpListener) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        (l.local_addr().unwrap().port(), l)
    }

    struct Tunnel {
        r: OwnedReadHalf,
        w: OwnedWriteHalf,
        up: Keystream,
        down: Option<Keystream>,
        template: CipherTemplate,
    }

    impl Tunnel {
        async fn open(port: u16, password: &str, target: SocketAddr) -> Self {
            let template = CipherTemplate::from_method(Method::Aes128Ctr, password);
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let (r, mut w) = stream.into_split();
            let iv = [0x21u8; 16];
            let mut up = template.keystream(&iv).unwrap();

            let SocketAddr::V4(v4) = target else { panic!("ipv4 only") };
            let mut header = vec![ATYP_IPV4];
            header.extend_from_slice(&v4.ip().octets());
            header.extend_from_slice(&v4.port().to_be_bytes());
            up.apply(&mut header);
            w.write_all(&iv).await.unwrap();
            w.write_all(&header).await.unwrap();
            Self { r, w, up, down: None, template }
        }

        async fn echo(&mut self, msg: &[u8]) -> Vec<u8> {
            let mut out = msg.to_vec();
            self.up.apply(&mut out);
            self.w.write_all(&out).await.unwrap();

            if self.down.is_none() {
                let mut iv = [0u8; 16];
                self.r.read_exact(&mut iv).await.unwrap();
                self.down = Some(self.template.keystream(&iv).unwrap());
            }
            let mut back = vec![0u8; msg.len()];
            self.r.read_exact(&mut back).await.unwrap();
            if let Some(down) = self.down.as_mut() {
                down.apply(&mut back);
            }
            back
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_add_registers_counters() {
        let (reg, meter) = registry();
        let (port, listener) = bound().await;
        reg.add(port, "pw", listener, false).unwrap();

        assert!(meter.get(port).is_some());
        let info = reg.get(port).unwrap();
        assert_eq!(info.password, "pw");
        assert_eq!(info.local_addr.port(), port);
        assert_eq!(reg.ports(), vec![port]);
    }

    #[tokio::test]
    async fn test_add_collision_rejected() {
        let (reg, _) = registry();
        let (port, listener) = bound().await;
        reg.add(port, "pw", listener, false).unwrap();

        let (_, other) = bound().await;
        assert!(matches!(reg.add(port, "pw2", other, false), Err(RelayError::Bind { .. })));
        assert_eq!(reg.get(port).unwrap().password, "pw");
    }

    #[tokio::test]
    async fn test_update_password_is_idempotent() {
        let (reg, _) = registry();
        let port = free_port().await;

        assert_eq!(reg.update_password(port, "secret", false).await.unwrap(), PasswordUpdate::Added);
        let before = reg.get(port).unwrap();
        assert_eq!(reg.update_password(port, "secret", false).await.unwrap(), PasswordUpdate::Unchanged);
        assert_eq!(reg.get(port).unwrap(), before);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_update_password_restarts_listener() {
        let (reg, _) = registry();
        let target = echo_server().await;
        let port = free_port().await;

        reg.update_password(port, "old", false).await.unwrap();
        assert_eq!(reg.update_password(port, "new", false).await.unwrap(), PasswordUpdate::Restarted);
        assert_eq!(reg.get(port).unwrap().password, "new");

        let mut tunnel = Tunnel::open(port, "new", target).await;
        assert_eq!(tunnel.echo(b"rekeyed").await, b"rekeyed");
    }

    #[tokio::test]
    async fn test_remove_stops_accepting() {
        let (reg, _) = registry();
        let port = free_port().await;
        reg.update_password(port, "pw", false).await.unwrap();

        assert!(reg.remove(port).await);
        assert!(reg.get(port).is_none());
        assert!(!reg.remove(port).await);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_keeps_inflight_connections() {
        let (reg, meter) = registry();
        let target = echo_server().await;
        let port = free_port().await;
        reg.update_password(port, "pw", false).await.unwrap();

        let mut tunnel = Tunnel::open(port, "pw", target).await;
        assert_eq!(tunnel.echo(b"before").await, b"before");

        reg.remove(port).await;
        assert_eq!(tunnel.echo(b"after").await, b"after");

        // upstream is recorded once the remote write returns
        let stat = meter.get(port).unwrap();
        for _ in 0..50 {
            if stat.snapshot().u == 11 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stat.snapshot().u, 11);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (reg, _) = registry();
        let a = free_port().await;
        let b = free_port().await;
        reg.update_password(a, "x", false).await.unwrap();
        reg.update_password(b, "y", true).await.unwrap();
        assert!(reg.get(b).unwrap().auth);

        reg.shutdown().await;
        assert!(reg.is_empty());
    }
}
