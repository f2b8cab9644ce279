//! The network module (spec §4.5): process-wide lifecycle coordinator
//! owning the service registry, the loop pool, every listener/connector, and
//! the client-session set.
//!
//! Grounded in `Network/Network_std.go`'s `NetworkModuleStd` (`Run`,
//! `Shutdown`, `Listen`, `ListenSvc`, `Connect`, `ConnectSvc`) and the
//! teacher's own `tokio::main`/shutdown-signal handling in `main.rs`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::addr::parse_service_url;
use crate::connector::{dial_and_serve, ConnectorDescriptor};
use crate::error::{Error, Result};
use crate::handler::HandlerManager;
use crate::listener::{open_listener, spawn_listener_task, ListenerHandle, RawListener};
use crate::loop_::{LoopCommand, LoopHandle, LoopPool};
use crate::registry::{ServiceInfo, ServiceRegistry};
use crate::session::client::ClientSessionState;

/// Process state (spec §4.5): `0=init, 1=running, 2=shutting-down, 3=shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleStatus {
    Init = 0,
    Running = 1,
    ShuttingDown = 2,
    Shutdown = 3,
}

impl ModuleStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ModuleStatus::Running,
            2 => ModuleStatus::ShuttingDown,
            3 => ModuleStatus::Shutdown,
            _ => ModuleStatus::Init,
        }
    }
}

/// State shared between [`NetworkModule`] and every listener/connector/reader
/// task it spawns. Kept separate from `NetworkModule` itself so those tasks
/// can hold an `Arc<ModuleShared>` without holding the module's own handle.
pub(crate) struct ModuleShared {
    pub registry: ServiceRegistry,
    loops: OnceLock<LoopPool>,
    handler_manager: OnceLock<Arc<dyn HandlerManager>>,
    status: AtomicU8,
    accept_counter: AtomicUsize,
    shutdown_notify: Notify,
    shutdown_err: Mutex<Option<String>>,
    pending_listeners: Mutex<Vec<RawListener>>,
    pending_connectors: Mutex<Vec<ConnectorDescriptor>>,
    active_listeners: Mutex<Vec<ListenerHandle>>,
    client_sessions: Mutex<Vec<Arc<ClientSessionState>>>,
    client_readers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Bound address of every opened TCP/UDP service, by key, so a caller
    /// that listened on `:0` can learn the OS-assigned port. Populated the
    /// instant the socket is opened, independent of whether its accept task
    /// is spawned immediately or queued for `run()`.
    listener_addrs: Mutex<HashMap<String, SocketAddr>>,
}

impl ModuleShared {
    fn new() -> Self {
        ModuleShared {
            registry: ServiceRegistry::new(),
            loops: OnceLock::new(),
            handler_manager: OnceLock::new(),
            status: AtomicU8::new(ModuleStatus::Init as u8),
            accept_counter: AtomicUsize::new(0),
            shutdown_notify: Notify::new(),
            shutdown_err: Mutex::new(None),
            pending_listeners: Mutex::new(Vec::new()),
            pending_connectors: Mutex::new(Vec::new()),
            active_listeners: Mutex::new(Vec::new()),
            client_sessions: Mutex::new(Vec::new()),
            client_readers: Mutex::new(Vec::new()),
            listener_addrs: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn status(&self) -> ModuleStatus {
        ModuleStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ModuleStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn handler_manager(&self) -> Arc<dyn HandlerManager> {
        self.handler_manager.get().expect("handler manager not installed before run()").clone()
    }

    /// Round-robin loop selection (spec §4.2: "pick a loop via round-robin on
    /// a monotonically incremented accept counter modulo loop count").
    pub(crate) fn next_loop(&self) -> LoopHandle {
        let pool = self.loops.get().expect("loop pool not allocated before run()");
        let idx = self.accept_counter.fetch_add(1, Ordering::Relaxed);
        pool.get(idx).clone()
    }

    /// Returns the handle for a loop index already assigned to an existing
    /// session (e.g. a known UDP peer), without consuming another round-robin
    /// slot.
    pub(crate) fn loop_by_idx(&self, idx: usize) -> LoopHandle {
        let pool = self.loops.get().expect("loop pool not allocated before run()");
        pool.get(idx).clone()
    }

    pub(crate) fn register_client_session(&self, session: Arc<ClientSessionState>, reader: tokio::task::JoinHandle<()>) {
        self.client_sessions.lock().unwrap().push(session);
        self.client_readers.lock().unwrap().push(reader);
    }

    pub(crate) fn register_listener(&self, handle: ListenerHandle) {
        self.active_listeners.lock().unwrap().push(handle);
    }
}

/// The process-wide network runtime (spec §4.5). Construct one, register
/// services with [`NetworkModule::listen`]/[`NetworkModule::connect`] before
/// or after calling [`NetworkModule::run`], and call
/// [`NetworkModule::shutdown`] to unwind the whole cascade.
pub struct NetworkModule {
    shared: Arc<ModuleShared>,
}

impl Default for NetworkModule {
    fn default() -> Self {
        NetworkModule::new()
    }
}

impl NetworkModule {
    pub fn new() -> Self {
        NetworkModule { shared: Arc::new(ModuleShared::new()) }
    }

    pub fn status(&self) -> ModuleStatus {
        self.shared.status()
    }

    /// Parses `url`, inserts the resulting [`ServiceInfo`] into the registry
    /// under `key`, then opens the listener (spec §4.5 `Listen`).
    pub async fn listen(&self, key: &str, url: &str) -> Result<()> {
        let parsed = parse_service_url(url)?;
        let mut info = ServiceInfo::new(key, parsed.network, parsed.address);
        info.is_server = true;
        info.reuse_port = parsed.opts.reuse_port;
        self.shared.registry.insert(info)?;
        self.listen_svc(key).await
    }

    /// Opens the socket for an already-registered service (spec §4.5
    /// `ListenSvc`). If the module is already running, the accept/receive
    /// task is spawned immediately; otherwise the opened socket waits for
    /// [`NetworkModule::run`] to spawn it.
    pub async fn listen_svc(&self, key: &str) -> Result<()> {
        let info = self.shared.registry.get(key).ok_or_else(|| Error::ServiceNotFound { key: key.to_string() })?;
        let raw = open_listener(&info).await?;
        if let Some(addr) = raw.local_addr() {
            self.shared.listener_addrs.lock().unwrap().insert(key.to_string(), addr);
        }
        if self.shared.status() == ModuleStatus::Running {
            let handle = spawn_listener_task(raw, self.shared.clone());
            self.shared.register_listener(handle);
        } else {
            self.shared.pending_listeners.lock().unwrap().push(raw);
        }
        Ok(())
    }

    /// Parses `url`, inserts the resulting [`ServiceInfo`], then dials it
    /// (spec §4.5 `Connect`).
    pub async fn connect(&self, key: &str, url: &str, timeout: Duration) -> Result<()> {
        let parsed = parse_service_url(url)?;
        let info = ServiceInfo::new(key, parsed.network, parsed.address);
        self.shared.registry.insert(info)?;
        self.connect_svc(key, timeout).await
    }

    /// Dials an already-registered service (spec §4.5 `ConnectSvc`). Analogous
    /// to [`NetworkModule::listen_svc`]: dials immediately if running, else
    /// queues the dial descriptor for [`NetworkModule::run`] to kick off.
    pub async fn connect_svc(&self, key: &str, timeout: Duration) -> Result<()> {
        let info = self.shared.registry.get(key).ok_or_else(|| Error::ServiceNotFound { key: key.to_string() })?;
        let descriptor = ConnectorDescriptor { service_key: key.to_string(), network: info.network, address: info.address, timeout };
        if self.shared.status() == ModuleStatus::Running {
            spawn_connector(descriptor, self.shared.clone());
        } else {
            self.shared.pending_connectors.lock().unwrap().push(descriptor);
        }
        Ok(())
    }

    pub fn is_client_ip_in_range(&self, key: &str, ip: IpAddr) -> bool {
        self.shared.registry.is_client_ip_in_range(key, ip)
    }

    /// The address actually bound for a listening TCP/UDP service — useful
    /// when `listen` was called with port `0` and the caller needs the
    /// OS-assigned port (e.g. to dial it back in a test). `None` for a unix
    /// socket, a service that isn't a listener, or a key that was never
    /// listened on.
    pub fn local_addr(&self, key: &str) -> Option<SocketAddr> {
        self.shared.listener_addrs.lock().unwrap().get(key).copied()
    }

    /// Runs the module to completion (spec §4.5 `Run`): allocates the loop
    /// pool, spawns every pending listener/connector, publishes
    /// `status=Running`, then blocks until [`NetworkModule::shutdown`] is
    /// called, running the full shutdown cascade before returning.
    pub async fn run(&self, handler_manager: Arc<dyn HandlerManager>, num_loops: usize) -> Result<()> {
        self.shared
            .handler_manager
            .set(handler_manager.clone())
            .map_err(|_| Error::Io(std::io::Error::other("run() called twice")))?;

        let (pool, loop_joins) = LoopPool::spawn(num_loops);
        self.shared.loops.set(pool).ok().expect("loop pool set exactly once");

        for raw in self.shared.pending_listeners.lock().unwrap().drain(..).collect::<Vec<_>>() {
            let handle = spawn_listener_task(raw, self.shared.clone());
            self.shared.register_listener(handle);
        }
        for descriptor in self.shared.pending_connectors.lock().unwrap().drain(..).collect::<Vec<_>>() {
            spawn_connector(descriptor, self.shared.clone());
        }

        self.shared.set_status(ModuleStatus::Running);
        info!(loops = self.shared.loops.get().unwrap().len(), "network module running");

        self.shared.shutdown_notify.notified().await;
        self.shared.set_status(ModuleStatus::ShuttingDown);

        // Mirrors the original's two-phase loop shutdown (send errShutdown,
        // close every listener, then send errCloseConns) collapsed into a
        // single join per loop: a loop only finishes its task once it has
        // processed Shutdown *and* drained egress after CloseConns, so both
        // sentinels must be queued before we ever await `loop_joins` below —
        // otherwise every loop blocks in egress waiting for a CloseConns that
        // never arrives.
        let pool = self.shared.loops.get().expect("loop pool allocated in run()");
        for handle in pool.iter() {
            handle.send(LoopCommand::Shutdown);
        }

        for listener in self.shared.active_listeners.lock().unwrap().drain(..).collect::<Vec<_>>() {
            listener.close().await;
        }

        for handle in pool.iter() {
            handle.send(LoopCommand::CloseConns);
        }
        for join in loop_joins {
            let _ = join.await;
        }

        for session in self.shared.client_sessions.lock().unwrap().iter() {
            session.shutdown(false);
        }
        for reader in self.shared.client_readers.lock().unwrap().drain(..).collect::<Vec<_>>() {
            let _ = reader.await;
        }

        self.shared.set_status(ModuleStatus::Shutdown);
        handler_manager.on_shutdown().await;

        if let Some(reason) = self.shared.shutdown_err.lock().unwrap().take() {
            warn!(reason = %reason, "network module shut down with an error reason");
        }
        Ok(())
    }

    /// Signals [`NetworkModule::run`] to begin the shutdown cascade.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown_notify.notify_one();
    }

    /// Like [`NetworkModule::shutdown`], but records `reason` in the
    /// shutdown error slot (spec §4.5 "shutdown condition variable with
    /// error slot") for logging once the cascade completes.
    pub fn shutdown_with_reason(&self, reason: impl Into<String>) {
        *self.shared.shutdown_err.lock().unwrap() = Some(reason.into());
        self.shutdown();
    }
}

fn spawn_connector(descriptor: ConnectorDescriptor, shared: Arc<ModuleShared>) {
    tokio::spawn(async move {
        dial_and_serve(descriptor, shared).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_::LoopPool;

    /// Testable property 6: over K accepts against L loops, each loop
    /// receives ⌊K/L⌋ or ⌈K/L⌉ sessions.
    #[tokio::test(flavor = "multi_thread")]
    async fn round_robin_loop_assignment_is_fair() {
        let shared = ModuleShared::new();
        let (pool, _joins) = LoopPool::spawn(3);
        shared.loops.set(pool).ok().expect("loop pool set exactly once");

        let mut counts = [0usize; 3];
        for _ in 0..10 {
            let handle = shared.next_loop();
            counts[handle.idx()] += 1;
        }

        assert_eq!(counts.iter().sum::<usize>(), 10);
        for count in counts {
            assert!(count == 3 || count == 4, "expected 3 or 4, got {count}");
        }
    }

    #[test]
    fn status_starts_at_init() {
        let module = NetworkModule::new();
        assert!(matches!(module.status(), ModuleStatus::Init));
    }

    #[tokio::test]
    async fn listen_on_unknown_scheme_fails_before_registering() {
        let module = NetworkModule::new();
        let err = module.listen("bad", "quic://127.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
        assert!(!module.shared.registry.contains("bad"));
    }

    #[tokio::test]
    async fn connect_svc_on_missing_service_fails() {
        let module = NetworkModule::new();
        let err = module.connect_svc("missing", Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound { .. }));
    }
}
