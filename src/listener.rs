//! Listener (spec §4.2): opens one server socket per service, accepts TCP
//! connections or receives UDP datagrams, and hands each off to a
//! round-robin-selected loop.
//!
//! Grounded in `Network/Listener.go` (socket setup, reuseport, unix-socket
//! cleanup) and `Network/Network_std.go`'s `stdloopAccept`/`stdloopReadUDP`.
//! Reuseport setup itself follows the teacher's own `create_reuseport_udp_socket`
//! cfg(unix)/cfg(not(unix)) split in `main.rs`.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handler::Action;
use crate::loop_::LoopCommand;
use crate::module::ModuleShared;
use crate::registry::ServiceInfo;
use crate::session::tcp::{ConnReadHalf, ConnWriteHalf, TcpSessionState};
use crate::session::udp::UdpSessionState;
use crate::session::{next_session_id, DoneState, Session};

const READ_BUF_SIZE: usize = 16 * 1024;

/// A socket opened by [`open_listener`] but not yet handed to
/// [`spawn_listener_task`]. Kept as a distinct type from [`ListenerHandle`]
/// so a socket can be opened (and its admission/bind errors surfaced to the
/// caller of `listen`/`listen_svc`) before the module decides whether to
/// spawn its task immediately or queue it for `run()`.
pub(crate) enum RawListener {
    Tcp { key: String, listener: TcpListener },
    Unix { key: String, listener: UnixListener, path: String },
    Udp { key: String, socket: Arc<UdpSocket> },
}

impl RawListener {
    /// The address actually bound, once the OS has resolved a `:0` port.
    /// `None` for a unix-domain socket, which has no `SocketAddr`.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            RawListener::Tcp { listener, .. } => listener.local_addr().ok(),
            RawListener::Unix { .. } => None,
            RawListener::Udp { socket, .. } => socket.local_addr().ok(),
        }
    }
}

/// A handle to a running listener task, held by [`crate::module::ModuleShared`]
/// so shutdown can close it and wait for its task to exit.
pub struct ListenerHandle {
    key: String,
    local_addr: Option<SocketAddr>,
    unix_path: Option<String>,
    stop: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    pub fn service_key(&self) -> &str {
        &self.key
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Idempotent from the caller's point of view: signals the task to stop
    /// and waits for it, then removes any unix socket file.
    pub(crate) async fn close(self) {
        self.stop.notify_one();
        let _ = self.join.await;
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Opens the socket for `info` (spec §4.2): binds and listens/subscribes but
/// does not yet spawn the accept/receive task.
pub(crate) async fn open_listener(info: &ServiceInfo) -> Result<RawListener> {
    match info.network.as_str() {
        "tcp" | "tcp4" | "tcp6" => {
            let listener = bind_tcp(info).await?;
            Ok(RawListener::Tcp { key: info.key.clone(), listener })
        }
        "udp" | "udp4" | "udp6" => {
            let socket = bind_udp(info).await?;
            Ok(RawListener::Udp { key: info.key.clone(), socket: Arc::new(socket) })
        }
        "unix" => {
            let _ = std::fs::remove_file(&info.address);
            let listener = UnixListener::bind(&info.address).map_err(Error::Io)?;
            Ok(RawListener::Unix { key: info.key.clone(), listener, path: info.address.clone() })
        }
        other => Err(Error::InvalidAddress {
            url: info.address.clone(),
            reason: format!("unsupported network {other:?}"),
        }),
    }
}

fn parse_socket_addr(info: &ServiceInfo) -> Result<SocketAddr> {
    info.address.parse().map_err(|_| Error::InvalidAddress {
        url: info.address.clone(),
        reason: "not a valid host:port socket address".to_string(),
    })
}

#[cfg(unix)]
async fn bind_tcp(info: &ServiceInfo) -> Result<TcpListener> {
    let addr = parse_socket_addr(info)?;
    if !info.reuse_port {
        return TcpListener::bind(addr).await.map_err(Error::Io);
    }
    let domain = if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let sock = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP)).map_err(Error::Io)?;
    sock.set_reuse_address(true).map_err(Error::Io)?;
    sock.set_reuse_port(true).map_err(Error::Io)?;
    sock.set_nonblocking(true).map_err(Error::Io)?;
    sock.bind(&addr.into()).map_err(Error::Io)?;
    sock.listen(1024).map_err(Error::Io)?;
    TcpListener::from_std(sock.into()).map_err(Error::Io)
}

#[cfg(not(unix))]
async fn bind_tcp(info: &ServiceInfo) -> Result<TcpListener> {
    if info.reuse_port {
        return Err(Error::ReusePortUnavailable { network: info.network.clone() });
    }
    let addr = parse_socket_addr(info)?;
    TcpListener::bind(addr).await.map_err(Error::Io)
}

#[cfg(unix)]
async fn bind_udp(info: &ServiceInfo) -> Result<UdpSocket> {
    let addr = parse_socket_addr(info)?;
    if !info.reuse_port {
        return UdpSocket::bind(addr).await.map_err(Error::Io);
    }
    let domain = if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP)).map_err(Error::Io)?;
    sock.set_reuse_address(true).map_err(Error::Io)?;
    sock.set_reuse_port(true).map_err(Error::Io)?;
    sock.set_nonblocking(true).map_err(Error::Io)?;
    sock.bind(&addr.into()).map_err(Error::Io)?;
    UdpSocket::from_std(sock.into()).map_err(Error::Io)
}

#[cfg(not(unix))]
async fn bind_udp(info: &ServiceInfo) -> Result<UdpSocket> {
    if info.reuse_port {
        return Err(Error::ReusePortUnavailable { network: info.network.clone() });
    }
    let addr = parse_socket_addr(info)?;
    UdpSocket::bind(addr).await.map_err(Error::Io)
}

/// Spawns the accept/receive task for an opened socket (spec §4.2/§4.5: this
/// runs either at `run()` start for a pre-registered listener, or
/// immediately for one opened while the module is already running).
pub(crate) fn spawn_listener_task(raw: RawListener, shared: Arc<ModuleShared>) -> ListenerHandle {
    let stop = Arc::new(Notify::new());
    match raw {
        RawListener::Tcp { key, listener } => {
            let local_addr = listener.local_addr().ok();
            let stop_rx = stop.clone();
            let join = tokio::spawn(accept_loop_tcp(key.clone(), listener, shared, stop_rx));
            ListenerHandle { key, local_addr, unix_path: None, stop, join }
        }
        RawListener::Unix { key, listener, path } => {
            let stop_rx = stop.clone();
            let join = tokio::spawn(accept_loop_unix(key.clone(), listener, shared, stop_rx));
            ListenerHandle { key, local_addr: None, unix_path: Some(path), stop, join }
        }
        RawListener::Udp { key, socket } => {
            let local_addr = socket.local_addr().ok();
            let stop_rx = stop.clone();
            let join = tokio::spawn(recv_loop_udp(key.clone(), socket, shared, stop_rx));
            ListenerHandle { key, local_addr, unix_path: None, stop, join }
        }
    }
}

async fn accept_loop_tcp(key: String, listener: TcpListener, shared: Arc<ModuleShared>, stop: Arc<Notify>) {
    debug!(service = %key, "tcp accept loop started");
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        if !shared.registry.is_client_ip_in_range(&key, remote_addr.ip()) {
                            debug!(service = %key, %remote_addr, "rejected: client ip not in range");
                            continue;
                        }
                        let local_addr = stream.local_addr().ok();
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(service = %key, %err, "set_nodelay failed");
                        }
                        let (read_half, write_half) = stream.into_split();
                        spawn_accepted_session(
                            &key,
                            &shared,
                            ConnReadHalf::Tcp(read_half),
                            ConnWriteHalf::Tcp(write_half),
                            Some(remote_addr),
                            local_addr,
                        ).await;
                    }
                    Err(err) => warn!(service = %key, %err, "tcp accept failed"),
                }
            }
        }
    }
    info!(service = %key, "tcp accept loop stopped");
}

async fn accept_loop_unix(key: String, listener: UnixListener, shared: Arc<ModuleShared>, stop: Arc<Notify>) {
    debug!(service = %key, "unix accept loop started");
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer_addr)) => {
                        // Unix domain peers have no IP; admission control is
                        // IP-based (spec §4.5), so every unix connection is
                        // admitted.
                        let (read_half, write_half) = stream.into_split();
                        spawn_accepted_session(
                            &key,
                            &shared,
                            ConnReadHalf::Unix(read_half),
                            ConnWriteHalf::Unix(write_half),
                            None,
                            None,
                        ).await;
                    }
                    Err(err) => warn!(service = %key, %err, "unix accept failed"),
                }
            }
        }
    }
    info!(service = %key, "unix accept loop stopped");
}

/// Common tail of both accept loops (spec §4.2): allocate a session ID, pick
/// a loop round-robin, construct the session, ask the handler manager for a
/// handler (declining closes the connection outright), deliver the opened
/// event to the chosen loop, and spawn the per-session reader task.
async fn spawn_accepted_session(
    key: &str,
    shared: &Arc<ModuleShared>,
    read_half: ConnReadHalf,
    write_half: ConnWriteHalf,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) {
    let session_id = next_session_id();
    let loop_handle = shared.next_loop();
    let session = Arc::new(TcpSessionState::new(
        session_id,
        key.to_string(),
        loop_handle.idx(),
        write_half,
        remote_addr,
        local_addr,
        loop_handle.clone(),
    ));

    let Some(handler) = shared.handler_manager().create_event_handler(session.clone() as Arc<dyn Session>).await else {
        debug!(service = %key, session_id, "handler manager refused connection");
        return;
    };

    loop_handle.send(LoopCommand::Accept { session: session.clone(), handler: handler.clone() });
    tokio::spawn(reader_task_tcp(session, read_half, loop_handle));
}

/// The per-session reader (spec §4.4/§5): blocks on read, forwards bytes to
/// the owning loop, and exits on a stop request (close/detach) or a read
/// error. On detach it hands its live read half to the session rather than
/// assembling the `DetachedStream` itself: the loop task still has
/// channel-ordered `Inbound` commands for this session in flight (sent by
/// this same reader before it observed the stop request), so only the loop
/// — after draining those into `detach_buffer` — can safely assemble the
/// stream (see `crate::loop_::finish_session`).
async fn reader_task_tcp(session: Arc<TcpSessionState>, mut read_half: ConnReadHalf, loop_handle: crate::loop_::LoopHandle) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let result: io::Result<()> = loop {
        tokio::select! {
            _ = session.close_notify.notified() => break Ok(()),
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => break Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")),
                    Ok(n) => {
                        loop_handle.send(LoopCommand::Inbound {
                            session_id: session.session_id(),
                            bytes: Bytes::copy_from_slice(&buf[..n]),
                        });
                    }
                    Err(err) => break Err(err),
                }
            }
        }
    };

    let session_id = session.session_id();
    match session.done_state() {
        DoneState::Detached => {
            session.store_read_half(read_half).await;
            loop_handle.send(LoopCommand::ReaderStopped { session_id, err: None });
        }
        DoneState::Closed => {
            let _ = session.take_write_half().await;
            loop_handle.send(LoopCommand::ReaderStopped { session_id, err: None });
        }
        DoneState::Attached => {
            let _ = session.take_write_half().await;
            loop_handle.send(LoopCommand::ReaderStopped { session_id, err: result.err() });
        }
    }
}

/// UDP receive loop (spec §4.2): the per-remote-address session map is owned
/// solely by this task, so it needs no lock (spec §5 resource discipline).
async fn recv_loop_udp(key: String, socket: Arc<UdpSocket>, shared: Arc<ModuleShared>, stop: Arc<Notify>) {
    debug!(service = %key, "udp receive loop started");
    let mut sessions: HashMap<SocketAddr, Arc<UdpSessionState>> = HashMap::new();
    let mut handlers: HashMap<SocketAddr, Arc<dyn crate::handler::EventHandler>> = HashMap::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            received = socket.recv_from(&mut buf) => {
                let (n, remote_addr) = match received {
                    Ok(v) => v,
                    Err(err) => { warn!(service = %key, %err, "udp recv failed"); continue; }
                };
                if !shared.registry.is_client_ip_in_range(&key, remote_addr.ip()) {
                    debug!(service = %key, %remote_addr, "rejected: client ip not in range");
                    continue;
                }
                let bytes = Bytes::copy_from_slice(&buf[..n]);

                let (session, handler) = if let (Some(s), Some(h)) = (sessions.get(&remote_addr), handlers.get(&remote_addr)) {
                    (s.clone(), h.clone())
                } else {
                    let session_id = next_session_id();
                    let loop_handle = shared.next_loop();
                    let session = Arc::new(UdpSessionState::new(session_id, key.clone(), loop_handle.idx(), socket.clone(), remote_addr));
                    let Some(handler) = shared.handler_manager().create_event_handler(session.clone() as Arc<dyn Session>).await else {
                        debug!(service = %key, session_id, "handler manager refused udp peer");
                        continue;
                    };
                    sessions.insert(remote_addr, session.clone());
                    handlers.insert(remote_addr, handler.clone());
                    (session, handler)
                };

                let loop_handle = shared.loop_by_idx(session.listener_idx);
                let (reply_tx, reply_rx) = oneshot::channel();
                loop_handle.send(LoopCommand::Udp { handler, bytes, reply: reply_tx });
                if matches!(reply_rx.await, Ok(Action::Close)) {
                    sessions.remove(&remote_addr);
                    handlers.remove(&remote_addr);
                }
            }
        }
    }
    info!(service = %key, "udp receive loop stopped");
}
