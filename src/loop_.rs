//! The event loop: a single-threaded cooperative dispatcher serializing every
//! event for the TCP sessions it owns (spec §4.4).
//!
//! Each loop is one `tokio` task pulling from its own unbounded `mpsc`
//! channel. Because a task only ever has one `recv().await` outstanding and
//! fully awaits each command's handler call before pulling the next, events
//! on a given loop are strictly serialized — the same guarantee the original
//! gave with one OS thread per loop, without needing one.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::handler::{Action, EventHandler};
use crate::session::tcp::{build_detached_stream, TcpSessionState};
use crate::session::{normalize_eof, DoneState};

/// One entry in a loop's connection table: the session plus the handler
/// created for it (kept loop-side, not on the session, so the session type
/// itself stays free of a reference cycle back to its handler).
struct Conn {
    session: Arc<TcpSessionState>,
    handler: Arc<dyn EventHandler>,
}

pub enum LoopCommand {
    /// Shutdown sentinel: stop reading new events; triggers egress.
    Shutdown,
    /// Close-conns sentinel: only meaningful during egress.
    CloseConns,
    /// A freshly accepted TCP session, not yet in this loop's connection set.
    Accept { session: Arc<TcpSessionState>, handler: Arc<dyn EventHandler> },
    /// Bytes read for a session already in this loop's connection set.
    Inbound { session_id: u64, bytes: Bytes },
    /// The reader for `session_id` observed a stop request or an I/O error
    /// and is exiting.
    ReaderStopped { session_id: u64, err: Option<io::Error> },
    /// An out-of-band wake request (spec §6 `Wake`).
    Wake { session_id: u64 },
    /// One UDP datagram, dispatched round-robin just like a TCP accept. The
    /// listener's own `remote_addr -> session` map keeps the session alive;
    /// the loop only needs the handler to deliver to. `reply` carries the
    /// returned action back to the listener, which owns that map and is the
    /// only place that can act on a `Close` (there is no per-UDP-session
    /// reader to stop).
    Udp { handler: Arc<dyn EventHandler>, bytes: Bytes, reply: oneshot::Sender<Action> },
}

/// A cheap, cloneable handle to a running loop's command channel.
#[derive(Clone)]
pub struct LoopHandle {
    idx: usize,
    tx: mpsc::UnboundedSender<LoopCommand>,
}

impl LoopHandle {
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn send(&self, cmd: LoopCommand) {
        // An unbounded send only fails once the loop task has exited, which
        // only happens after the full shutdown cascade; a late send from a
        // racing reader task is expected and harmless to drop.
        let _ = self.tx.send(cmd);
    }

    pub fn wake(&self, session_id: u64) {
        self.send(LoopCommand::Wake { session_id });
    }
}

/// A pool of `n` loops, created once by [`crate::module::NetworkModule::run`]
/// and round-robin-assigned to every accepted TCP session and every UDP
/// datagram.
pub struct LoopPool {
    handles: Vec<LoopHandle>,
}

impl LoopPool {
    /// Spawns `n` loop tasks (or `num_cpus::get()` if `n == 0`) and returns a
    /// pool of handles plus the join handles for shutdown-time awaiting.
    pub fn spawn(n: usize) -> (LoopPool, Vec<tokio::task::JoinHandle<()>>) {
        let n = if n == 0 { num_cpus::get().max(1) } else { n };
        let mut handles = Vec::with_capacity(n);
        let mut joins = Vec::with_capacity(n);
        for idx in 0..n {
            let (tx, rx) = mpsc::unbounded_channel();
            handles.push(LoopHandle { idx, tx });
            joins.push(tokio::spawn(run_loop(idx, rx)));
        }
        (LoopPool { handles }, joins)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, idx: usize) -> &LoopHandle {
        &self.handles[idx % self.handles.len()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoopHandle> {
        self.handles.iter()
    }
}

async fn run_loop(idx: usize, mut rx: mpsc::UnboundedReceiver<LoopCommand>) {
    debug!(loop_idx = idx, "event loop started");
    let mut conns: HashMap<u64, Conn> = HashMap::new();

    loop {
        let Some(cmd) = rx.recv().await else {
            // Channel closed with no explicit shutdown sentinel (e.g. every
            // `LoopHandle` clone dropped): fall through to egress so any
            // remaining sessions still get a terminal callback.
            break;
        };
        match cmd {
            LoopCommand::Shutdown => break,
            LoopCommand::CloseConns => {
                // Only meaningful once we're already draining egress.
            }
            LoopCommand::Accept { session, handler } => {
                handle_accept(&mut conns, session, handler).await;
            }
            LoopCommand::Inbound { session_id, bytes } => {
                handle_inbound(&mut conns, session_id, Some(bytes)).await;
            }
            LoopCommand::Wake { session_id } => {
                handle_inbound(&mut conns, session_id, None).await;
            }
            LoopCommand::ReaderStopped { session_id, err } => {
                handle_reader_stopped(&mut conns, session_id, err).await;
            }
            LoopCommand::Udp { handler, bytes, reply } => {
                let action = handler.on_recv_msg(Some(&bytes)).await;
                let _ = reply.send(action);
            }
        }
    }

    egress(idx, rx, conns).await;
}

async fn handle_accept(conns: &mut HashMap<u64, Conn>, session: Arc<TcpSessionState>, handler: Arc<dyn EventHandler>) {
    let session_id = session.session_id();
    let (opts, action) = handler.on_opened().await;
    if let Some(period) = opts.tcp_keep_alive {
        session.apply_keep_alive(period).await;
    }
    conns.insert(session_id, Conn { session: session.clone(), handler });
    apply_action(conns, session_id, action).await;
}

async fn handle_inbound(conns: &mut HashMap<u64, Conn>, session_id: u64, bytes: Option<Bytes>) {
    let Some(conn) = conns.get(&session_id) else { return };
    if conn.session.done_state() != DoneState::Attached {
        // Detach already requested: buffer any further bytes for the
        // eventual DetachedStream rather than delivering them to a handler
        // that is about to be told the session is gone.
        if let Some(bytes) = bytes {
            conn.session.detach_buffer.lock().unwrap().extend_from_slice(&bytes);
        }
        return;
    }
    let action = conn.handler.on_recv_msg(bytes.as_deref()).await;
    apply_action(conns, session_id, action).await;
}

async fn apply_action(conns: &mut HashMap<u64, Conn>, session_id: u64, action: Action) {
    let Some(conn) = conns.get(&session_id) else { return };
    match action {
        Action::None => {}
        Action::Detach => conn.session.request_stop(DoneState::Detached),
        Action::Close => conn.session.request_stop(DoneState::Closed),
    }
}

async fn handle_reader_stopped(conns: &mut HashMap<u64, Conn>, session_id: u64, err: Option<io::Error>) {
    let Some(conn) = conns.remove(&session_id) else { return };
    finish_session(conn, err).await;
}

/// Runs the terminal-event logic of spec §4.4 "Egress": inspects `done` to
/// decide whether to fire `on_closed` or `on_detached`, exactly once.
async fn finish_session(conn: Conn, err: Option<io::Error>) {
    match conn.session.done_state() {
        DoneState::Attached => {
            // Reader failed before any close/detach was requested: a genuine
            // transport read error (EOF normalized to None).
            let _ = conn.session.take_write_half().await;
            let normalized = err.and_then(normalize_eof);
            let _ = conn.handler.on_closed(normalized).await;
        }
        DoneState::Closed => {
            let _ = conn.session.take_write_half().await;
            let _ = conn.handler.on_closed(None).await;
        }
        DoneState::Detached => {
            // This command (ReaderStopped) arrives on the same channel as
            // every Inbound command the reader forwarded before it, so by
            // the time we get here every post-detach byte the reader ever
            // read has already been appended to detach_buffer by
            // handle_inbound above — assembling the stream here, rather
            // than on the reader, is what makes that ordering guarantee
            // hold.
            let leftover = std::mem::take(&mut *conn.session.detach_buffer.lock().unwrap());
            let read_half = conn.session.take_read_half().await;
            let write_half = conn.session.take_write_half().await;
            match (read_half, write_half) {
                (Some(read_half), Some(write_half)) => {
                    let stream = build_detached_stream(read_half, write_half, leftover);
                    let _ = conn.handler.on_detached(stream).await;
                }
                _ => {
                    // Defensive: should not happen, but never silently drop
                    // the terminal event contract.
                    warn!(session_id = conn.session.session_id(), "detach requested but no stream assembled");
                    let _ = conn.handler.on_closed(None).await;
                }
            }
        }
    }
}

/// Drains remaining events after a shutdown sentinel (spec §4.4 "Egress").
/// On `CloseConns`, every still-attached session is asked to close; the loop
/// keeps processing `ReaderStopped` events (and, harmlessly, anything else)
/// until its connection set is empty.
async fn egress(idx: usize, mut rx: mpsc::UnboundedReceiver<LoopCommand>, mut conns: HashMap<u64, Conn>) {
    let mut closing = false;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LoopCommand::CloseConns => {
                closing = true;
                for conn in conns.values() {
                    conn.session.request_stop(DoneState::Closed);
                }
            }
            LoopCommand::ReaderStopped { session_id, err } => {
                handle_reader_stopped(&mut conns, session_id, err).await;
            }
            LoopCommand::Accept { session, handler } => {
                // A straggling accept racing shutdown: give it its terminal
                // event immediately rather than leaking the handler.
                let _ = handler.on_opened().await;
                session.request_stop(DoneState::Closed);
                conns.insert(session.session_id(), Conn { session, handler });
            }
            _ => {}
        }
        if closing && conns.is_empty() {
            break;
        }
    }
    info!(loop_idx = idx, "event loop stopped");
}
