//! The session contract (spec §3 "Session", §6 "Session contract") and its
//! three concrete variants: TCP, UDP and client. See [`tcp`], [`udp`] and
//! [`client`].

pub mod client;
pub mod tcp;
pub mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use async_trait::async_trait;

use crate::error::Result;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next process-unique, monotonically increasing session ID.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// `done` states for a TCP/client session (spec §3 invariants): transitions
/// are monotonic, 0 -> {1, 2}, and never out of 1 or 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DoneState {
    Attached = 0,
    Closed = 1,
    Detached = 2,
}

/// An atomic cell holding a [`DoneState`], enforcing the monotonic-transition
/// invariant with a single `compare_exchange`.
#[derive(Debug)]
pub struct DoneCell(AtomicU8);

impl DoneCell {
    pub fn new() -> Self {
        DoneCell(AtomicU8::new(DoneState::Attached as u8))
    }

    pub fn load(&self) -> DoneState {
        match self.0.load(Ordering::Acquire) {
            1 => DoneState::Closed,
            2 => DoneState::Detached,
            _ => DoneState::Attached,
        }
    }

    /// Attempts the one legal transition out of `Attached`. Returns `true` if
    /// this call performed the transition, `false` if the session was
    /// already closed/detached (by a handler action, a concurrent
    /// `shutdown()`, or shutdown-cascade teardown) — callers use this to
    /// fire the close-notification exactly once.
    pub fn try_close_or_detach(&self, target: DoneState) -> bool {
        debug_assert!(target != DoneState::Attached);
        self.0
            .compare_exchange(
                DoneState::Attached as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for DoneCell {
    fn default() -> Self {
        DoneCell::new()
    }
}

/// The core-to-application session contract (spec §6): every session variant
/// — TCP, UDP, client — implements this uniformly so a [`crate::handler::EventHandler`]
/// never needs to know which kind of transport it was handed.
#[async_trait]
pub trait Session: Send + Sync {
    fn service_key(&self) -> &str;

    fn session_id(&self) -> u64;

    /// Writes `bytes` to the connection. Synchronous from the caller's point
    /// of view in the sense that there is no internal send queue: the write
    /// either completes (or fails) before this returns (Non-goal: no
    /// per-connection write queueing).
    async fn send_msg(&self, bytes: &[u8]) -> Result<()>;

    /// Closes the session. `notify` is accepted for contract parity with the
    /// original API; this runtime always ends with exactly one terminal
    /// `on_closed`/`on_detached` callback regardless of its value.
    fn shutdown(&self, notify: bool);

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Posts an out-of-band wake-up: the owning loop (or, for a client
    /// session, nothing — client sessions have no loop to wake) will invoke
    /// `on_recv_msg(None)` on this session's handler.
    fn wake(&self);
}

pub(crate) fn normalize_eof(err: io::Error) -> Option<io::Error> {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        None
    } else {
        Some(err)
    }
}
