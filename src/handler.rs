//! The application-facing event-handler contract (spec §4.6).
//!
//! Handlers are stored as `Arc<dyn EventHandler>` trait objects so the loop
//! and listener/connector tasks can hold them without knowing the concrete
//! application type. Trait methods are `async` (via `async_trait`) so a
//! handler can perform its own I/O — e.g. `send_msg` on the session it was
//! handed — without the runtime needing a separate write-queueing layer
//! (Non-goal: "no per-connection write queueing").

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::session::tcp::{ConnReadHalf, ConnWriteHalf};
use crate::session::Session;

/// Action returned by a handler callback, applied by the owning loop/reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// No action: continue as normal.
    #[default]
    None,
    /// Detach the connection: the runtime stops dispatching events for it and
    /// hands the live stream to the handler via `on_detached`. TCP/client
    /// sessions only — UDP sessions have no persistent stream to detach.
    Detach,
    /// Close the connection.
    Close,
}

/// Options returned from `on_opened`, applied before the first `on_recv_msg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// TCP keep-alive period. `None`/zero means "leave the OS default".
    pub tcp_keep_alive: Option<Duration>,
    /// Hint that the handler would like its input buffer reused across
    /// reads rather than freshly allocated each time. Purely advisory —
    /// the pump in this crate always reuses its ring buffer regardless.
    pub reuse_input_buffer: bool,
}

/// A duplex stream handed to a handler after a successful detach. Reads first
/// drain any bytes the runtime had already buffered for this session but not
/// yet delivered, then fall through to the live socket. Read and write halves
/// are kept separate (rather than reunited into a single stream type) so the
/// same wrapper works for both TCP and Unix domain transports.
pub struct DetachedStream {
    leftover: Vec<u8>,
    leftover_pos: usize,
    read_half: ConnReadHalf,
    write_half: ConnWriteHalf,
}

impl DetachedStream {
    pub(crate) fn new(leftover: Vec<u8>, read_half: ConnReadHalf, write_half: ConnWriteHalf) -> Self {
        DetachedStream { leftover, leftover_pos: 0, read_half, write_half }
    }

    fn remaining_leftover(&self) -> &[u8] {
        &self.leftover[self.leftover_pos..]
    }
}

impl AsyncRead for DetachedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover_pos < self.leftover.len() {
            let remaining = self.remaining_leftover();
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.leftover_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.read_half).poll_read(cx, buf)
    }
}

impl AsyncWrite for DetachedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().write_half).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write_half).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write_half).poll_shutdown(cx)
    }
}

/// Per-session callbacks (spec §4.6, "Event handler").
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called once, before any `on_recv_msg`. Returns the keep-alive/buffer
    /// options to apply and an action (rarely anything but `None` here).
    async fn on_opened(&self) -> (OpenOptions, Action);

    /// Called for every batch of inbound bytes in TCP order, or once per
    /// UDP datagram (always `Some`). `None` is reserved for a
    /// `Session::wake()` nudge.
    async fn on_recv_msg(&self, bytes: Option<&[u8]>) -> Action;

    /// Called exactly once, after the last `on_recv_msg`, unless the session
    /// was detached instead. `err` is `None` for an orderly close or a
    /// protocol-validity close; `Some` for a transport read failure (EOF is
    /// normalized to `None` before this is called).
    async fn on_closed(&self, err: Option<io::Error>) -> Action;

    /// Called instead of `on_closed` when the action was `Detach`. The
    /// runtime stops dispatching any further events for this session.
    async fn on_detached(&self, stream: DetachedStream) -> Action;
}

/// Process-wide callbacks (spec §4.6, "Handler manager").
#[async_trait]
pub trait HandlerManager: Send + Sync {
    /// Creates a handler for a newly accepted/connected session, or returns
    /// `None` to refuse it outright (the listener/connector then closes the
    /// connection without ever calling `on_opened`).
    async fn create_event_handler(&self, session: Arc<dyn Session>) -> Option<Arc<dyn EventHandler>>;

    /// Called when a `Connect`/`ConnectSvc` dial fails. The application may
    /// reschedule the connect itself (spec: no reconnect policy engine lives
    /// in the core beyond the single-shot timer in [`crate::timer`]).
    async fn on_connect_failed(&self, service_key: &str);

    /// Called once, after `NetworkModule::run`'s shutdown cascade completes.
    async fn on_shutdown(&self);
}
