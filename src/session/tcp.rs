use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf as TcpReadHalf, OwnedWriteHalf as TcpWriteHalf};
use tokio::net::unix::{OwnedReadHalf as UnixReadHalf, OwnedWriteHalf as UnixWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::{Error, Result};
use crate::handler::DetachedStream;
use crate::loop_::LoopHandle;

use super::{DoneCell, DoneState, Session};

/// The read half of a stream-oriented connection. A session's underlying
/// transport is either TCP or a Unix domain stream socket (spec §6: the
/// `unix` scheme) — mirroring the way the original represents both behind
/// one generic stream-connection interface.
pub(crate) enum ConnReadHalf {
    Tcp(TcpReadHalf),
    Unix(UnixReadHalf),
}

pub(crate) enum ConnWriteHalf {
    Tcp(TcpWriteHalf),
    Unix(UnixWriteHalf),
}

impl AsyncRead for ConnReadHalf {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnReadHalf::Tcp(h) => Pin::new(h).poll_read(cx, buf),
            ConnReadHalf::Unix(h) => Pin::new(h).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnWriteHalf {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnWriteHalf::Tcp(h) => Pin::new(h).poll_write(cx, buf),
            ConnWriteHalf::Unix(h) => Pin::new(h).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnWriteHalf::Tcp(h) => Pin::new(h).poll_flush(cx),
            ConnWriteHalf::Unix(h) => Pin::new(h).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnWriteHalf::Tcp(h) => Pin::new(h).poll_shutdown(cx),
            ConnWriteHalf::Unix(h) => Pin::new(h).poll_shutdown(cx),
        }
    }
}

/// A stream session (TCP or Unix domain) owned by exactly one
/// [`crate::loop_::LoopHandle`]'s loop for its entire lifetime (spec §3
/// invariant). Reads are pumped into the owning loop's command channel by a
/// dedicated reader task; writes go straight to the socket from whichever
/// task calls [`Session::send_msg`].
pub struct TcpSessionState {
    session_id: u64,
    service_key: String,
    pub(crate) listener_idx: usize,
    write_half: AsyncMutex<Option<ConnWriteHalf>>,
    /// `None` for a Unix domain session, which has no IP-based address.
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    done: DoneCell,
    /// Signalled to unblock the reader task promptly on close/detach — the
    /// Rust stand-in for the original's zero read-deadline trick (spec §4.4).
    pub(crate) close_notify: Notify,
    /// Bytes the loop task appends here (via the owning loop's channel, so in
    /// strict arrival order) for a session that has already been told to
    /// detach but hasn't yet had its reader task observe that; drained once,
    /// by the loop task itself, when it assembles the [`DetachedStream`] in
    /// `finish_session` — never by the reader, so there is no race between
    /// "loop appended the last post-detach bytes" and "stream assembled"
    /// (both happen on the loop task, the latter strictly after the former
    /// in channel order; see `crate::loop_::finish_session`).
    pub(crate) detach_buffer: StdMutex<Vec<u8>>,
    pub(crate) owning_loop: LoopHandle,
    /// Set by the reader task once it has observed a stop request and is
    /// about to exit, handing its live read half to the loop task for
    /// `finish_session` to assemble into a [`DetachedStream`] (taken exactly
    /// once, after `detach_buffer` has received every byte the channel will
    /// ever deliver for this session).
    read_half: AsyncMutex<Option<ConnReadHalf>>,
}

impl TcpSessionState {
    pub(crate) fn new(
        session_id: u64,
        service_key: String,
        listener_idx: usize,
        write_half: ConnWriteHalf,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        owning_loop: LoopHandle,
    ) -> Self {
        TcpSessionState {
            session_id,
            service_key,
            listener_idx,
            write_half: AsyncMutex::new(Some(write_half)),
            remote_addr,
            local_addr,
            done: DoneCell::new(),
            close_notify: Notify::new(),
            detach_buffer: StdMutex::new(Vec::new()),
            owning_loop,
            read_half: AsyncMutex::new(None),
        }
    }

    pub fn done_state(&self) -> DoneState {
        self.done.load()
    }

    /// Applies a handler-returned or out-of-band `Close`/`Detach`: flips
    /// `done` (a no-op if it already left `Attached`) and wakes the reader.
    pub(crate) fn request_stop(&self, target: DoneState) {
        if self.done.try_close_or_detach(target) {
            self.close_notify.notify_one();
        }
    }

    /// Called by the reader task once it has observed the stop request and
    /// is about to exit, so egress can release the write half.
    pub(crate) async fn take_write_half(&self) -> Option<ConnWriteHalf> {
        self.write_half.lock().await.take()
    }

    /// Called by the reader task, after observing `done == Detached` and
    /// before it sends `ReaderStopped`, to hand its live read half to the
    /// loop task rather than assembling the `DetachedStream` itself — doing
    /// the assembly on the reader would race the loop still appending
    /// post-detach bytes to `detach_buffer`.
    pub(crate) async fn store_read_half(&self, read_half: ConnReadHalf) {
        *self.read_half.lock().await = Some(read_half);
    }

    /// Called exactly once by `finish_session` (loop task), after every
    /// channel-ordered `Inbound` command for this session has already been
    /// appended to `detach_buffer`.
    pub(crate) async fn take_read_half(&self) -> Option<ConnReadHalf> {
        self.read_half.lock().await.take()
    }

    /// Applies a handler-requested keep-alive period to the underlying
    /// socket. A no-op for Unix domain sockets, where keep-alive has no
    /// meaning. Best-effort: failures are not surfaced to the handler.
    #[cfg(unix)]
    pub(crate) async fn apply_keep_alive(&self, period: Duration) {
        use socket2::{SockRef, TcpKeepalive};

        if let Some(ConnWriteHalf::Tcp(half)) = self.write_half.lock().await.as_ref() {
            if let Ok(sock) = SockRef::try_from(half) {
                let _ = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period));
            }
        }
    }

    #[cfg(not(unix))]
    pub(crate) async fn apply_keep_alive(&self, _period: Duration) {}
}

#[async_trait]
impl Session for TcpSessionState {
    fn service_key(&self) -> &str {
        &self.service_key
    }

    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn send_msg(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        match guard.as_mut() {
            Some(half) => half.write_all(bytes).await.map_err(Error::Io),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session already closed or detached",
            ))),
        }
    }

    fn shutdown(&self, _notify: bool) {
        self.request_stop(DoneState::Closed);
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn wake(&self) {
        self.owning_loop.wake(self.session_id);
    }
}

/// Assembles the [`DetachedStream`] handed to `on_detached`: any bytes
/// buffered while the detach was in flight are drained first, then the live
/// halves.
pub(crate) fn build_detached_stream(
    read_half: ConnReadHalf,
    write_half: ConnWriteHalf,
    leftover: Vec<u8>,
) -> DetachedStream {
    DetachedStream::new(leftover, read_half, write_half)
}
