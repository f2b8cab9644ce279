use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::{Error, Result};

use super::tcp::ConnWriteHalf;
use super::{DoneCell, DoneState, Session};

/// A client session produced by [`crate::module::NetworkModule::connect`].
/// Unlike a [`super::tcp::TcpSessionState`] it has no owning loop: its reader
/// runs in its own task and calls the handler directly (spec §4.3).
pub struct ClientSessionState {
    session_id: u64,
    service_key: String,
    write_half: AsyncMutex<Option<ConnWriteHalf>>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    done: DoneCell,
    pub(crate) close_notify: Notify,
    pub(crate) detach_buffer: StdMutex<Vec<u8>>,
}

impl ClientSessionState {
    pub(crate) fn new(
        session_id: u64,
        service_key: String,
        write_half: ConnWriteHalf,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        ClientSessionState {
            session_id,
            service_key,
            write_half: AsyncMutex::new(Some(write_half)),
            remote_addr,
            local_addr,
            done: DoneCell::new(),
            close_notify: Notify::new(),
            detach_buffer: StdMutex::new(Vec::new()),
        }
    }

    pub fn done_state(&self) -> DoneState {
        self.done.load()
    }

    pub(crate) fn request_stop(&self, target: DoneState) -> bool {
        let flipped = self.done.try_close_or_detach(target);
        if flipped {
            self.close_notify.notify_one();
        }
        flipped
    }

    pub(crate) async fn take_write_half(&self) -> Option<ConnWriteHalf> {
        self.write_half.lock().await.take()
    }

    /// Applies a handler-requested keep-alive period. No-op for a Unix
    /// domain dial, mirroring [`super::tcp::TcpSessionState::apply_keep_alive`].
    #[cfg(unix)]
    pub(crate) async fn apply_keep_alive(&self, period: std::time::Duration) {
        use socket2::{SockRef, TcpKeepalive};

        if let Some(ConnWriteHalf::Tcp(half)) = self.write_half.lock().await.as_ref() {
            if let Ok(sock) = SockRef::try_from(half) {
                let _ = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period));
            }
        }
    }

    #[cfg(not(unix))]
    pub(crate) async fn apply_keep_alive(&self, _period: std::time::Duration) {}
}

#[async_trait]
impl Session for ClientSessionState {
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
        // A client session's reader calls the handler directly rather than
        // going through a loop command queue, so there is no loop to post a
        // wake request to; `on_recv_msg(None)` is only meaningful for
        // loop-dispatched (TCP) sessions.
    }
}
