use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

use super::Session;

/// A UDP "session": one remote peer address on a shared socket (spec §3). All
/// UDP sessions on a listener share the same underlying [`UdpSocket`] — the
/// listener's `recv_from` loop is what gives each distinct peer address its
/// own session identity (spec §4.2 "Receive loop (UDP)").
pub struct UdpSessionState {
    session_id: u64,
    service_key: String,
    pub(crate) listener_idx: usize,
    socket: Arc<UdpSocket>,
    remote_addr: SocketAddr,
}

impl UdpSessionState {
    pub fn new(
        session_id: u64,
        service_key: String,
        listener_idx: usize,
        socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
    ) -> Self {
        UdpSessionState { session_id, service_key, listener_idx, socket, remote_addr }
    }
}

#[async_trait]
impl Session for UdpSessionState {
    fn service_key(&self) -> &str {
        &self.service_key
    }

    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn send_msg(&self, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, self.remote_addr).await.map(|_| ()).map_err(Error::Io)
    }

    fn shutdown(&self, _notify: bool) {
        // UDP sessions have no persistent stream to tear down; the listener
        // simply stops reusing this remote address as a known session once
        // the application drops its handler.
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn wake(&self) {
        // Spec §6: Wake causes the owning loop to re-invoke on_recv_msg(None).
        // UDP sessions are not owned by a loop command queue the way TCP
        // sessions are, so there is nothing to post a wake request to.
    }
}
