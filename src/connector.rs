//! Connector (spec §4.3): dials a remote service and, unlike a listener's
//! accepted sessions, drives its reader directly rather than through a loop's
//! command channel — a connector has no "loop" of its own.
//!
//! Grounded in `Network/Connector.go`'s `connect`/`serve` pair and the
//! teacher's own direct-await dial-with-timeout pattern in `resolver.rs`.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

use crate::module::ModuleShared;
use crate::session::client::ClientSessionState;
use crate::session::tcp::{ConnReadHalf, ConnWriteHalf};
use crate::session::{next_session_id, normalize_eof, DoneState, Session};
use std::sync::Arc;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Everything needed to dial a service, queued by
/// [`crate::module::NetworkModule::connect_svc`] if the module isn't running
/// yet, or dialed immediately otherwise.
pub(crate) struct ConnectorDescriptor {
    pub service_key: String,
    pub network: String,
    pub address: String,
    pub timeout: Duration,
}

/// Dials `descriptor.address`, reporting a failure to the handler manager
/// (spec §4.3 `OnConnectFailed`) rather than returning an error to any
/// caller — `connect`/`connect_svc` only report *synchronous* failures
/// (bad URL, duplicate key); the dial itself is always asynchronous.
pub(crate) async fn dial_and_serve(descriptor: ConnectorDescriptor, shared: Arc<ModuleShared>) {
    let handler_manager = shared.handler_manager();

    match descriptor.network.as_str() {
        "tcp" | "tcp4" | "tcp6" => {
            let dial = tokio::time::timeout(descriptor.timeout, TcpStream::connect(&descriptor.address));
            match dial.await {
                Ok(Ok(stream)) => {
                    let remote_addr = stream.peer_addr().ok();
                    let local_addr = stream.local_addr().ok();
                    let _ = stream.set_nodelay(true);
                    let (read_half, write_half) = stream.into_split();
                    serve_client_session(
                        descriptor.service_key,
                        shared,
                        ConnReadHalf::Tcp(read_half),
                        ConnWriteHalf::Tcp(write_half),
                        remote_addr,
                        local_addr,
                    )
                    .await;
                }
                Ok(Err(err)) => {
                    warn!(service = %descriptor.service_key, %err, "dial failed");
                    handler_manager.on_connect_failed(&descriptor.service_key).await;
                }
                Err(_) => {
                    warn!(service = %descriptor.service_key, timeout = ?descriptor.timeout, "dial timed out");
                    handler_manager.on_connect_failed(&descriptor.service_key).await;
                }
            }
        }
        "unix" => {
            let dial = tokio::time::timeout(descriptor.timeout, UnixStream::connect(&descriptor.address));
            match dial.await {
                Ok(Ok(stream)) => {
                    let (read_half, write_half) = stream.into_split();
                    serve_client_session(
                        descriptor.service_key,
                        shared,
                        ConnReadHalf::Unix(read_half),
                        ConnWriteHalf::Unix(write_half),
                        None,
                        None,
                    )
                    .await;
                }
                Ok(Err(err)) => {
                    warn!(service = %descriptor.service_key, %err, "dial failed");
                    handler_manager.on_connect_failed(&descriptor.service_key).await;
                }
                Err(_) => {
                    warn!(service = %descriptor.service_key, timeout = ?descriptor.timeout, "dial timed out");
                    handler_manager.on_connect_failed(&descriptor.service_key).await;
                }
            }
        }
        other => {
            warn!(service = %descriptor.service_key, network = other, "connector does not support this network");
            handler_manager.on_connect_failed(&descriptor.service_key).await;
        }
    }
}

async fn serve_client_session(
    service_key: String,
    shared: Arc<ModuleShared>,
    read_half: ConnReadHalf,
    write_half: ConnWriteHalf,
    remote_addr: Option<std::net::SocketAddr>,
    local_addr: Option<std::net::SocketAddr>,
) {
    let session_id = next_session_id();
    let session = Arc::new(ClientSessionState::new(session_id, service_key.clone(), write_half, remote_addr, local_addr));

    let Some(handler) = shared.handler_manager().create_event_handler(session.clone() as Arc<dyn Session>).await else {
        debug!(service = %service_key, session_id, "handler manager refused outbound connection");
        return;
    };

    let (opts, action) = handler.on_opened().await;
    if let Some(period) = opts.tcp_keep_alive {
        session.apply_keep_alive(period).await;
    }
    if !matches!(action, crate::handler::Action::None) {
        session.request_stop(match action {
            crate::handler::Action::Close => DoneState::Closed,
            crate::handler::Action::Detach => DoneState::Detached,
            crate::handler::Action::None => unreachable!(),
        });
    }

    let reader = tokio::spawn(run_client_reader(session.clone(), handler, read_half));
    shared.register_client_session(session, reader);
}

/// Runs a client session's reader to completion (spec §4.3: "drives its
/// reader directly"). No loop, no command channel — every callback is
/// invoked in this task, serialized the same way a loop serializes them for
/// an accepted session, just without the hop through a channel.
async fn run_client_reader(session: Arc<ClientSessionState>, handler: Arc<dyn crate::handler::EventHandler>, mut read_half: ConnReadHalf) {
    let mut buf = vec![0u8; READ_BUF_SIZE];

    let result: std::io::Result<()> = loop {
        if session.done_state() != DoneState::Attached {
            break Ok(());
        }
        tokio::select! {
            _ = session.close_notify.notified() => break Ok(()),
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => break Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed by peer")),
                    Ok(n) => {
                        let action = handler.on_recv_msg(Some(&buf[..n])).await;
                        apply_reader_action(&session, action);
                    }
                    Err(err) => break Err(err),
                }
            }
        }
    };

    match session.done_state() {
        DoneState::Detached => {
            let leftover = std::mem::take(&mut *session.detach_buffer.lock().unwrap());
            if let Some(write_half) = session.take_write_half().await {
                let stream = crate::session::tcp::build_detached_stream(read_half, write_half, leftover);
                let _ = handler.on_detached(stream).await;
            }
        }
        DoneState::Closed => {
            let _ = session.take_write_half().await;
            let _ = handler.on_closed(None).await;
        }
        DoneState::Attached => {
            let _ = session.take_write_half().await;
            let normalized = result.err().and_then(normalize_eof);
            let _ = handler.on_closed(normalized).await;
        }
    }
}

fn apply_reader_action(session: &Arc<ClientSessionState>, action: crate::handler::Action) -> bool {
    match action {
        crate::handler::Action::None => true,
        crate::handler::Action::Detach => {
            session.request_stop(DoneState::Detached);
            false
        }
        crate::handler::Action::Close => {
            session.request_stop(DoneState::Closed);
            false
        }
    }
}
