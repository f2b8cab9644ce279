//! A tiny demo binary wiring `loomnet` end to end: one TCP service whose
//! handler feeds the framed pump and whose tick loop echoes every delivered
//! packet back to its sender.
//!
//! This is the "application" half the core explicitly leaves out (spec §1):
//! the concrete session manager, the CLI, and the tick cadence all live here,
//! not in the library crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loomnet::group::SessionGroup;
use loomnet::handler::{Action, DetachedStream, EventHandler, HandlerManager, OpenOptions};
use loomnet::pump::{FramedPump, FRAME_HEADER_LEN};
use loomnet::tick::{TickDriver, Ticked};
use loomnet::{NetworkModule, Session};

const TICK_PERIOD: Duration = Duration::from_millis(33);

#[derive(Parser, Debug)]
#[command(author, version, about = "loomnet echo-server demo", long_about = None)]
struct Args {
    /// Service URL to listen on.
    #[arg(long = "listen", default_value = "tcp://127.0.0.1:9000")]
    listen: String,
    /// Number of event loops (0 = CPU count).
    #[arg(long = "loops", default_value_t = 0)]
    loops: usize,
    /// Enable debug logging.
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

/// The application's logical session: one [`FramedPump`] plus enough of the
/// core [`Session`] handle to write replies back out. Registered in the
/// global [`SessionGroup`] between `on_opened` and the terminal callback.
struct EchoSession {
    session: Arc<dyn Session>,
    pump: FramedPump,
}

impl Ticked for EchoSession {
    fn on_update(&self, _dt: Duration) {
        let session = self.session.clone();
        let session_id = session.session_id();
        self.pump.drain_tick(session_id, move |packet| {
            let mut wire = Vec::with_capacity(FRAME_HEADER_LEN + packet.len());
            wire.extend_from_slice(&(packet.len() as u32).to_le_bytes());
            wire.extend_from_slice(&packet.msg_type().to_le_bytes());
            wire.extend_from_slice(packet.body());
            // Echoing is a blocking write on the session (Non-goal: no
            // per-connection write queueing), so fire-and-forget a task
            // rather than block the tick driver on a slow peer.
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(err) = session.send_msg(&wire).await {
                    warn!(session_id, %err, "echo write failed");
                }
            });
        });
    }
}

/// Per-session event handler: feeds bytes into the pump and manages the
/// session's membership in the global group.
struct EchoHandler {
    group: Arc<SessionGroup<EchoSession>>,
    logical: Arc<EchoSession>,
}

#[async_trait]
impl EventHandler for EchoHandler {
    async fn on_opened(&self) -> (OpenOptions, Action) {
        let session_id = self.logical.session.session_id();
        if let Err(err) = self.group.add(session_id, self.logical.clone()) {
            error!(session_id, %err, "duplicate session id, closing");
            return (OpenOptions::default(), Action::Close);
        }
        info!(session_id, remote = ?self.logical.session.remote_addr(), "session opened");
        let mut opts = OpenOptions::default();
        opts.tcp_keep_alive = Some(Duration::from_secs(30));
        (opts, Action::None)
    }

    async fn on_recv_msg(&self, bytes: Option<&[u8]>) -> Action {
        match bytes {
            Some(bytes) => self.logical.pump.on_recv_msg(bytes),
            None => Action::None, // out-of-band wake; nothing to do for echo
        }
    }

    async fn on_closed(&self, err: Option<std::io::Error>) -> Action {
        let session_id = self.logical.session.session_id();
        self.group.remove(session_id);
        match err {
            Some(err) => warn!(session_id, %err, "session closed with error"),
            None => info!(session_id, "session closed"),
        }
        Action::None
    }

    async fn on_detached(&self, _stream: DetachedStream) -> Action {
        // This demo never returns Action::Detach, so this never fires; kept
        // to satisfy the contract for a handler that might.
        self.group.remove(self.logical.session.session_id());
        Action::None
    }
}

struct EchoHandlerManager {
    group: Arc<SessionGroup<EchoSession>>,
}

#[async_trait]
impl HandlerManager for EchoHandlerManager {
    async fn create_event_handler(&self, session: Arc<dyn Session>) -> Option<Arc<dyn EventHandler>> {
        let logical = Arc::new(EchoSession { session, pump: FramedPump::new() });
        Some(Arc::new(EchoHandler { group: self.group.clone(), logical }))
    }

    async fn on_connect_failed(&self, service_key: &str) {
        warn!(service = service_key, "connect failed");
    }

    async fn on_shutdown(&self) {
        info!("handler manager notified of shutdown");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let group: Arc<SessionGroup<EchoSession>> = Arc::new(SessionGroup::new());
    let ticks = Arc::new(AtomicU64::new(0));
    let ticks_for_tick = ticks.clone();
    let (tick_driver, tick_join) =
        TickDriver::spawn(group.clone(), TICK_PERIOD, move |_dt| {
            ticks_for_tick.fetch_add(1, Ordering::Relaxed);
        });

    let module = Arc::new(NetworkModule::new());
    let handler_manager: Arc<dyn HandlerManager> = Arc::new(EchoHandlerManager { group: group.clone() });

    module.listen("echo", &args.listen).await.context("listen on configured service")?;

    let shutdown_module = module.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install ctrl-c handler");
            return;
        }
        info!("shutdown signal received");
        shutdown_module.shutdown();
    });

    info!(listen = %args.listen, loops = args.loops, "starting network module");
    module.run(handler_manager, args.loops).await.context("network module run")?;

    tick_driver.stop();
    let _ = tick_join.await;
    info!(ticks = ticks.load(Ordering::Relaxed), "shut down cleanly");
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_level(debug);
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
