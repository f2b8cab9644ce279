//! Drives a real TCP connection through the whole accept → loop → handler
//! path, and through the full shutdown cascade afterward (spec §8 S1-shaped
//! scenario, end to end rather than at the pump's unit level).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loomnet::handler::{Action, DetachedStream, EventHandler, HandlerManager, OpenOptions};
use loomnet::{ModuleStatus, NetworkModule, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct EchoHandler {
    session: Arc<dyn Session>,
}

#[async_trait]
impl EventHandler for EchoHandler {
    async fn on_opened(&self) -> (OpenOptions, Action) {
        (OpenOptions::default(), Action::None)
    }

    async fn on_recv_msg(&self, bytes: Option<&[u8]>) -> Action {
        if let Some(bytes) = bytes {
            let _ = self.session.send_msg(bytes).await;
        }
        Action::None
    }

    async fn on_closed(&self, _err: Option<std::io::Error>) -> Action {
        Action::None
    }

    async fn on_detached(&self, _stream: DetachedStream) -> Action {
        Action::None
    }
}

struct EchoManager;

#[async_trait]
impl HandlerManager for EchoManager {
    async fn create_event_handler(&self, session: Arc<dyn Session>) -> Option<Arc<dyn EventHandler>> {
        Some(Arc::new(EchoHandler { session }))
    }

    async fn on_connect_failed(&self, _service_key: &str) {}

    async fn on_shutdown(&self) {}
}

async fn wait_until_running(module: &NetworkModule) {
    for _ in 0..200 {
        if matches!(module.status(), ModuleStatus::Running) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("module never reached Running status");
}

#[tokio::test(flavor = "multi_thread")]
async fn echoes_bytes_then_shuts_down_cleanly() {
    let module = Arc::new(NetworkModule::new());
    module.listen("echo", "tcp://127.0.0.1:0").await.expect("listen");
    let addr = module.local_addr("echo").expect("bound address recorded after listen");

    let run_module = module.clone();
    let handler_manager: Arc<dyn HandlerManager> = Arc::new(EchoManager);
    let run_handle = tokio::spawn(async move { run_module.run(handler_manager, 2).await });

    wait_until_running(&module).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect to echo service");
    stream.write_all(b"hello, loomnet").await.expect("write");
    let mut buf = [0u8; 14];
    stream.read_exact(&mut buf).await.expect("read echo");
    assert_eq!(&buf, b"hello, loomnet");

    module.shutdown();
    let outcome = tokio::time::timeout(Duration::from_secs(5), run_handle)
        .await
        .expect("run() must return promptly after shutdown, not hang in the egress cascade")
        .expect("run task should not panic");
    assert!(outcome.is_ok());
    assert!(matches!(module.status(), ModuleStatus::Shutdown));
}

#[tokio::test(flavor = "multi_thread")]
async fn multiple_connections_are_all_echoed_concurrently() {
    let module = Arc::new(NetworkModule::new());
    module.listen("echo", "tcp://127.0.0.1:0").await.expect("listen");
    let addr = module.local_addr("echo").expect("bound address recorded after listen");

    let run_module = module.clone();
    let handler_manager: Arc<dyn HandlerManager> = Arc::new(EchoManager);
    let run_handle = tokio::spawn(async move { run_module.run(handler_manager, 4).await });

    wait_until_running(&module).await;

    let mut joins = Vec::new();
    for i in 0..8u8 {
        joins.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            let payload = vec![i; 32];
            stream.write_all(&payload).await.expect("write");
            let mut buf = vec![0u8; 32];
            stream.read_exact(&mut buf).await.expect("read");
            assert_eq!(buf, payload);
        }));
    }
    for join in joins {
        join.await.expect("client task panicked");
    }

    module.shutdown();
    tokio::time::timeout(Duration::from_secs(5), run_handle)
        .await
        .expect("run() must return promptly")
        .expect("run task should not panic")
        .expect("run() should not return an error");
}
