//! Spec §8 scenario S5: `Listen` then `Shutdown` before any accept — `run`
//! must still return, the listener must be closed, and no handler callback
//! may ever fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loomnet::handler::{EventHandler, HandlerManager};
use loomnet::{ModuleStatus, NetworkModule, Session};

struct NeverCalledManager {
    called: Arc<AtomicBool>,
}

#[async_trait]
impl HandlerManager for NeverCalledManager {
    async fn create_event_handler(&self, _session: Arc<dyn Session>) -> Option<Arc<dyn EventHandler>> {
        self.called.store(true, Ordering::SeqCst);
        None
    }

    async fn on_connect_failed(&self, _service_key: &str) {}

    async fn on_shutdown(&self) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_before_any_accept_returns_promptly_with_no_callbacks() {
    let module = NetworkModule::new();
    module.listen("s", "tcp://127.0.0.1:0").await.expect("listen");
    let addr = module.local_addr("s").expect("bound address recorded");

    let called = Arc::new(AtomicBool::new(false));
    let manager: Arc<dyn HandlerManager> = Arc::new(NeverCalledManager { called: called.clone() });

    // Shut down before run() is even called, exercising the "signal already
    // pending" path through tokio::sync::Notify.
    module.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), module.run(manager, 1)).await;
    let result = result.expect("run() should return promptly, not hang waiting for a connection");
    assert!(result.is_ok());
    assert!(matches!(module.status(), ModuleStatus::Shutdown));
    assert!(!called.load(Ordering::SeqCst), "handler manager must never be invoked");

    // The listener was closed as part of the shutdown cascade: a fresh
    // connect attempt to the now-dead port must fail.
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_idempotent() {
    let module = NetworkModule::new();
    module.shutdown();
    module.shutdown();
    module.shutdown();

    let manager: Arc<dyn HandlerManager> = Arc::new(NeverCalledManager { called: Arc::new(AtomicBool::new(false)) });
    let result = tokio::time::timeout(Duration::from_secs(5), module.run(manager, 1)).await;
    assert!(result.is_ok(), "multiple shutdown() calls before run() must not hang or panic");
}
