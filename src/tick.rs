//! The tick driver (spec §4.8): wakes a [`crate::group::SessionGroup`] on a
//! fixed period, running a global per-tick function and then each session's
//! own update under the group's broadcast snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::group::SessionGroup;

/// Implemented by the application's logical session type so the tick driver
/// can call its per-session update without the core knowing anything else
/// about it.
pub trait Ticked: Send + Sync {
    fn on_update(&self, dt: Duration);
}

/// A handle to a running tick driver task; dropping it does not stop the
/// task (use [`TickDriver::stop`] for that — mirroring every other
/// cancellation point in this crate, which is cooperative rather than
/// drop-triggered).
pub struct TickDriver {
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl TickDriver {
    /// Spawns the tick task. `global_tick` runs once per tick before any
    /// session's `on_update`; it is invoked on the tick task itself, so it
    /// should not block.
    pub fn spawn<T, F>(
        group: Arc<SessionGroup<T>>,
        period: Duration,
        mut global_tick: F,
    ) -> (TickDriver, tokio::task::JoinHandle<()>)
    where
        T: Ticked + 'static,
        F: FnMut(Duration) + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_rx = stop.clone();
        let stopped_flag = stopped.clone();

        group.set_running(true);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = tokio::time::Instant::now();
                        let dt = now.duration_since(last);
                        last = now;
                        global_tick(dt);
                        group.broadcast(|session| session.on_update(dt));
                    }
                    _ = stop_rx.notified() => break,
                }
            }
            group.set_running(false);
            stopped_flag.store(true, Ordering::Release);
            debug!("tick driver stopped");
        });

        (TickDriver { stop, stopped }, join)
    }

    /// Signals the tick task to stop after its current iteration.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingSession(AtomicU32);
    impl Ticked for CountingSession {
        fn on_update(&self, _dt: Duration) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ticks_every_session_and_stops_cleanly() {
        let group: Arc<SessionGroup<CountingSession>> = Arc::new(SessionGroup::new());
        group.add(1, Arc::new(CountingSession(AtomicU32::new(0)))).unwrap();

        let ticks = Arc::new(AtomicU32::new(0));
        let ticks2 = ticks.clone();
        let (driver, join) =
            TickDriver::spawn(group.clone(), Duration::from_millis(5), move |_dt| {
                ticks2.fetch_add(1, Ordering::SeqCst);
            });

        tokio::time::sleep(Duration::from_millis(30)).await;
        driver.stop();
        join.await.unwrap();

        assert!(driver.is_stopped());
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        let session = group.get(1).unwrap();
        assert!(session.0.load(Ordering::SeqCst) >= 2);
    }
}
