//! Periodic worker loops around the gossip engines.
//!
//! Every engine exposes two independently scheduled ticks, `send` and `receive`. A tick is
//! expected to handle its own failures: transient platform errors are logged and the loop simply
//! waits for the next tick, nothing short of shutdown stops a loop. Overlong ticks delay the next
//! tick, they never pile up.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::shutdown::ShutdownListener;

pub mod gateway;
pub mod node;
pub mod reservation;

/// Tick intervals per worker pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub gateway_send: Duration,
    pub gateway_recv: Duration,
    pub node_send: Duration,
    pub node_recv: Duration,
    pub reservation_send: Duration,
    pub reservation_recv: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            gateway_send: Duration::from_secs(60),
            gateway_recv: Duration::from_secs(10),
            node_send: Duration::from_secs(60),
            node_recv: Duration::from_secs(60),
            reservation_send: Duration::from_secs(4),
            reservation_recv: Duration::from_secs(10),
        }
    }
}

/// Run `tick` every `period` until the shutdown signal fires.
///
/// The first tick happens one period after spawning. The loop returns within one period of the
/// shutdown signal, or as soon as the running tick finishes.
pub fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: ShutdownListener,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The interval fires immediately on creation, swallow that so the first real tick lands
        // one period from now.
        timer.tick().await;

        debug!(worker = name, period = ?period, "worker loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = timer.tick() => tick().await,
            }
        }
        debug!(worker = name, "worker loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::shutdown::Shutdown;

    #[tokio::test(start_paused = true)]
    async fn ticks_fire_periodically() {
        let shutdown = Shutdown::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = spawn_ticker("test", Duration::from_secs(5), shutdown.subscribe(), {
            let counter = counter.clone();
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        shutdown.trigger();
        handle.await.expect("loop exits cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_fires_immediately() {
        let shutdown = Shutdown::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = spawn_ticker("test", Duration::from_secs(60), shutdown.subscribe(), {
            let counter = counter.clone();
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        shutdown.trigger();
        handle.await.expect("loop exits cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let shutdown = Shutdown::new();
        let handle = spawn_ticker(
            "test",
            Duration::from_secs(3600),
            shutdown.subscribe(),
            || async {},
        );

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop observes shutdown without waiting for a tick")
            .expect("loop exits cleanly");
    }
}
