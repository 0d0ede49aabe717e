//! Process wide shutdown signalling.
//!
//! A single [`Shutdown`] value is owned by the supervisor. Every worker loop holds a
//! [`ShutdownListener`], and observes the signal at its next suspension point. The signal fans out
//! through a broadcast channel, so triggering it once is sufficient to stop every loop.

use tokio::sync::broadcast;

/// Fan-out shutdown signal for all background loops.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Create a new listener for this signal. Listeners created after [`Shutdown::trigger`] was
    /// called resolve immediately.
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
            triggered: false,
        }
    }

    /// Signal every listener to stop.
    pub fn trigger(&self) {
        // An error here means there are no listeners left, which is fine.
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle observing a [`Shutdown`] signal.
pub struct ShutdownListener {
    rx: broadcast::Receiver<()>,
    triggered: bool,
}

impl ShutdownListener {
    /// Wait until the shutdown signal fires. Returns immediately on every call after the first
    /// observation.
    pub async fn recv(&mut self) {
        if self.triggered {
            return;
        }
        // Both a received value and a closed or lagged channel mean we should stop.
        let _ = self.rx.recv().await;
        self.triggered = true;
    }
}

#[cfg(test)]
mod tests {
    use super::Shutdown;
    use std::time::Duration;

    #[tokio::test]
    async fn listeners_observe_trigger() {
        let shutdown = Shutdown::new();
        let mut l1 = shutdown.subscribe();
        let mut l2 = shutdown.subscribe();

        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), l1.recv())
            .await
            .expect("listener 1 observes shutdown");
        tokio::time::timeout(Duration::from_secs(1), l2.recv())
            .await
            .expect("listener 2 observes shutdown");
    }

    #[tokio::test]
    async fn recv_is_idempotent() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();
        shutdown.trigger();

        listener.recv().await;
        // A second call must not block.
        tokio::time::timeout(Duration::from_secs(1), listener.recv())
            .await
            .expect("second recv resolves immediately");
    }
}
