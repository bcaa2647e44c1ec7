//! Graceful shutdown handling
//!
//! A one-way latch shared by the elector, the worker loops and the HTTP
//! server. Listeners created after the latch closes still observe it.

use tokio::sync::watch;
use tracing::info;

/// Process-wide shutdown latch
#[derive(Clone)]
pub struct ShutdownSignal {
    latch: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (latch, _) = watch::channel(false);
        Self { latch }
    }

    /// Close the latch; later calls are no-ops
    pub fn shutdown(&self) {
        self.latch.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    pub fn is_triggered(&self) -> bool {
        *self.latch.borrow()
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            latch: self.latch.subscribe(),
        }
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&self) {
        self.subscribe().recv().await;
    }

    /// Close the latch on Ctrl-C
    pub async fn trigger_on_ctrl_c(&self) {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        }
        self.shutdown();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half held by each long-running loop
pub struct ShutdownListener {
    latch: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once the latch is closed; cancel safe
    pub async fn recv(&mut self) {
        // The sender lives in every ShutdownSignal clone; if all are gone
        // nobody can trigger us any more, so treat it as shutdown.
        let _ = self.latch.wait_for(|closed| *closed).await;
    }
}
