//! Shutdown signalling.
//!
//! A single flag, set once. The accept loop awaits it; tunnel relays poll it
//! at every poll boundary.

use tokio::sync::watch;

/// The sending side, held by whoever may stop the proxy.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Sets the flag. Idempotent.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Returns a new listener observing this signal.
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing side, cloned into every task that must stop.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once the flag is set. Cancel-safe.
    pub async fn wait(&mut self) {
        // An error means every signal was dropped; nothing can stop us after that.
        let orphaned = self.receiver.wait_for(|stopped| *stopped).await.is_err();
        if orphaned {
            std::future::pending::<()>().await;
        }
    }
}
