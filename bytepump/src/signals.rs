//! Job-wide shutdown signaling.
//!
//! Every task holds a clone of [`Shutdown`]; any holder may signal, all
//! holders observe. Workers check [`Shutdown::is_signaled`] between chunks
//! and select on [`Shutdown::recv`] while waiting, so a signal is never
//! observed mid-write.

use std::sync::Arc;

use tokio::sync::watch;

/// A clonable shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a new, unsignaled [`Shutdown`].
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signal every holder. Idempotent.
    pub fn signal(&self) {
        // Send only fails with no receivers and we hold one ourselves.
        let _ = self.sender.send(true);
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until the signal fires.
    pub async fn recv(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_clones_observe_a_signal() {
        let shutdown = Shutdown::new();
        let mut observer = shutdown.clone();
        assert!(!observer.is_signaled());

        shutdown.signal();
        observer.recv().await;
        assert!(observer.is_signaled());
    }

    #[tokio::test]
    async fn recv_after_signal_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.signal();
        let mut late = shutdown.clone();
        late.recv().await;
    }
}
