//! One-shot signals.
//!
//! A [`Signal`] starts unfired and can be fired exactly once; firing again is
//! a no-op. Every clone observes the same state, waiting on an already fired
//! signal returns immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        let mut first = false;
        self.tx.send_if_modified(|fired| {
            if *fired {
                return false;
            }
            *fired = true;
            first = true;
            true
        });
        first
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Wait at most `timeout`. Returns whether the signal fired.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_is_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn wait_returns_once_fired() {
        let signal = Signal::new();
        let clone = signal.clone();

        let waiter = tokio::spawn(async move { clone.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        signal.fire();
        waiter.await.unwrap();

        // already fired
        signal.wait().await;
    }

    #[tokio::test]
    async fn wait_timeout_reports_expiry() {
        let signal = Signal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)).await);
        signal.fire();
        assert!(signal.wait_timeout(Duration::from_millis(10)).await);
    }
}
