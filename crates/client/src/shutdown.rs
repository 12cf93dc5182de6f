//! Process-wide cancellation token.
//!
//! One token propagates shutdown to every session task and worker thread;
//! blocking loops either `select!` on [`ShutdownToken::wait`] or poll
//! [`ShutdownToken::is_triggered`] at least once a second.

use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone; treat as shutdown.
                return;
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let token = ShutdownToken::new();
        assert!(!token.is_triggered());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait().await })
        };
        token.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_triggered());
    }
}
