//! Cooperative shutdown shared by all workflow runs.

use tokio::sync::watch;

/// Owner side: flips every [`ShutdownSignal`] to triggered.
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, ShutdownSignal { receiver })
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Observer side, cheap to clone into every run.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown is triggered. Pends forever if the trigger was
    /// dropped without firing.
    pub async fn wait(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let (trigger, mut signal) = ShutdownTrigger::new();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move {
            signal.wait().await;
        });
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_trigger() {
        let (trigger, _signal) = ShutdownTrigger::new();
        trigger.trigger();
        assert!(trigger.signal().is_triggered());
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let mut signal = ShutdownSignal::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.wait()).await;
        assert!(waited.is_err());
    }
}
