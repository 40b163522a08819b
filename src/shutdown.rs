//! One-shot shutdown tokens built on `tokio::sync::watch`.
//!
//! The driver uses two of these: one to request the listener close, and one
//! to cancel every outstanding background task. Dropping a trigger counts as
//! triggering it, so tasks never outlive whoever owns their trigger.

use tokio::sync::watch;

/// Create a trigger and a first signal subscribed to it.
pub fn pair() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Fire the trigger. Returns `true` only for the first call.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        })
    }

    #[cfg(test)]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once the trigger fires or is dropped.
    ///
    /// Cancel safe: a fresh call re-checks the current value first.
    pub async fn wait(&mut self) {
        // Err means the trigger was dropped.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    #[cfg(test)]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}
