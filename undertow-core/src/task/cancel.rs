//! Caller-driven cancellation of stream sessions.

use tokio::sync::watch;

/// Owning side of a cancellation pair. Dropping it never cancels.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

/// Observing side of a cancellation pair, cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelHandle {
    /// Creates a linked handle and signal.
    pub fn new() -> (Self, CancelSignal) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, CancelSignal { receiver })
    }

    /// Requests cancellation. Repeated calls are no-ops.
    pub fn cancel(&self) {
        self.sender.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that can never fire.
    pub fn never() -> Self {
        let (handle, signal) = CancelHandle::new();
        // The receiver reports the sender as closed, which `cancelled` treats as pending
        drop(handle);
        signal
    }

    #[cfg(test)]
    fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Pends forever if the handle was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let (handle, signal) = CancelHandle::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });

        handle.cancel();
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_never_cancels() {
        let signal = CancelSignal::never();

        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;

        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }
}
