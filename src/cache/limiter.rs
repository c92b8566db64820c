//! Bound on concurrent clone and update operations.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Counting semaphore over a bounded channel of permit tokens.
pub struct OperationLimiter {
    permits_tx: Sender<()>,
    permits_rx: Receiver<()>,
}

/// Returns its token to the limiter on drop.
pub struct Permit<'a> {
    permits_tx: &'a Sender<()>,
}

impl OperationLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (permits_tx, permits_rx) = bounded(capacity);
        for _ in 0..capacity {
            let _ = permits_tx.try_send(());
        }
        Self {
            permits_tx,
            permits_rx,
        }
    }

    /// Block until a permit is free.
    pub fn acquire(&self) -> Permit<'_> {
        // The limiter owns a sender, so the channel never disconnects.
        let _ = self.permits_rx.recv();
        Permit {
            permits_tx: &self.permits_tx,
        }
    }

    #[cfg(test)]
    fn try_acquire(&self) -> Option<Permit<'_>> {
        self.permits_rx.try_recv().ok().map(|()| Permit {
            permits_tx: &self.permits_tx,
        })
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits_rx.len()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.permits_rx.capacity().unwrap_or(0)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Err(TrySendError::Full(())) = self.permits_tx.try_send(()) {
            log::warn!("operation limiter received more permits than its capacity");
        }
    }
}
