use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Creates a bounded queue that favours the newest items.
///
/// The consumer side is a plain crossbeam [`Receiver`]. The producer never
/// blocks: pushing into a full queue evicts the oldest queued item.
pub fn freshness_queue<T>(capacity: usize) -> (FreshnessSender<T>, Receiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let sender = FreshnessSender {
        tx,
        evict_rx: rx.clone(),
        evicted: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

/// Producer half of a [`freshness_queue`].
///
/// Dropping it disconnects the queue once it is drained, like dropping a
/// crossbeam `Sender`.
pub struct FreshnessSender<T> {
    tx: Sender<T>,
    evict_rx: Receiver<T>,
    evicted: Arc<AtomicU64>,
}

impl<T> FreshnessSender<T> {
    /// Enqueues `item`, evicting the oldest items while the queue is full.
    ///
    /// Returns the number of items evicted by this push.
    pub fn push(&self, item: T) -> u64 {
        let mut item = item;
        let mut evicted_now = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    item = rejected;
                    // A consumer may empty the queue between the two calls;
                    // then nothing is evicted and the send is simply retried.
                    if self.evict_rx.try_recv().is_ok() {
                        evicted_now += 1;
                    }
                }
                // Unreachable while `evict_rx` lives; nothing to deliver to.
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        if evicted_now > 0 {
            self.evicted.fetch_add(evicted_now, Ordering::Relaxed);
        }
        evicted_now
    }

    /// Total items evicted over the queue's lifetime.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Handle that keeps reporting evictions after the sender is dropped.
    pub fn eviction_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.evicted)
    }

    /// Items currently waiting for the consumer.
    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}
