//! Replay-last broadcast cell.
//!
//! Holds one current value and fans every published value out to any number
//! of subscribers. A new subscriber sees the current value first, then every
//! later value in publish order. Publishing never waits on subscribers: a
//! subscriber that falls more than the channel capacity behind skips ahead
//! to the latest value instead.

use futures::Stream;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Per-cell channel capacity before a slow subscriber starts skipping.
pub const DEFAULT_CAPACITY: usize = 64;

struct Shared<T> {
    current: T,
    tx: broadcast::Sender<T>,
}

/// Single current value plus live fan-out.
pub struct ReplayBroadcast<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for ReplayBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> ReplayBroadcast<T> {
    pub fn new(initial: T) -> Self {
        Self::with_capacity(initial, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(initial: T, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Mutex::new(Shared { current: initial, tx })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the current value and notifies subscribers.
    pub fn publish(&self, value: T) {
        let mut shared = self.lock();
        shared.current = value.clone();
        // No receivers is fine; the value is still kept as current.
        let _ = shared.tx.send(value);
    }

    /// Publishes only if `update` returns a new value for the current one.
    /// Returns whether anything was published.
    pub fn publish_if(&self, update: impl FnOnce(&T) -> Option<T>) -> bool {
        let mut shared = self.lock();
        match update(&shared.current) {
            Some(value) => {
                shared.current = value.clone();
                let _ = shared.tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> T {
        self.lock().current.clone()
    }

    /// Subscribes. The current value and the receiver are taken under the
    /// same lock as `publish`, so nothing is missed or repeated.
    pub fn subscribe(&self) -> Subscription<T> {
        let shared = self.lock();
        Subscription {
            pending: Some(shared.current.clone()),
            rx: shared.tx.subscribe(),
            source: self.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().tx.receiver_count()
    }
}

/// One subscriber's view of a [`ReplayBroadcast`].
pub struct Subscription<T> {
    pending: Option<T>,
    rx: broadcast::Receiver<T>,
    source: ReplayBroadcast<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Value the cell holds right now.
    pub fn current(&self) -> T {
        self.source.current()
    }

    /// Next value: the replayed current value first, then live updates.
    ///
    /// A subscription keeps its cell alive, so this only yields `None` if the
    /// channel is torn down; drop the subscription to unsubscribe.
    pub async fn next(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        match self.rx.recv().await {
            Ok(value) => Some(value),
            Err(broadcast::error::RecvError::Lagged(_)) => Some(self.skip_to_latest()),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Returns an already-published value without waiting, if any.
    pub fn try_next(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(broadcast::error::TryRecvError::Lagged(_)) => Some(self.skip_to_latest()),
            Err(_) => None,
        }
    }

    /// Drops the backlog and continues from the latest value.
    fn skip_to_latest(&mut self) -> T {
        let shared = self.source.lock();
        self.rx = shared.tx.subscribe();
        shared.current.clone()
    }

    pub fn into_stream(self) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|value| (value, sub))
        })
    }
}
