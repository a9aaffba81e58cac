//! Keyed debouncing of delayed work.
//!
//! Scheduling work for a key cancels whatever was still pending for that key
//! and starts the delay over, so a burst of calls within the window runs
//! only the last one.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Debouncer<K> {
    window: Duration,
    pending: Arc<Mutex<HashMap<K, (u64, JoinHandle<()>)>>>,
    next_ticket: Arc<AtomicU64>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self {
            window: self.window,
            pending: Arc::clone(&self.pending),
            next_ticket: Arc::clone(&self.next_ticket),
        }
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: Arc::new(AtomicU64::new(0)),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<K, (u64, JoinHandle<()>)>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `work` after the window unless `key` is scheduled again first.
    pub fn schedule<F>(&self, key: K, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let window = self.window;
        let pending = Arc::clone(&self.pending);
        let task_key = key.clone();
        let mut map = self.pending();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Leave the map before running so a reschedule during `work`
            // cannot abort it halfway.
            {
                let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
                match map.get(&task_key) {
                    Some((t, _)) if *t == ticket => {
                        map.remove(&task_key);
                    }
                    _ => return,
                }
            }
            work.await;
        });

        if let Some((_, previous)) = map.insert(key, (ticket, handle)) {
            previous.abort();
        }
    }

    /// Keys still waiting out their window.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Drops all pending work without running it.
    pub fn cancel_all(&self) {
        for (_, (_, handle)) in self.pending().drain() {
            handle.abort();
        }
    }
}
