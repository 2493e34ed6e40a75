//! Per-key wait lists.
//!
//! A waiter registers under a correlation key and receives a oneshot
//! receiver. Dispatching a value for a key completes and drains every waiter
//! registered under that key at that moment; waiters that register later
//! wait for the next dispatch.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Map from correlation key to the pending completions for that key.
#[derive(Debug)]
pub struct WaitList<V> {
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<V>>>>,
}

impl<V> Default for WaitList<V> {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> WaitList<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<oneshot::Sender<V>>>> {
        // A poisoned wait list only means a dispatcher panicked mid-drain;
        // the remaining senders are still usable.
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues a waiter under `key`.
    pub fn register(&self, key: &str) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        self.lock().entry(key.to_string()).or_default().push(tx);
        rx
    }

    /// Completes and removes every waiter under `key`.
    ///
    /// Returns the number of waiters that actually received the value;
    /// waiters whose receiver was dropped are discarded silently.
    pub fn dispatch(&self, key: &str, value: V) -> usize {
        let Some(senders) = self.lock().remove(key) else {
            return 0;
        };
        senders
            .into_iter()
            .filter(|tx| !tx.is_closed())
            .filter_map(|tx| tx.send(value.clone()).ok())
            .count()
    }

    /// Number of live waiters under `key`.
    pub fn pending(&self, key: &str) -> usize {
        let mut waiters = self.lock();
        let Some(senders) = waiters.get_mut(key) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        let count = senders.len();
        if count == 0 {
            waiters.remove(key);
        }
        count
    }

    /// Whether any live waiter is registered under any key.
    pub fn is_empty(&self) -> bool {
        let mut waiters = self.lock();
        waiters.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
        waiters.is_empty()
    }

    /// Keys with at least one live waiter.
    pub fn keys(&self) -> Vec<String> {
        let mut waiters = self.lock();
        waiters.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
        waiters.keys().cloned().collect()
    }
}
