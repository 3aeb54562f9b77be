//! Keyed single-flight cache
//!
//! Maps a content digest to a lazily-computed value. At most one
//! computation runs per key at a time; every caller that arrives while it
//! is in flight waits for it and shares its outcome.
//!
//! # Entry States
//!
//! | State | `get` | `get_or_initialize` |
//! |-------|-------|---------------------|
//! | Absent | `None` | caller becomes owner, runs `compute` |
//! | Pending | `None` | caller waits for the owner's outcome |
//! | Ready | `Some(v)` | returns `v`, no computation |
//!
//! Failures are never memoized: the owner removes the entry before
//! publishing the error, so the next caller retries.

pub mod volume;

pub use volume::CacheVolume;

use crate::digest::ContentDigest;
use crate::error::{CorralError, CorralResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Published result of one computation, shared by the owner and all waiters
type Outcome<V> = Result<V, Arc<CorralError>>;

enum Entry<V> {
    /// A computation is in flight; its outcome arrives on this channel
    Pending(watch::Receiver<Option<Outcome<V>>>),
    Ready(V),
}

/// What a caller does after inspecting the map
enum Claim<V> {
    Own(watch::Sender<Option<Outcome<V>>>),
    Wait(watch::Receiver<Option<Outcome<V>>>),
}

/// Generic content-addressed cache with per-key single-flight computation
pub struct KeyedCache<V> {
    entries: Mutex<HashMap<ContentDigest, Entry<V>>>,
}

impl<V: Clone> KeyedCache<V> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get a ready value without computing anything
    pub fn get(&self, key: &ContentDigest) -> Option<V> {
        match self.entries.lock().get(key) {
            Some(Entry::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Whether a computation for `key` is currently in flight
    pub fn is_pending(&self, key: &ContentDigest) -> bool {
        matches!(self.entries.lock().get(key), Some(Entry::Pending(_)))
    }

    /// Number of entries (ready or pending)
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop a ready value so the next caller recomputes it
    ///
    /// Pending entries are left alone; they belong to their owner.
    pub fn invalidate(&self, key: &ContentDigest) -> Option<V> {
        let mut entries = self.entries.lock();
        if matches!(entries.get(key), Some(Entry::Ready(_))) {
            if let Some(Entry::Ready(value)) = entries.remove(key) {
                return Some(value);
            }
        }
        None
    }

    /// Return the cached value for `key`, computing it if necessary
    ///
    /// If no entry exists, the caller becomes the owner and runs `compute`
    /// in its own task. If another caller's computation is in flight, this
    /// waits for it; `cancel` only aborts the waiting, never the owner's
    /// computation. An owner whose future is dropped before finishing
    /// withdraws its entry, and its waiters race to take over.
    pub async fn get_or_initialize<F, Fut>(
        &self,
        key: &ContentDigest,
        cancel: &CancellationToken,
        compute: F,
    ) -> CorralResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CorralResult<V>>,
    {
        let tx = loop {
            let claim = {
                let mut entries = self.entries.lock();
                match entries.get(key) {
                    Some(Entry::Ready(value)) => return Ok(value.clone()),
                    Some(Entry::Pending(rx)) => Claim::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        entries.insert(*key, Entry::Pending(rx));
                        Claim::Own(tx)
                    }
                }
            };

            match claim {
                Claim::Own(tx) => break tx,
                Claim::Wait(rx) => {
                    debug!("Waiting for in-flight computation of {}", key.short());
                    match wait_for_outcome(rx, cancel).await? {
                        Some(Ok(value)) => return Ok(value),
                        Some(Err(source)) => {
                            return Err(CorralError::Compute {
                                key: key.short(),
                                source,
                            })
                        }
                        // Owner went away without publishing; try again
                        None => continue,
                    }
                }
            }
        };

        let mut guard = PendingGuard {
            entries: &self.entries,
            key: *key,
            armed: true,
        };

        debug!("Computing {}", key.short());
        let result = compute().await;

        let mut entries = self.entries.lock();
        guard.armed = false;
        match result {
            Ok(value) => {
                entries.insert(*key, Entry::Ready(value.clone()));
                drop(entries);
                tx.send_replace(Some(Ok(value.clone())));
                Ok(value)
            }
            Err(e) => {
                entries.remove(key);
                drop(entries);
                debug!("Computation of {} failed: {}", key.short(), e);
                let source = Arc::new(e);
                tx.send_replace(Some(Err(Arc::clone(&source))));
                Err(CorralError::Compute {
                    key: key.short(),
                    source,
                })
            }
        }
    }
}

impl<V: Clone> Default for KeyedCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes an owner's pending entry if its computation is abandoned
struct PendingGuard<'a, V> {
    entries: &'a Mutex<HashMap<ContentDigest, Entry<V>>>,
    key: ContentDigest,
    armed: bool,
}

impl<V> Drop for PendingGuard<'_, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut entries = self.entries.lock();
        if matches!(entries.get(&self.key), Some(Entry::Pending(_))) {
            entries.remove(&self.key);
        }
    }
}

/// Wait until the owner publishes, the owner disappears, or `cancel` fires
///
/// Returns `Ok(None)` when the owner dropped its sender without publishing.
async fn wait_for_outcome<V: Clone>(
    mut rx: watch::Receiver<Option<Outcome<V>>>,
    cancel: &CancellationToken,
) -> CorralResult<Option<Outcome<V>>> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return Ok(Some(outcome));
        }

        let changed = tokio::select! {
            changed = rx.changed() => changed,
            _ = cancel.cancelled() => return Err(CorralError::Cancelled),
        };
        if changed.is_err() {
            return Ok(rx.borrow().clone());
        }
    }
}
