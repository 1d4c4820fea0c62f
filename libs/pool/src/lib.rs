//! Connection pool primitives.
//!
//! A [`Pool`] is a keyed container of connection handles with an optional
//! capacity bound. It knows nothing about proxying; the proxy engine keeps
//! two of them (available and busy) and moves handles between them.
//!
//! # Invariants
//!
//! - `size() <= cap()` whenever `cap() > 0`
//! - A key is present at most once; `put` of a present key is rejected
//! - `pop`, `pop_any` and `remove` never hand the same key to two callers
//!
//! All operations take the internal lock exactly once, so callers never need
//! their own external lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Capacity value meaning "no upper bound".
pub const UNBOUNDED: usize = 0;

/// Pool errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool already holds `capacity` entries.
    #[error("pool capacity exceeded (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    /// The key is already present in the pool.
    #[error("key is already present in the pool")]
    DuplicateKey,
}

/// A capacity-bounded, internally synchronized map of connection handles.
///
/// Values are handed out by clone, so they are typically `Arc`s.
#[derive(Debug)]
pub struct Pool<K, V> {
    capacity: usize,
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Pool<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty pool. A `capacity` of [`UNBOUNDED`] disables the bound.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Create an empty pool without a capacity bound.
    pub fn unbounded() -> Self {
        Self::new(UNBOUNDED)
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new entry.
    pub fn put(&self, key: K, value: V) -> Result<(), PoolError> {
        let mut entries = self.lock();
        if self.capacity != UNBOUNDED && entries.len() >= self.capacity {
            return Err(PoolError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if entries.contains_key(&key) {
            return Err(PoolError::DuplicateKey);
        }
        entries.insert(key, value);
        Ok(())
    }

    /// Remove and return the entry for `key`.
    pub fn pop(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    /// Remove and return an arbitrary entry.
    ///
    /// Choosing and removing happen under one lock, so two concurrent callers
    /// can never be handed the same entry.
    pub fn pop_any(&self) -> Option<(K, V)> {
        let mut entries = self.lock();
        let key = entries.keys().next().cloned()?;
        entries.remove(&key).map(|value| (key, value))
    }

    /// Return a clone of the entry for `key` without removing it.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// Check whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Remove the entry for `key`. Returns `false` if it was not present.
    pub fn remove(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Visit every entry until the visitor breaks.
    ///
    /// The visitor runs on a snapshot taken under the lock and is called
    /// without holding it, so it may mutate the pool (including removing the
    /// entry being visited). Order is unspecified.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let snapshot: Vec<(K, V)> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, value) in &snapshot {
            if visit(key, value).is_break() {
                break;
            }
        }
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Check if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Configured capacity ([`UNBOUNDED`] if none).
    pub fn cap(&self) -> usize {
        self.capacity
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<K, V> Default for Pool<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::unbounded()
    }
}
