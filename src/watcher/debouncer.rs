//! Keyed deadline timers driven by an explicit clock.
//!
//! Used for the delete grace period (keyed by path), the per-root VCS
//! notifications (keyed by root) and the single sync signal (keyed by `()`).
//! Recording a key again pushes its deadline back.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Debouncer<K> {
    /// Pending keys: key -> deadline.
    pending: HashMap<K, Instant>,
    duration: Duration,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(duration: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            duration,
        }
    }

    /// Record activity for `key` at `now`, resetting its timer.
    ///
    /// Returns true when the key was already pending.
    pub fn record(&mut self, key: K, now: Instant) -> bool {
        self.pending.insert(key, now + self.duration).is_some()
    }

    /// Cancel a pending key. Returns true when something was cancelled.
    pub fn remove(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Cancel every pending key matching `predicate`.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&K) -> bool) {
        self.pending.retain(|key, _| !predicate(key));
    }

    /// Take all keys whose deadline has passed at `now`.
    pub fn take_ready(&mut self, now: Instant) -> Vec<K> {
        let mut ready = Vec::new();

        self.pending.retain(|key, deadline| {
            if *deadline <= now {
                ready.push(key.clone());
                false
            } else {
                true
            }
        });

        ready
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
