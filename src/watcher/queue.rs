//! Pending change queues handed to the synchronizer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::Serialize;

use crate::document::Fields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Add,
    Change,
    Delete,
}

/// One externally observed change.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub kind: ChangeKind,
    /// Fields parsed at detection time, when caching is enabled.
    pub cached_fields: Option<Fields>,
}

impl PendingChange {
    pub fn deleted(absolute_path: impl Into<PathBuf>, relative_path: impl Into<PathBuf>) -> Self {
        Self {
            absolute_path: absolute_path.into(),
            relative_path: relative_path.into(),
            kind: ChangeKind::Delete,
            cached_fields: None,
        }
    }
}

/// Titles drained from the queue in one call.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DrainedChanges {
    pub modifications: Vec<String>,
    pub deletions: Vec<String>,
}

impl DrainedChanges {
    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty() && self.deletions.is_empty()
    }
}

/// Modification and deletion titles in arrival order, deduplicated.
///
/// A title sits in at most one of the two queues: the latest change wins.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    modifications: IndexSet<String>,
    deletions: IndexSet<String>,
    loads: HashMap<String, PendingChange>,
    removals: HashMap<String, PendingChange>,
}

pub type SharedQueue = Arc<Mutex<ChangeQueue>>;

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedQueue {
        Arc::new(Mutex::new(self))
    }

    /// Queue a modification. Later changes to the same title overwrite the
    /// pending load data.
    pub fn queue_modification(&mut self, title: impl Into<String>, change: PendingChange) {
        let title = title.into();
        self.deletions.shift_remove(&title);
        self.removals.remove(&title);
        self.loads.insert(title.clone(), change);
        self.modifications.insert(title);
    }

    pub fn queue_deletion(&mut self, title: impl Into<String>, change: PendingChange) {
        let title = title.into();
        self.modifications.shift_remove(&title);
        self.loads.remove(&title);
        self.removals.insert(title.clone(), change);
        self.deletions.insert(title);
    }

    /// Return and clear both title queues. Load data stays until consumed.
    pub fn drain(&mut self) -> DrainedChanges {
        self.removals.clear();
        DrainedChanges {
            modifications: std::mem::take(&mut self.modifications).into_iter().collect(),
            deletions: std::mem::take(&mut self.deletions).into_iter().collect(),
        }
    }

    /// Consume the pending load for `title`.
    pub fn take_load(&mut self, title: &str) -> Option<PendingChange> {
        self.loads.remove(title)
    }

    /// The change queued for `title`, whichever queue holds it.
    pub fn pending(&self, title: &str) -> Option<&PendingChange> {
        if self.deletions.contains(title) {
            self.removals.get(title)
        } else if self.modifications.contains(title) {
            self.loads.get(title)
        } else {
            None
        }
    }

    pub fn is_modified(&self, title: &str) -> bool {
        self.modifications.contains(title)
    }

    pub fn is_deleted(&self, title: &str) -> bool {
        self.deletions.contains(title)
    }

    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty() && self.deletions.is_empty()
    }

    pub fn clear(&mut self) {
        self.modifications.clear();
        self.deletions.clear();
        self.loads.clear();
        self.removals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, text: &str) -> PendingChange {
        let mut fields = Fields::new();
        fields.insert("text".to_string(), text.to_string());
        PendingChange {
            absolute_path: PathBuf::from(path),
            relative_path: PathBuf::from(path.trim_start_matches("/r/")),
            kind: ChangeKind::Change,
            cached_fields: Some(fields),
        }
    }

    #[test]
    fn test_dedup_keeps_latest_load() {
        let mut queue = ChangeQueue::new();
        queue.queue_modification("A", change("/r/a.tid", "one"));
        queue.queue_modification("B", change("/r/b.tid", "x"));
        queue.queue_modification("A", change("/r/a.tid", "two"));

        let drained = queue.drain();
        assert_eq!(drained.modifications, vec!["A", "B"]);
        assert!(drained.deletions.is_empty());

        let load = queue.take_load("A").unwrap();
        assert_eq!(load.cached_fields.unwrap()["text"], "two");
        assert!(queue.take_load("A").is_none());
    }

    #[test]
    fn test_latest_change_wins_between_queues() {
        let mut queue = ChangeQueue::new();
        queue.queue_modification("A", change("/r/a.tid", "one"));
        queue.queue_deletion("A", PendingChange::deleted("/r/a.tid", "a.tid"));
        assert!(queue.is_deleted("A"));
        assert!(!queue.is_modified("A"));
        assert!(queue.take_load("A").is_none());
        assert_eq!(queue.pending("A").unwrap().kind, ChangeKind::Delete);

        queue.queue_modification("A", change("/r/a.tid", "back"));
        assert_eq!(queue.pending("A").unwrap().kind, ChangeKind::Change);
        let drained = queue.drain();
        assert_eq!(drained.modifications, vec!["A"]);
        assert!(drained.deletions.is_empty());
    }

    #[test]
    fn test_drain_clears_queues() {
        let mut queue = ChangeQueue::new();
        queue.queue_deletion("Gone", PendingChange::deleted("/r/gone.tid", "gone.tid"));
        assert!(!queue.drain().is_empty());
        assert!(queue.pending("Gone").is_none());
        assert!(queue.drain().is_empty());
        assert!(queue.is_empty());
    }
}
