//! Path exclusions.
//!
//! [`Exclusions`] holds paths the adaptor is writing or deleting right now so
//! the watcher does not echo its own changes back as external edits.
//! [`IgnoreRules`] holds the permanent, pattern-based exclusions of a root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use parking_lot::Mutex;

use super::error::WatchError;

/// Temporarily excluded paths, shared by the adaptor and the watcher.
///
/// An entry without a deadline is excluded until a release is scheduled.
/// An entry with a deadline stays excluded until that instant passes.
#[derive(Debug, Clone)]
pub struct Exclusions {
    entries: Arc<Mutex<HashMap<PathBuf, Option<Instant>>>>,
    inclusion_delay: Duration,
}

impl Exclusions {
    pub fn new(inclusion_delay: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            inclusion_delay,
        }
    }

    pub fn inclusion_delay(&self) -> Duration {
        self.inclusion_delay
    }

    /// Exclude `path` immediately, cancelling any scheduled release.
    pub fn exclude(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        crate::debug_event!("exclusions", "exclude", "{}", path.display());
        self.entries.lock().insert(path, None);
    }

    /// Release `path` after the inclusion delay.
    pub fn schedule_inclusion(&self, path: &Path) {
        self.schedule_inclusion_at(path, Instant::now() + self.inclusion_delay);
    }

    /// Release `path` at `at`. No-op for paths that are not excluded.
    pub fn schedule_inclusion_at(&self, path: &Path, at: Instant) {
        if let Some(release) = self.entries.lock().get_mut(path) {
            *release = Some(at);
        }
    }

    /// Whether `path` is excluded at `now`. Expired entries are dropped.
    pub fn is_excluded(&self, path: &Path, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            None => false,
            Some(None) => true,
            Some(Some(release)) if now < *release => true,
            Some(Some(_)) => {
                entries.remove(path);
                false
            }
        }
    }

    /// Drop every entry whose release time has passed.
    pub fn purge_expired(&self, now: Instant) {
        self.entries
            .lock()
            .retain(|_, release| release.is_none_or(|at| now < at));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Gitignore-style patterns a root never reports events for.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    root: PathBuf,
    matcher: Gitignore,
}

impl IgnoreRules {
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self, WatchError> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| WatchError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
        }
        let matcher = builder.build().map_err(|e| WatchError::InvalidPattern {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            matcher,
        })
    }

    /// Rules that ignore nothing.
    pub fn empty(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            matcher: Gitignore::empty(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` or any of its parents is ignored.
    pub fn is_ignored(&self, path: &Path) -> bool {
        // The matcher panics on paths outside its root.
        if !path.starts_with(&self.root) {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(path, path.is_dir())
            .is_ignore()
    }
}
