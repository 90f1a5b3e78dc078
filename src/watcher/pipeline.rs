//! Event processing, driven by an explicit clock.
//!
//! The pipeline owns every watcher timer: delete grace periods, the sync
//! debounce and per-root VCS debounces. The async loop feeds it batches and
//! calls [`EventPipeline::tick`] at [`EventPipeline::next_deadline`]; tests
//! drive it with hand-picked instants instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indexmap::IndexSet;

use crate::config::WatchConfig;
use crate::document::codec::{self, CodecError};
use crate::document::{Fields, TITLE_FIELD};
use crate::index::{FileRecord, IndexError, SharedIndex};

use super::debouncer::Debouncer;
use super::error::WatchError;
use super::exclusions::{Exclusions, IgnoreRules};
use super::queue::{ChangeKind, PendingChange, SharedQueue};
use super::source::RawEvent;

/// Output of a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// External changes are queued for the synchronizer.
    Sync,
    /// Files changed under this root.
    Vcs(PathBuf),
}

/// Timer durations used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTiming {
    pub delete_grace: Duration,
    pub sync_debounce: Duration,
    pub vcs_debounce: Duration,
}

impl From<&WatchConfig> for PipelineTiming {
    fn from(config: &WatchConfig) -> Self {
        Self {
            delete_grace: config.delete_grace(),
            sync_debounce: config.sync_debounce(),
            vcs_debounce: config.vcs_debounce(),
        }
    }
}

/// A directory tree to watch and how to filter it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRoot {
    pub root: PathBuf,
    pub ignore_patterns: Vec<String>,
    pub ignore_symlinks: bool,
}

impl WatchRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore_patterns: Vec::new(),
            ignore_symlinks: false,
        }
    }

    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    pub fn with_ignore_symlinks(mut self, ignore: bool) -> Self {
        self.ignore_symlinks = ignore;
        self
    }

    pub fn rules(&self) -> Result<RootRules, WatchError> {
        Ok(RootRules {
            ignore: IgnoreRules::new(&self.root, &self.ignore_patterns)?,
            ignore_symlinks: self.ignore_symlinks,
        })
    }
}

/// Per-root filtering rules.
#[derive(Debug, Clone)]
pub struct RootRules {
    pub ignore: IgnoreRules,
    pub ignore_symlinks: bool,
}

impl RootRules {
    pub fn root(&self) -> &Path {
        self.ignore.root()
    }
}

pub struct EventPipeline {
    index: SharedIndex,
    queue: SharedQueue,
    exclusions: Exclusions,
    rules: HashMap<PathBuf, RootRules>,
    pending_deletes: Debouncer<PathBuf>,
    sync_timer: Debouncer<()>,
    vcs_timers: Debouncer<PathBuf>,
    cache_fields: bool,
}

impl EventPipeline {
    pub fn new(
        index: SharedIndex,
        queue: SharedQueue,
        exclusions: Exclusions,
        timing: PipelineTiming,
        cache_fields: bool,
    ) -> Self {
        Self {
            index,
            queue,
            exclusions,
            rules: HashMap::new(),
            pending_deletes: Debouncer::new(timing.delete_grace),
            sync_timer: Debouncer::new(timing.sync_debounce),
            vcs_timers: Debouncer::new(timing.vcs_debounce),
            cache_fields,
        }
    }

    /// Start processing events under `rules.root()`.
    pub fn add_root(&mut self, rules: RootRules) {
        let root = rules.root().to_path_buf();
        self.index.write().register_root(root.clone());
        self.rules.insert(root, rules);
    }

    /// Stop processing events under `root` and drop its index and timers.
    pub fn remove_root(&mut self, root: &Path) {
        self.rules.remove(root);
        self.index.write().deregister_root(root);
        self.pending_deletes.remove_where(|path| path.starts_with(root));
        self.vcs_timers.remove(&root.to_path_buf());
    }

    pub fn update_ignore(&mut self, root: &Path, ignore: IgnoreRules) {
        if let Some(rules) = self.rules.get_mut(root) {
            rules.ignore = ignore;
        }
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.rules.keys().map(PathBuf::as_path)
    }

    /// Process one batch of raw events.
    pub fn handle_batch(&mut self, events: Vec<RawEvent>, now: Instant) {
        let mut touched: IndexSet<PathBuf> = IndexSet::new();

        for event in events {
            match event {
                RawEvent::Created(path) | RawEvent::Modified(path) => {
                    touched.extend(self.upsert(&path, now));
                }
                RawEvent::Removed(path) => self.schedule_delete(&path, now),
                RawEvent::Renamed { from, to } => {
                    // Old side first so a same-title rename nets to a modification.
                    touched.extend(self.delete_now(&from, now));
                    touched.extend(self.upsert(&to, now));
                }
            }
        }

        self.arm(touched, now);
    }

    /// Fire expired timers. Returns the signals due at `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<Signal> {
        self.exclusions.purge_expired(now);

        let mut touched: IndexSet<PathBuf> = IndexSet::new();
        for path in self.pending_deletes.take_ready(now) {
            // Recreated without an event, or only the sidecar went away.
            if path.is_file() {
                touched.extend(self.upsert(&path, now));
            } else {
                touched.extend(self.delete_now(&path, now));
            }
        }
        self.arm(touched, now);

        let mut signals = Vec::new();
        if !self.sync_timer.take_ready(now).is_empty() {
            signals.push(Signal::Sync);
        }
        signals.extend(self.vcs_timers.take_ready(now).into_iter().map(Signal::Vcs));
        signals
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.pending_deletes.next_deadline(),
            self.sync_timer.next_deadline(),
            self.vcs_timers.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn pending_deletes(&self) -> usize {
        self.pending_deletes.pending_count()
    }

    /// Cancel every timer.
    pub fn cancel_all(&mut self) {
        self.pending_deletes.clear();
        self.sync_timer.clear();
        self.vcs_timers.clear();
    }

    fn arm(&mut self, roots: IndexSet<PathBuf>, now: Instant) {
        if roots.is_empty() {
            return;
        }
        self.sync_timer.record((), now);
        for root in roots {
            self.vcs_timers.record(root, now);
        }
    }

    /// Watched root whose rules apply to `path`, by longest prefix.
    fn rules_for(&self, path: &Path) -> Option<&RootRules> {
        self.rules
            .iter()
            .filter(|(root, _)| path.starts_with(root))
            .max_by_key(|(root, _)| root.components().count())
            .map(|(_, rules)| rules)
    }

    /// Map an event path to the document file it concerns, or None when the
    /// event must be dropped.
    fn admit(&self, path: &Path, now: Instant) -> Option<PathBuf> {
        let doc_path = codec::primary_for_sidecar(path).unwrap_or_else(|| path.to_path_buf());

        let Some(rules) = self.rules_for(&doc_path) else {
            crate::debug_event!("watcher", "outside roots", "{}", path.display());
            return None;
        };
        if rules.ignore.is_ignored(path) || rules.ignore.is_ignored(&doc_path) {
            return None;
        }
        if self.exclusions.is_excluded(path, now) || self.exclusions.is_excluded(&doc_path, now) {
            crate::debug_event!("watcher", "excluded", "{}", path.display());
            return None;
        }
        Some(doc_path)
    }

    fn schedule_delete(&mut self, path: &Path, now: Instant) {
        let Some(doc_path) = self.admit(path, now) else {
            return;
        };
        crate::debug_event!("watcher", "delete pending", "{}", doc_path.display());
        self.pending_deletes.record(doc_path, now);
    }

    /// Apply a deletion right away. Returns the owning root when a title was
    /// queued.
    fn delete_now(&mut self, path: &Path, now: Instant) -> Option<PathBuf> {
        let doc_path = self.admit(path, now)?;
        self.pending_deletes.remove(&doc_path);

        let mut index = self.index.write();
        let (root, relative) = index.split(&doc_path).ok()?;
        match index.title_at(&doc_path) {
            Ok(title) => {
                let bundled = index.bundled_at(&doc_path);
                index.remove_path(&doc_path);
                drop(index);
                crate::log_event!("watcher", "deleted", "'{title}' ({})", doc_path.display());
                let mut queue = self.queue.lock();
                let change = PendingChange::deleted(&doc_path, relative);
                queue.queue_deletion(title, change.clone());
                for other in bundled {
                    queue.queue_deletion(other, change.clone());
                }
                Some(root)
            }
            Err(IndexError::NotFound { .. }) => {
                // Moved elsewhere, or never tracked.
                crate::debug_event!("watcher", "untracked delete", "{}", doc_path.display());
                None
            }
            Err(e) => {
                crate::debug_event!("watcher", "delete skipped", "{e}");
                None
            }
        }
    }

    /// Read a created or modified file and queue its documents. Returns the
    /// owning root when anything was queued.
    fn upsert(&mut self, path: &Path, now: Instant) -> Option<PathBuf> {
        let doc_path = self.admit(path, now)?;

        if self.pending_deletes.remove(&doc_path) {
            crate::debug_event!("watcher", "delete cancelled", "{}", doc_path.display());
        }

        let ignore_symlinks = self.rules_for(&doc_path)?.ignore_symlinks;
        let metadata = std::fs::symlink_metadata(&doc_path).ok()?;
        if metadata.file_type().is_symlink() && ignore_symlinks {
            crate::debug_event!("watcher", "symlink skipped", "{}", doc_path.display());
            return None;
        }
        if !doc_path.is_file() {
            return None;
        }

        let documents = match codec::read_documents(&doc_path) {
            Ok(documents) => documents,
            Err(CodecError::Unsupported { .. }) => {
                crate::debug_event!("watcher", "unsupported", "{}", doc_path.display());
                return None;
            }
            Err(e) => {
                tracing::warn!("[watcher] skipping unreadable file: {e}");
                return None;
            }
        };

        self.record_documents(&doc_path, documents)
    }

    fn record_documents(&mut self, doc_path: &Path, documents: Vec<Fields>) -> Option<PathBuf> {
        let first = documents.first()?;
        let record = FileRecord::discovered(doc_path, first);

        let titles: Vec<String> = documents
            .iter()
            .map(|fields| record_title(fields).to_string())
            .collect();

        let (root, relative, kind, displaced, dropped) = {
            let mut index = self.index.write();
            let (root, relative) = index.split(doc_path).ok()?;
            let previous = index.bundled_at(doc_path);
            let kind = if index.record_at(doc_path).is_some() {
                ChangeKind::Change
            } else {
                ChangeKind::Add
            };
            // Titles of a multi-document file share its path; only the
            // first one is tracked, the rest are kept as bundled titles.
            let displaced = match index.insert(record) {
                Ok(displaced) => displaced,
                Err(e) => {
                    tracing::warn!("[watcher] cannot index {}: {e}", doc_path.display());
                    return None;
                }
            };
            index.set_bundled(doc_path, titles[1..].to_vec());
            let dropped: Vec<String> = previous
                .into_iter()
                .filter(|title| !titles.contains(title))
                .collect();
            (root, relative, kind, displaced, dropped)
        };

        let mut queue = self.queue.lock();
        if let Some(old) = displaced {
            crate::log_event!(
                "watcher",
                "retitled",
                "'{}' -> '{}'",
                old.title,
                record_title(first)
            );
            let change = PendingChange::deleted(old.absolute_path, old.relative_path);
            queue.queue_deletion(old.title, change);
        }
        for title in dropped {
            crate::log_event!("watcher", "removed from file", "'{title}'");
            queue.queue_deletion(title, PendingChange::deleted(doc_path, &relative));
        }

        for (fields, title) in documents.into_iter().zip(titles) {
            crate::log_event!("watcher", "changed", "'{title}' ({kind:?})");
            queue.queue_modification(
                title,
                PendingChange {
                    absolute_path: doc_path.to_path_buf(),
                    relative_path: relative.clone(),
                    kind,
                    cached_fields: self.cache_fields.then_some(fields),
                },
            );
        }

        Some(root)
    }
}

fn record_title(fields: &Fields) -> &str {
    fields.get(TITLE_FIELD).map_or("", String::as_str)
}
