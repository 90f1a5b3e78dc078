//! Raw change sources.
//!
//! A [`ChangeSource`] watches one root recursively and forwards normalized
//! [`RawEvent`]s to a sink. [`NotifySource`] is the native implementation on
//! top of `notify`; tests inject their own sources.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;

use super::error::WatchError;
use super::exclusions::IgnoreRules;

/// A filesystem change reduced to what the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl RawEvent {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Created(p) | Self::Modified(p) | Self::Removed(p) => vec![p.as_path()],
            Self::Renamed { from, to } => vec![from.as_path(), to.as_path()],
        }
    }
}

/// Receives events from a source. Called from the source's own thread.
pub type EventSink = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// Creates one source per watched root.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn ChangeSource> + Send + Sync>;

/// Recursive watch over one root.
pub trait ChangeSource: Send {
    fn start(&mut self, root: &Path, sink: EventSink) -> Result<(), WatchError>;

    fn stop(&mut self);

    /// Replace the permanent ignore patterns applied before forwarding.
    fn update_exclusions(&mut self, patterns: &[String]) -> Result<(), WatchError>;
}

/// Change source backed by the platform watcher.
#[derive(Default)]
pub struct NotifySource {
    watcher: Option<notify::RecommendedWatcher>,
    root: Option<PathBuf>,
    patterns: Vec<String>,
    rules: Arc<RwLock<Option<IgnoreRules>>>,
}

impl NotifySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing fresh notify-backed sources.
    pub fn factory() -> SourceFactory {
        Arc::new(|| Box::new(NotifySource::new()) as Box<dyn ChangeSource>)
    }

    fn rebuild_rules(&self) -> Result<(), WatchError> {
        if let Some(root) = &self.root {
            *self.rules.write() = Some(IgnoreRules::new(root, &self.patterns)?);
        }
        Ok(())
    }
}

impl ChangeSource for NotifySource {
    fn start(&mut self, root: &Path, sink: EventSink) -> Result<(), WatchError> {
        self.root = Some(root.to_path_buf());
        self.rebuild_rules()?;

        let rules = Arc::clone(&self.rules);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let guard = rules.read();
                    for raw in convert(event) {
                        let ignored = guard
                            .as_ref()
                            .is_some_and(|r| raw.paths().iter().all(|p| r.is_ignored(p)));
                        if !ignored {
                            sink(raw);
                        }
                    }
                }
                Err(e) => tracing::error!("[watcher] file watch error: {e}"),
            }
        })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;

        crate::debug_event!("watcher", "watching", "{}", root.display());
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop(&mut self) {
        if let (Some(mut watcher), Some(root)) = (self.watcher.take(), self.root.as_ref()) {
            if let Err(e) = watcher.unwatch(root) {
                crate::debug_event!("watcher", "unwatch failed", "{}: {e}", root.display());
            }
        }
    }

    fn update_exclusions(&mut self, patterns: &[String]) -> Result<(), WatchError> {
        self.patterns = patterns.to_vec();
        self.rebuild_rules()
    }
}

/// Map a notify event onto zero or more raw events.
pub fn convert(event: Event) -> Vec<RawEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(_) => paths.into_iter().map(RawEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(RawEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut paths = paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![RawEvent::Renamed { from, to }],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(RawEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(RawEvent::Created).collect()
        }
        // Platforms that cannot tell the two sides of a rename apart.
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|p| {
                if p.exists() {
                    RawEvent::Created(p)
                } else {
                    RawEvent::Removed(p)
                }
            })
            .collect(),
        EventKind::Modify(_) => paths.into_iter().map(RawEvent::Modified).collect(),
        _ => Vec::new(),
    }
}
