//! The watcher event loop and its control handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
use crate::document::{Fields, codec};
use crate::index::SharedIndex;

use super::collaborators::{NoVcs, SyncTarget, VcsNotifier, VcsNotifyOptions};
use super::error::WatchError;
use super::exclusions::{Exclusions, IgnoreRules};
use super::pipeline::{EventPipeline, PipelineTiming, Signal, WatchRoot};
use super::queue::{ChangeQueue, DrainedChanges, SharedQueue};
use super::source::{ChangeSource, EventSink, NotifySource, RawEvent, SourceFactory};

/// Lifecycle of one watched root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchState {
    Stopped,
    Starting,
    Watching,
}

type SharedStates = Arc<RwLock<HashMap<PathBuf, WatchState>>>;

#[derive(Debug)]
enum Command {
    AddRoot(WatchRoot),
    RemoveRoot(PathBuf),
    UpdateExclusions { root: PathBuf, patterns: Vec<String> },
}

/// Watches every registered root and feeds external changes into the queue.
///
/// Run with [`SyncWatcher::watch`]; control it through the
/// [`WatcherHandle`] returned by the builder.
pub struct SyncWatcher {
    pipeline: EventPipeline,
    sources: HashMap<PathBuf, Box<dyn ChangeSource>>,
    roots: HashMap<PathBuf, WatchRoot>,
    initial_roots: Vec<WatchRoot>,
    states: SharedStates,
    factory: SourceFactory,
    event_tx: mpsc::UnboundedSender<RawEvent>,
    event_rx: mpsc::UnboundedReceiver<RawEvent>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    sync_target: Arc<dyn SyncTarget>,
    vcs: Arc<dyn VcsNotifier>,
    batch_window: Duration,
    vcs_only_when_view_open: bool,
}

impl SyncWatcher {
    pub fn builder() -> SyncWatcherBuilder {
        SyncWatcherBuilder::new()
    }

    /// Run the event loop until shutdown.
    ///
    /// Events are collected for one batch window, then processed together.
    /// Timers owned by the pipeline fire from the same loop.
    pub async fn watch(mut self) -> Result<(), WatchError> {
        for root in std::mem::take(&mut self.initial_roots) {
            self.start_root(root);
        }
        crate::log_event!("watcher", "started", "{} roots", self.sources.len());

        let shutdown = self.shutdown.clone();
        let mut batch: Vec<RawEvent> = Vec::new();
        let mut batch_deadline: Option<Instant> = None;

        loop {
            let deadline = match (batch_deadline, self.pipeline.next_deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(command) = self.command_rx.recv() => self.handle_command(command),

                Some(event) = self.event_rx.recv() => {
                    if batch_deadline.is_none() {
                        batch_deadline = Some(Instant::now() + self.batch_window);
                    }
                    batch.push(event);
                }

                _ = sleep_until(deadline) => {
                    let now = Instant::now();
                    if batch_deadline.is_some_and(|d| d <= now) {
                        batch_deadline = None;
                        crate::debug_event!("watcher", "batch", "{} events", batch.len());
                        self.pipeline.handle_batch(std::mem::take(&mut batch), now);
                    }
                    for signal in self.pipeline.tick(now) {
                        self.dispatch(signal);
                    }
                }
            }
        }

        self.stop_all();
        crate::log_event!("watcher", "stopped");
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddRoot(root) => self.start_root(root),
            Command::RemoveRoot(root) => self.stop_root(&root),
            Command::UpdateExclusions { root, patterns } => {
                self.update_exclusions(&root, patterns)
            }
        }
    }

    fn start_root(&mut self, root: WatchRoot) {
        let path = root.root.clone();
        if self.sources.contains_key(&path) {
            crate::debug_event!("watcher", "already watching", "{}", path.display());
            // The handle marks every requested root as starting.
            self.states.write().insert(path, WatchState::Watching);
            return;
        }
        self.states.write().insert(path.clone(), WatchState::Starting);

        let rules = match root.rules() {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("[watcher] cannot watch {}: {e}", path.display());
                self.states.write().insert(path, WatchState::Stopped);
                return;
            }
        };
        self.pipeline.add_root(rules);

        let tx = self.event_tx.clone();
        let sink: EventSink = Arc::new(move |event| {
            // Receiver gone means the loop is shutting down.
            let _ = tx.send(event);
        });

        let mut source = (self.factory)();
        let started = source
            .update_exclusions(&root.ignore_patterns)
            .and_then(|()| source.start(&path, sink));

        match started {
            Ok(()) => {
                crate::log_event!("watcher", "watching", "{}", path.display());
                self.states.write().insert(path.clone(), WatchState::Watching);
                self.sources.insert(path.clone(), source);
                self.roots.insert(path, root);
            }
            Err(e) => {
                tracing::error!("[watcher] failed to watch {}: {e}", path.display());
                self.pipeline.remove_root(&path);
                self.states.write().insert(path, WatchState::Stopped);
            }
        }
    }

    fn stop_root(&mut self, root: &Path) {
        if let Some(mut source) = self.sources.remove(root) {
            source.stop();
            crate::log_event!("watcher", "unwatched", "{}", root.display());
        }
        self.roots.remove(root);
        self.pipeline.remove_root(root);
        self.states.write().insert(root.to_path_buf(), WatchState::Stopped);
    }

    fn update_exclusions(&mut self, root: &Path, patterns: Vec<String>) {
        let Some(watch_root) = self.roots.get_mut(root) else {
            crate::debug_event!("watcher", "exclusions for unknown root", "{}", root.display());
            return;
        };

        match IgnoreRules::new(root, &patterns) {
            Ok(rules) => self.pipeline.update_ignore(root, rules),
            Err(e) => {
                tracing::warn!("[watcher] keeping previous exclusions for {}: {e}", root.display());
                return;
            }
        }
        if let Some(source) = self.sources.get_mut(root) {
            if let Err(e) = source.update_exclusions(&patterns) {
                tracing::warn!("[watcher] source rejected exclusions: {e}");
            }
        }
        watch_root.ignore_patterns = patterns;
        crate::debug_event!("watcher", "exclusions updated", "{}", root.display());
    }

    fn dispatch(&self, signal: Signal) {
        match signal {
            Signal::Sync => {
                crate::debug_event!("watcher", "sync signal");
                self.sync_target.changes_pending();
            }
            Signal::Vcs(root) => {
                crate::debug_event!("watcher", "vcs signal", "{}", root.display());
                self.vcs.notify_file_change(
                    &root,
                    VcsNotifyOptions {
                        only_when_relevant_view_open: self.vcs_only_when_view_open,
                    },
                );
            }
        }
    }

    fn stop_all(&mut self) {
        self.pipeline.cancel_all();
        let roots: Vec<PathBuf> = self.sources.keys().cloned().collect();
        for root in roots {
            self.stop_root(&root);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

/// Cloneable control surface of a running [`SyncWatcher`].
#[derive(Clone)]
pub struct WatcherHandle {
    queue: SharedQueue,
    exclusions: Exclusions,
    states: SharedStates,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl WatcherHandle {
    /// Titles changed or deleted on disk since the last call.
    pub fn drain_changes(&self) -> DrainedChanges {
        self.queue.lock().drain()
    }

    /// Fields for a title reported by [`drain_changes`](Self::drain_changes).
    ///
    /// Returns the fields cached at detection time, or re-reads the file.
    /// None when no load is pending for `title`.
    pub fn load_document(&self, title: &str) -> Option<Fields> {
        let change = self.queue.lock().take_load(title)?;
        if let Some(fields) = change.cached_fields {
            return Some(fields);
        }

        match codec::read_documents(&change.absolute_path) {
            Ok(documents) => codec::select_document(documents, title),
            Err(e) => {
                tracing::warn!("[watcher] cannot load '{title}': {e}");
                None
            }
        }
    }

    pub fn exclude_file(&self, path: &Path) {
        self.exclusions.exclude(path);
    }

    pub fn schedule_inclusion(&self, path: &Path) {
        self.exclusions.schedule_inclusion(path);
    }

    pub fn exclusions(&self) -> &Exclusions {
        &self.exclusions
    }

    pub fn add_root(&self, root: WatchRoot) -> Result<(), WatchError> {
        self.states
            .write()
            .insert(root.root.clone(), WatchState::Starting);
        self.send(Command::AddRoot(root))
    }

    pub fn remove_root(&self, root: &Path) -> Result<(), WatchError> {
        self.send(Command::RemoveRoot(root.to_path_buf()))
    }

    /// Replace the permanent ignore patterns of a watched root.
    pub fn update_exclusions(&self, root: &Path, patterns: Vec<String>) -> Result<(), WatchError> {
        self.send(Command::UpdateExclusions {
            root: root.to_path_buf(),
            patterns,
        })
    }

    pub fn root_state(&self, root: &Path) -> WatchState {
        self.states
            .read()
            .get(root)
            .copied()
            .unwrap_or(WatchState::Stopped)
    }

    /// Roots currently starting or watching.
    pub fn active_roots(&self) -> Vec<PathBuf> {
        self.states
            .read()
            .iter()
            .filter(|(_, state)| **state != WatchState::Stopped)
            .map(|(root, _)| root.clone())
            .collect()
    }

    /// Ask the loop to stop. Await the loop task to know it has.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    fn send(&self, command: Command) -> Result<(), WatchError> {
        self.commands
            .send(command)
            .map_err(|_| WatchError::ChannelClosed)
    }
}

/// Builder for [`SyncWatcher`].
pub struct SyncWatcherBuilder {
    index: Option<SharedIndex>,
    roots: Vec<WatchRoot>,
    config: WatchConfig,
    sync_target: Option<Arc<dyn SyncTarget>>,
    vcs: Arc<dyn VcsNotifier>,
    factory: SourceFactory,
    exclusions: Option<Exclusions>,
}

impl SyncWatcherBuilder {
    pub fn new() -> Self {
        Self {
            index: None,
            roots: Vec::new(),
            config: WatchConfig::default(),
            sync_target: None,
            vcs: Arc::new(NoVcs),
            factory: NotifySource::factory(),
            exclusions: None,
        }
    }

    pub fn index(mut self, index: SharedIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Watch `root` from the start.
    pub fn root(mut self, root: WatchRoot) -> Self {
        self.roots.push(root);
        self
    }

    pub fn config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sync_target(mut self, target: Arc<dyn SyncTarget>) -> Self {
        self.sync_target = Some(target);
        self
    }

    pub fn vcs_notifier(mut self, vcs: Arc<dyn VcsNotifier>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn source_factory(mut self, factory: SourceFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Share an existing exclusion set, e.g. with the adaptor.
    pub fn exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = Some(exclusions);
        self
    }

    pub fn build(self) -> Result<(SyncWatcher, WatcherHandle), WatchError> {
        let index = self.index.ok_or_else(|| WatchError::InitFailed {
            reason: "Index is required".to_string(),
        })?;
        let sync_target = self.sync_target.ok_or_else(|| WatchError::InitFailed {
            reason: "Sync target is required".to_string(),
        })?;

        let exclusions = self
            .exclusions
            .unwrap_or_else(|| Exclusions::new(self.config.inclusion_delay()));
        let queue = ChangeQueue::new().into_shared();
        let states: SharedStates = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let pipeline = EventPipeline::new(
            index,
            Arc::clone(&queue),
            exclusions.clone(),
            PipelineTiming::from(&self.config),
            self.config.cache_fields,
        );

        for root in &self.roots {
            states.write().insert(root.root.clone(), WatchState::Starting);
        }

        let watcher = SyncWatcher {
            pipeline,
            sources: HashMap::new(),
            roots: HashMap::new(),
            initial_roots: self.roots,
            states: Arc::clone(&states),
            factory: self.factory,
            event_tx,
            event_rx,
            command_rx,
            shutdown: shutdown.clone(),
            sync_target,
            vcs: self.vcs,
            batch_window: self.config.batch_window(),
            vcs_only_when_view_open: self.config.vcs_only_when_view_open,
        };

        let handle = WatcherHandle {
            queue,
            exclusions,
            states,
            commands: command_tx,
            shutdown,
        };

        Ok((watcher, handle))
    }
}

impl Default for SyncWatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexSet;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    type Sinks = Arc<Mutex<HashMap<PathBuf, EventSink>>>;

    /// Source whose events are pushed by the test.
    struct ManualSource {
        sinks: Sinks,
        root: Option<PathBuf>,
    }

    impl ChangeSource for ManualSource {
        fn start(&mut self, root: &Path, sink: EventSink) -> Result<(), WatchError> {
            self.root = Some(root.to_path_buf());
            self.sinks.lock().insert(root.to_path_buf(), sink);
            Ok(())
        }

        fn stop(&mut self) {
            if let Some(root) = self.root.take() {
                self.sinks.lock().remove(&root);
            }
        }

        fn update_exclusions(&mut self, _patterns: &[String]) -> Result<(), WatchError> {
            Ok(())
        }
    }

    fn manual_factory(sinks: Sinks) -> SourceFactory {
        Arc::new(move || {
            Box::new(ManualSource {
                sinks: Arc::clone(&sinks),
                root: None,
            }) as Box<dyn ChangeSource>
        })
    }

    fn fast_config() -> WatchConfig {
        WatchConfig {
            batch_window_ms: 20,
            delete_grace_ms: 20,
            inclusion_delay_ms: 100,
            sync_debounce_ms: 20,
            vcs_debounce_ms: 20,
            ..WatchConfig::default()
        }
    }

    async fn wait_for(sinks: &Sinks, root: &Path) {
        for _ in 0..100 {
            if sinks.lock().contains_key(root) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("root {} never started", root.display());
    }

    fn push(sinks: &Sinks, root: &Path, event: RawEvent) {
        let sink = sinks.lock().get(root).cloned().unwrap();
        sink(event);
    }

    #[tokio::test]
    async fn test_external_change_reaches_sync_target() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let sinks: Sinks = Arc::default();
        let notify = Arc::new(Notify::new());

        let (watcher, handle) = SyncWatcher::builder()
            .index(IndexSet::new().into_shared())
            .root(WatchRoot::new(&root))
            .config(fast_config())
            .sync_target(notify.clone())
            .source_factory(manual_factory(Arc::clone(&sinks)))
            .build()
            .unwrap();
        assert_eq!(handle.root_state(&root), WatchState::Starting);
        let task = tokio::spawn(watcher.watch());
        wait_for(&sinks, &root).await;
        assert_eq!(handle.root_state(&root), WatchState::Watching);

        let path = root.join("Entry.tid");
        fs::write(&path, "title: Entry\n\nhello").unwrap();
        push(&sinks, &root, RawEvent::Created(path.clone()));

        tokio::time::timeout(Duration::from_secs(5), notify.notified())
            .await
            .expect("sync signal");
        let drained = handle.drain_changes();
        assert_eq!(drained.modifications, vec!["Entry"]);
        let fields = handle.load_document("Entry").unwrap();
        assert_eq!(fields["text"], "hello");
        assert!(handle.load_document("Entry").is_none());

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(handle.root_state(&root), WatchState::Stopped);
        assert!(sinks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_document_rereads_without_cache() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let sinks: Sinks = Arc::default();
        let notify = Arc::new(Notify::new());

        let (watcher, handle) = SyncWatcher::builder()
            .index(IndexSet::new().into_shared())
            .root(WatchRoot::new(&root))
            .config(WatchConfig {
                cache_fields: false,
                ..fast_config()
            })
            .sync_target(notify.clone())
            .source_factory(manual_factory(Arc::clone(&sinks)))
            .build()
            .unwrap();
        let task = tokio::spawn(watcher.watch());
        wait_for(&sinks, &root).await;

        let path = root.join("Lazy.tid");
        fs::write(&path, "title: Lazy\n\nfirst").unwrap();
        push(&sinks, &root, RawEvent::Created(path.clone()));
        tokio::time::timeout(Duration::from_secs(5), notify.notified())
            .await
            .expect("sync signal");

        fs::write(&path, "title: Lazy\n\nsecond").unwrap();
        assert_eq!(handle.drain_changes().modifications, vec!["Lazy"]);
        assert_eq!(handle.load_document("Lazy").unwrap()["text"], "second");

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_add_and_remove_root_at_runtime() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main");
        let extra = dir.path().join("extra");
        fs::create_dir_all(&main).unwrap();
        fs::create_dir_all(&extra).unwrap();
        let sinks: Sinks = Arc::default();
        let index = IndexSet::new().into_shared();

        let (watcher, handle) = SyncWatcher::builder()
            .index(index.clone())
            .root(WatchRoot::new(&main))
            .config(fast_config())
            .sync_target(Arc::new(Notify::new()))
            .source_factory(manual_factory(Arc::clone(&sinks)))
            .build()
            .unwrap();
        let task = tokio::spawn(watcher.watch());
        wait_for(&sinks, &main).await;

        handle.add_root(WatchRoot::new(&extra)).unwrap();
        wait_for(&sinks, &extra).await;
        assert_eq!(handle.root_state(&extra), WatchState::Watching);
        assert!(index.read().root(&extra).is_some());

        handle.remove_root(&extra).unwrap();
        for _ in 0..100 {
            if handle.root_state(&extra) == WatchState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.root_state(&extra), WatchState::Stopped);
        assert!(index.read().root(&extra).is_none());
        assert_eq!(handle.active_roots(), vec![main.clone()]);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_adding_watched_root_again_stays_watching() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let sinks: Sinks = Arc::default();

        let (watcher, handle) = SyncWatcher::builder()
            .index(IndexSet::new().into_shared())
            .root(WatchRoot::new(&root))
            .config(fast_config())
            .sync_target(Arc::new(Notify::new()))
            .source_factory(manual_factory(Arc::clone(&sinks)))
            .build()
            .unwrap();
        let task = tokio::spawn(watcher.watch());
        wait_for(&sinks, &root).await;
        for _ in 0..100 {
            if handle.root_state(&root) == WatchState::Watching {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.root_state(&root), WatchState::Watching);

        handle.add_root(WatchRoot::new(&root)).unwrap();
        for _ in 0..100 {
            if handle.root_state(&root) == WatchState::Watching {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.root_state(&root), WatchState::Watching);
        assert_eq!(sinks.lock().len(), 1);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_source_leaves_root_stopped() {
        struct Broken;
        impl ChangeSource for Broken {
            fn start(&mut self, root: &Path, _sink: EventSink) -> Result<(), WatchError> {
                Err(WatchError::PathWatchFailed {
                    path: root.to_path_buf(),
                    reason: "denied".to_string(),
                })
            }
            fn stop(&mut self) {}
            fn update_exclusions(&mut self, _patterns: &[String]) -> Result<(), WatchError> {
                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let (watcher, handle) = SyncWatcher::builder()
            .index(IndexSet::new().into_shared())
            .root(WatchRoot::new(&root))
            .sync_target(Arc::new(Notify::new()))
            .source_factory(Arc::new(|| Box::new(Broken) as Box<dyn ChangeSource>))
            .build()
            .unwrap();
        let task = tokio::spawn(watcher.watch());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handle.root_state(&root), WatchState::Stopped);
        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_builder_requires_index_and_target() {
        assert!(SyncWatcher::builder().build().is_err());
        assert!(
            SyncWatcher::builder()
                .index(IndexSet::new().into_shared())
                .build()
                .is_err()
        );
    }
}
