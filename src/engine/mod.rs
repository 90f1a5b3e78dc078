//! Wiring of index, router, adaptor and watcher into one running engine.

mod reload;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet as OrderedSet;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::adaptor::{Adaptor, AlertLog, AlertSink, FileStore, RetryPolicy};
use crate::config::{CONFIG_DIR, SETTINGS_FILE, Settings, SettingsRoutes};
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::index::{FileRecord, IndexSet, SharedIndex};
use crate::router::{FilterEvaluator, RouteProvider, Router, StaticRoutes, TagHierarchy};
use crate::watcher::{
    Discovered, DrainedChanges, Exclusions, NoVcs, SourceFactory, SyncTarget, SyncWatcher,
    VcsNotifier, WatchError, WatchRoot, WatcherHandle, scan_root,
};

pub use reload::SettingsReloader;

/// A running sync engine.
///
/// Created with [`SyncEngine::builder`]; stopped with
/// [`SyncEngine::shutdown`].
pub struct SyncEngine {
    settings: RwLock<Settings>,
    settings_path: PathBuf,
    main_root: PathBuf,
    index: SharedIndex,
    router: Arc<Router>,
    adaptor: Adaptor,
    watcher: WatcherHandle,
    routes: Arc<dyn RouteProvider>,
    /// Route roots currently watched besides the main root.
    sub_roots: Mutex<OrderedSet<PathBuf>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    watch_task: tokio::sync::Mutex<Option<JoinHandle<std::result::Result<(), WatchError>>>>,
}

impl SyncEngine {
    pub fn builder(workspace: impl Into<PathBuf>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(workspace)
    }

    /// Persist a document to its backing file.
    pub async fn save(&self, doc: &Document) -> Result<FileRecord> {
        self.adaptor.save(doc).await
    }

    /// Delete the backing files of a document.
    pub async fn delete(&self, title: &str) -> Result<()> {
        self.adaptor.delete(title).await
    }

    /// Titles changed or deleted on disk since the last call.
    pub fn drain_changes(&self) -> DrainedChanges {
        let drained = self.watcher.drain_changes();
        for title in &drained.deletions {
            self.router.forget(title);
        }
        drained
    }

    /// Load a document reported by [`drain_changes`](Self::drain_changes).
    pub fn load_document(&self, title: &str) -> Option<Document> {
        self.watcher
            .load_document(title)
            .and_then(Document::from_fields)
    }

    /// Index and return every document already on disk under the watched
    /// roots.
    pub fn discover(&self) -> Discovered {
        let mut roots = vec![self.main_watch_root()];
        roots.extend(self.sub_watch_roots());

        let mut all = Discovered::default();
        let mut seen = HashSet::new();
        for root in roots {
            let rules = match root.rules() {
                Ok(rules) => rules,
                Err(e) => {
                    tracing::warn!("[engine] cannot scan {}: {e}", root.root.display());
                    continue;
                }
            };
            let found = scan_root(&self.index, &rules);
            all.files += found.files;
            all.failed.extend(found.failed);
            for doc in found.documents {
                if seen.insert(doc.title().to_string()) {
                    all.documents.push(doc);
                }
            }
        }
        all
    }

    /// Rebuild the route list and start or stop sub-root watches to match.
    ///
    /// On failure the previous routes stay in effect.
    pub fn reload_routes(&self) -> Result<usize> {
        let count = self.router.rebuild(self.routes.as_ref())?;
        self.reconcile_sub_roots()?;
        Ok(count)
    }

    /// Re-read the settings file and apply it.
    pub fn reload_settings(&self) -> Result<usize> {
        let settings = Settings::load_from(&self.settings_path).map_err(|e| SyncError::Config {
            reason: e.to_string(),
        })?;

        let patterns_changed = {
            let current = self.settings.read();
            current.watch.ignore_patterns != settings.watch.ignore_patterns
                || current.sync.attachments_dir != settings.sync.attachments_dir
        };
        let pending = self.settings.read().restart_required(&settings);
        if !pending.is_empty() {
            tracing::warn!(
                "[engine] restart required to apply: {}",
                pending.join(", ")
            );
        }
        *self.settings.write() = settings;

        if patterns_changed {
            for root in self.watcher.active_roots() {
                self.watcher
                    .update_exclusions(&root, self.ignore_patterns_for(&root))?;
            }
        }
        crate::log_event!("engine", "settings reloaded", "{}", self.settings_path.display());
        self.reload_routes()
    }

    /// Poll the settings file and reload on change until shutdown.
    pub async fn watch_settings(self: &Arc<Self>) {
        let interval = self.settings.read().watch.config_poll();
        let reloader = SettingsReloader::new(&self.settings_path, interval);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(reloader.watch(engine));
        self.tasks.lock().await.push(handle);
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn watcher(&self) -> &WatcherHandle {
        &self.watcher
    }

    pub fn main_root(&self) -> &Path {
        &self.main_root
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Watched route roots besides the main root.
    pub fn sub_roots(&self) -> Vec<PathBuf> {
        self.sub_roots.lock().iter().cloned().collect()
    }

    /// Stop watching, cancel all timers and wait for background tasks.
    pub async fn shutdown(&self) -> Result<()> {
        self.watcher.shutdown();

        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("[engine] background task failed: {e}");
            }
        }

        if let Some(task) = self.watch_task.lock().await.take() {
            task.await.map_err(|e| WatchError::EventError {
                details: e.to_string(),
            })??;
        }
        crate::log_event!("engine", "stopped");
        Ok(())
    }

    fn ignore_patterns_for(&self, root: &Path) -> Vec<String> {
        let settings = self.settings.read();
        let mut patterns = settings.watch.ignore_patterns.clone();
        if root == self.main_root {
            patterns.push(format!("/{}/", settings.sync.attachments_dir));
        }
        patterns
    }

    fn main_watch_root(&self) -> WatchRoot {
        WatchRoot::new(&self.main_root)
            .with_ignore_patterns(self.ignore_patterns_for(&self.main_root))
            .with_ignore_symlinks(self.settings.read().watch.ignore_symlinks)
    }

    fn sub_watch_roots(&self) -> Vec<WatchRoot> {
        let mut seen = OrderedSet::new();
        self.router
            .routes()
            .iter()
            .filter(|route| route.watch_enabled && route.root_directory != self.main_root)
            .filter(|route| seen.insert(route.root_directory.clone()))
            .map(|route| {
                WatchRoot::new(&route.root_directory)
                    .with_ignore_patterns(self.ignore_patterns_for(&route.root_directory))
                    .with_ignore_symlinks(route.ignore_symlinks)
            })
            .collect()
    }

    fn reconcile_sub_roots(&self) -> Result<()> {
        let desired = self.sub_watch_roots();
        let mut current = self.sub_roots.lock();

        let stale: Vec<PathBuf> = current
            .iter()
            .filter(|root| !desired.iter().any(|d| &d.root == *root))
            .cloned()
            .collect();
        for root in stale {
            self.watcher.remove_root(&root)?;
            current.shift_remove(&root);
            crate::log_event!("engine", "sub-root removed", "{}", root.display());
        }

        for root in desired {
            if current.contains(&root.root) {
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(&root.root) {
                tracing::warn!("[engine] cannot create {}: {e}", root.root.display());
                continue;
            }
            current.insert(root.root.clone());
            crate::log_event!("engine", "sub-root added", "{}", root.root.display());
            self.watcher.add_root(root)?;
        }
        Ok(())
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    workspace: PathBuf,
    settings: Option<Settings>,
    routes: Option<Arc<dyn RouteProvider>>,
    tag_hierarchy: Option<Arc<dyn TagHierarchy>>,
    filter: Option<Arc<dyn FilterEvaluator>>,
    store: Option<Arc<dyn FileStore>>,
    alerts: Option<Arc<dyn AlertSink>>,
    sync_target: Option<Arc<dyn SyncTarget>>,
    vcs: Option<Arc<dyn VcsNotifier>>,
    source_factory: Option<SourceFactory>,
}

impl SyncEngineBuilder {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            settings: None,
            routes: None,
            tag_hierarchy: None,
            filter: None,
            store: None,
            alerts: None,
            sync_target: None,
            vcs: None,
            source_factory: None,
        }
    }

    /// Use these settings instead of loading them from the workspace.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn route_provider(mut self, routes: Arc<dyn RouteProvider>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn tag_hierarchy(mut self, hierarchy: Arc<dyn TagHierarchy>) -> Self {
        self.tag_hierarchy = Some(hierarchy);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn FilterEvaluator>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn sync_target(mut self, target: Arc<dyn SyncTarget>) -> Self {
        self.sync_target = Some(target);
        self
    }

    pub fn vcs_notifier(mut self, vcs: Arc<dyn VcsNotifier>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = Some(factory);
        self
    }

    /// Build the engine and spawn its watcher on the current Tokio runtime.
    pub fn start(self) -> Result<Arc<SyncEngine>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| WatchError::InitFailed {
            reason: format!("no Tokio runtime: {e}"),
        })?;

        let settings_path = Settings::find_workspace_config(&self.workspace)
            .unwrap_or_else(|| self.workspace.join(CONFIG_DIR).join(SETTINGS_FILE));
        let settings = match self.settings {
            Some(settings) => settings,
            None => Settings::load_from(&settings_path).map_err(|e| SyncError::Config {
                reason: e.to_string(),
            })?,
        };

        let main_root = settings.default_root_in(&self.workspace);
        std::fs::create_dir_all(&main_root).map_err(|e| SyncError::Config {
            reason: format!("cannot create {}: {e}", main_root.display()),
        })?;

        let routes: Arc<dyn RouteProvider> = match self.routes {
            Some(routes) => routes,
            None if settings_path.is_file() => {
                Arc::new(SettingsRoutes::new(&settings_path, &self.workspace))
            }
            None => Arc::new(StaticRoutes(
                settings
                    .routes
                    .iter()
                    .cloned()
                    .map(|mut route| {
                        if route.root.is_relative() {
                            route.root = self.workspace.join(&route.root);
                        }
                        route
                    })
                    .collect(),
            )),
        };

        let mut router = Router::new(&main_root);
        if let Some(hierarchy) = self.tag_hierarchy {
            router = router.with_tag_hierarchy(hierarchy);
        }
        if let Some(filter) = self.filter {
            router = router.with_filter(filter);
        }
        let router = Arc::new(router);
        if let Err(e) = router.rebuild(routes.as_ref()) {
            tracing::warn!("[engine] starting with the default route only: {e}");
        }

        let index = IndexSet::with_root(&main_root).into_shared();
        let exclusions = Exclusions::new(settings.watch.inclusion_delay());
        let sync_target = self.sync_target.unwrap_or_else(|| Arc::new(tokio::sync::Notify::new()));

        let mut main_patterns = settings.watch.ignore_patterns.clone();
        main_patterns.push(format!("/{}/", settings.sync.attachments_dir));
        let mut watcher_builder = SyncWatcher::builder()
            .index(Arc::clone(&index))
            .root(
                WatchRoot::new(&main_root)
                    .with_ignore_patterns(main_patterns)
                    .with_ignore_symlinks(settings.watch.ignore_symlinks),
            )
            .config(settings.watch.clone())
            .sync_target(sync_target)
            .vcs_notifier(self.vcs.unwrap_or_else(|| Arc::new(NoVcs)))
            .exclusions(exclusions.clone());
        if let Some(factory) = self.source_factory {
            watcher_builder = watcher_builder.source_factory(factory);
        }
        let (watcher, handle) = watcher_builder.build()?;
        let watch_task = runtime.spawn(watcher.watch());

        let mut adaptor = Adaptor::new(Arc::clone(&index), Arc::clone(&router), exclusions)
            .with_retry(RetryPolicy::from(&settings.retry))
            .with_alerts(self.alerts.unwrap_or_else(|| Arc::new(AlertLog::new())));
        if let Some(store) = self.store {
            adaptor = adaptor.with_store(store);
        }

        crate::log_event!("engine", "started", "{}", main_root.display());
        let engine = Arc::new(SyncEngine {
            settings: RwLock::new(settings),
            settings_path,
            main_root,
            index,
            router,
            adaptor,
            watcher: handle,
            routes,
            sub_roots: Mutex::new(OrderedSet::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            watch_task: tokio::sync::Mutex::new(Some(watch_task)),
        });
        engine.reconcile_sub_roots()?;
        Ok(engine)
    }
}
