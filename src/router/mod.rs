//! Route resolution: which root directory a document belongs in.
//!
//! Routes are tried in priority order (ties broken by list position). For
//! each route the checks run in this order and the first success wins:
//!
//! 1. direct tag match (or the title *is* one of the route's tags)
//! 2. tag-tree match, when `include_tag_tree` is set
//! 3. custom filter match, when `custom_filter_enabled` is set
//!
//! Documents matching no route fall back to the default root.

pub mod filter;
pub mod path_gen;
pub mod tag_tree;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};

use crate::config::RouteConfig;
use crate::document::Document;
use crate::error::Result;
use crate::index::FileRecord;

pub use filter::{FilterEvaluator, SimpleFilter};
pub use tag_tree::{NoTagHierarchy, TagGraph, TagHierarchy};

/// Id of the synthetic route standing for the default root.
pub const DEFAULT_ROUTE_ID: &str = "default";

/// Source of route definitions.
pub trait RouteProvider: Send + Sync {
    fn get_route(&self, id: &str) -> Result<Option<RouteConfig>>;
    fn list_routes(&self) -> Result<Vec<RouteConfig>>;
}

/// Fixed route list, for hosts that manage routes themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes(pub Vec<RouteConfig>);

impl RouteProvider for StaticRoutes {
    fn get_route(&self, id: &str) -> Result<Option<RouteConfig>> {
        Ok(self.0.iter().find(|route| route.id == id).cloned())
    }

    fn list_routes(&self) -> Result<Vec<RouteConfig>> {
        Ok(self.0.clone())
    }
}

/// A resolved routing rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub id: String,
    pub root_directory: PathBuf,
    pub tag_names: IndexSet<String>,
    pub include_tag_tree: bool,
    pub custom_filter_enabled: bool,
    pub custom_filter_expression: String,
    pub priority_order: i64,
    pub ignore_symlinks: bool,
    /// Whether the root is watched for external changes.
    pub watch_enabled: bool,
}

impl Route {
    /// Route standing for the default root.
    pub fn fallback(root: impl Into<PathBuf>) -> Self {
        Self {
            id: DEFAULT_ROUTE_ID.to_string(),
            root_directory: root.into(),
            tag_names: IndexSet::new(),
            include_tag_tree: false,
            custom_filter_enabled: false,
            custom_filter_expression: String::new(),
            priority_order: i64::MAX,
            ignore_symlinks: false,
            watch_enabled: true,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.id == DEFAULT_ROUTE_ID
    }
}

impl From<RouteConfig> for Route {
    fn from(config: RouteConfig) -> Self {
        Self {
            id: config.id,
            root_directory: config.root,
            tag_names: config.tags.into_iter().collect(),
            include_tag_tree: config.include_tag_tree,
            custom_filter_enabled: config.custom_filter_enabled,
            custom_filter_expression: config.custom_filter,
            priority_order: config.priority,
            ignore_symlinks: config.ignore_symlinks,
            watch_enabled: config.watch_enabled,
        }
    }
}

/// Why a route claimed a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    DirectTag,
    TagTree,
    CustomFilter,
}

/// Resolves target routes and backing-file paths for documents.
pub struct Router {
    default_root: PathBuf,
    routes: RwLock<Arc<Vec<Route>>>,
    tag_hierarchy: Arc<dyn TagHierarchy>,
    filter: Arc<dyn FilterEvaluator>,
    /// Last path generated per title, reused while the root stays put.
    last_generated: Mutex<HashMap<String, PathBuf>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("default_root", &self.default_root)
            .field("routes", &self.routes.read().len())
            .finish()
    }
}

impl Router {
    pub fn new(default_root: impl Into<PathBuf>) -> Self {
        Self {
            default_root: default_root.into(),
            routes: RwLock::new(Arc::new(Vec::new())),
            tag_hierarchy: Arc::new(NoTagHierarchy),
            filter: Arc::new(SimpleFilter),
            last_generated: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tag_hierarchy(mut self, hierarchy: Arc<dyn TagHierarchy>) -> Self {
        self.tag_hierarchy = hierarchy;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn FilterEvaluator>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_routes(self, routes: Vec<RouteConfig>) -> Self {
        self.set_routes(routes);
        self
    }

    pub fn default_root(&self) -> &Path {
        &self.default_root
    }

    /// Current route list in priority order.
    pub fn routes(&self) -> Arc<Vec<Route>> {
        self.routes.read().clone()
    }

    /// Replace the route list.
    pub fn set_routes(&self, routes: Vec<RouteConfig>) {
        let mut routes: Vec<Route> = routes.into_iter().map(Route::from).collect();
        // Stable: equal priorities keep their list order.
        routes.sort_by_key(|route| route.priority_order);
        *self.routes.write() = Arc::new(routes);
    }

    /// Rebuild routes from `provider`.
    ///
    /// On failure the previous list stays in place and the error is returned
    /// so the caller can retry on the next configuration change.
    pub fn rebuild(&self, provider: &dyn RouteProvider) -> Result<usize> {
        match provider.list_routes() {
            Ok(routes) => {
                let count = routes.len();
                self.set_routes(routes);
                crate::debug_event!("router", "rebuilt", "{count} routes");
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(
                    "[router] route rebuild failed, keeping {} cached routes: {e}",
                    self.routes.read().len()
                );
                Err(e)
            }
        }
    }

    fn match_route(&self, route: &Route, doc: &Document, tags: &[String]) -> Option<RouteMatch> {
        let title = doc.title();
        if route.tag_names.contains(title) || tags.iter().any(|tag| route.tag_names.contains(tag))
        {
            return Some(RouteMatch::DirectTag);
        }

        if route.include_tag_tree {
            let roots: Vec<String> = route.tag_names.iter().cloned().collect();
            if self.tag_hierarchy.is_in_tag_tree(title, &roots) {
                return Some(RouteMatch::TagTree);
            }
        }

        if route.custom_filter_enabled {
            let hit = route
                .custom_filter_expression
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .any(|expression| !self.filter.evaluate(expression, doc).is_empty());
            if hit {
                return Some(RouteMatch::CustomFilter);
            }
        }

        None
    }

    /// Route a document belongs to; the fallback route when none match.
    pub fn resolve_target(&self, doc: &Document) -> Route {
        let tags = doc.tags();
        let routes = self.routes();

        for route in routes.iter() {
            if let Some(how) = self.match_route(route, doc, &tags) {
                crate::debug_event!(
                    "router",
                    "matched",
                    "'{}' -> {} ({how:?})",
                    doc.title(),
                    route.id
                );
                return route.clone();
            }
        }

        Route::fallback(&self.default_root)
    }

    /// Backing-file path for `doc`.
    ///
    /// Keeps `current` when it already lies under the resolved root and has
    /// the wanted extension. Otherwise generates a path, reusing the last one
    /// generated for this title only while it sits under the same root.
    pub fn target_path(
        &self,
        doc: &Document,
        current: Option<&FileRecord>,
        extension: &str,
        is_taken: &dyn Fn(&Path) -> bool,
    ) -> PathBuf {
        let route = self.resolve_target(doc);
        let root = &route.root_directory;
        let has_extension =
            |path: &Path| path.extension().and_then(|e| e.to_str()) == Some(extension);

        if let Some(current) = current {
            let in_tree = current
                .absolute_path
                .parent()
                .is_some_and(|dir| dir.starts_with(root));
            if in_tree && has_extension(&current.absolute_path) {
                return current.absolute_path.clone();
            }
        }

        let title = doc.title();
        let mut cache = self.last_generated.lock();
        if let Some(cached) = cache.get(title) {
            // The watcher may have handed the cached path to another title.
            if cached.starts_with(root) && has_extension(cached.as_path()) && !is_taken(cached) {
                return cached.clone();
            }
        }
        // Must go before generating, or the stale entry makes its own path look taken.
        cache.remove(title);

        let path = path_gen::generate(root, title, extension, is_taken);
        cache.insert(title.to_string(), path.clone());
        path
    }

    /// Forget generated-path state for a title (after deletion).
    pub fn forget(&self, title: &str) {
        self.last_generated.lock().remove(title);
    }
}
