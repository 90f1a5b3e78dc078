//! Configuration for the sync engine.
//!
//! Layered the same way everywhere:
//! - Default values
//! - TOML settings file (`.tidsync/settings.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `TIDSYNC_` and use double
//! underscores to separate nested levels:
//! - `TIDSYNC_WATCH__DELETE_GRACE_MS=250` sets `watch.delete_grace_ms`
//! - `TIDSYNC_RETRY__MAX_ATTEMPTS=3` sets `retry.max_attempts`
//! - `TIDSYNC_LOGGING__DEFAULT=debug` sets `logging.default`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::router::RouteProvider;

/// Directory holding the settings file, relative to the workspace root.
pub const CONFIG_DIR: &str = ".tidsync";
/// Settings file name inside [`CONFIG_DIR`].
pub const SETTINGS_FILE: &str = "settings.toml";
/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TIDSYNC_";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Routing rules, in declaration order.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Directory documents land in when no route matches.
    #[serde(default = "default_root")]
    pub default_root: PathBuf,

    /// Attachment folder managed by something else; never watched.
    #[serde(default = "default_attachments_dir")]
    pub attachments_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Window in which raw notifications are coalesced into one batch.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Delay before a delete event is acted on, so a recreate can cancel it.
    #[serde(default = "default_delete_grace_ms")]
    pub delete_grace_ms: u64,

    /// Delay before a self-written path stops being ignored.
    #[serde(default = "default_inclusion_delay_ms")]
    pub inclusion_delay_ms: u64,

    /// Quiet period before the synchronizer is told to drain.
    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,

    /// Quiet period before the version-control collaborator is notified.
    #[serde(default = "default_vcs_debounce_ms")]
    pub vcs_debounce_ms: u64,

    /// Gitignore-style patterns never watched in any root.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// Skip symbolic links in the main root.
    #[serde(default)]
    pub ignore_symlinks: bool,

    /// Keep parsed fields from detection time for `load_document`.
    #[serde(default = "default_true")]
    pub cache_fields: bool,

    /// Forwarded to the version-control notifier.
    #[serde(default = "default_true")]
    pub vcs_only_when_view_open: bool,

    /// How often the settings file is polled for route changes.
    #[serde(default = "default_config_poll_ms")]
    pub config_poll_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level for every module.
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `watcher = "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

/// One routing rule as written in the settings file.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RouteConfig {
    pub id: String,

    /// Directory matching documents are stored under.
    pub root: PathBuf,

    /// Tag names this route claims.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Also claim documents below the tags in the tag hierarchy.
    #[serde(default)]
    pub include_tag_tree: bool,

    #[serde(default)]
    pub custom_filter_enabled: bool,

    /// Newline separated filter expressions.
    #[serde(default)]
    pub custom_filter: String,

    /// Lower values are tried first.
    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub ignore_symlinks: bool,

    /// Watch this route's root for external changes.
    #[serde(default = "default_true")]
    pub watch_enabled: bool,
}

impl RouteConfig {
    /// Minimal route claiming `tags` under `root`.
    pub fn new<I, S>(id: impl Into<String>, root: impl Into<PathBuf>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            root: root.into(),
            tags: tags.into_iter().map(Into::into).collect(),
            include_tag_tree: false,
            custom_filter_enabled: false,
            custom_filter: String::new(),
            priority: 0,
            ignore_symlinks: false,
            watch_enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_root() -> PathBuf {
    PathBuf::from("tiddlers")
}
fn default_attachments_dir() -> String {
    "files".to_string()
}
fn default_batch_window_ms() -> u64 {
    100
}
fn default_delete_grace_ms() -> u64 {
    100
}
fn default_inclusion_delay_ms() -> u64 {
    250
}
fn default_sync_debounce_ms() -> u64 {
    200
}
fn default_vcs_debounce_ms() -> u64 {
    1000
}
fn default_config_poll_ms() -> u64 {
    2000
}
fn default_ignore_patterns() -> Vec<String> {
    vec![
        ".git/".to_string(),
        ".svn/".to_string(),
        ".hg/".to_string(),
        "node_modules/".to_string(),
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "desktop.ini".to_string(),
        "*.swp".to_string(),
        "*~".to_string(),
        format!("{CONFIG_DIR}/"),
        format!("{}*", crate::adaptor::store::TEMP_PREFIX),
    ]
}
fn default_true() -> bool {
    true
}
fn default_initial_delay_ms() -> u64 {
    50
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    2000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            sync: SyncConfig::default(),
            watch: WatchConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_root: default_root(),
            attachments_dir: default_attachments_dir(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: default_batch_window_ms(),
            delete_grace_ms: default_delete_grace_ms(),
            inclusion_delay_ms: default_inclusion_delay_ms(),
            sync_debounce_ms: default_sync_debounce_ms(),
            vcs_debounce_ms: default_vcs_debounce_ms(),
            ignore_patterns: default_ignore_patterns(),
            ignore_symlinks: false,
            cache_fields: true,
            vcs_only_when_view_open: true,
            config_poll_ms: default_config_poll_ms(),
        }
    }
}

impl WatchConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn delete_grace(&self) -> Duration {
        Duration::from_millis(self.delete_grace_ms)
    }

    /// Re-inclusion delay, forced strictly longer than the batch window.
    ///
    /// A self-induced event is only filtered if it is processed while its
    /// path is still excluded.
    pub fn inclusion_delay(&self) -> Duration {
        if self.inclusion_delay_ms > self.batch_window_ms {
            Duration::from_millis(self.inclusion_delay_ms)
        } else {
            let clamped = self.batch_window_ms + 50;
            tracing::warn!(
                "[config] inclusion_delay_ms ({}) must exceed batch_window_ms ({}), using {clamped}",
                self.inclusion_delay_ms,
                self.batch_window_ms
            );
            Duration::from_millis(clamped)
        }
    }

    pub fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }

    pub fn vcs_debounce(&self) -> Duration {
        Duration::from_millis(self.vcs_debounce_ms)
    }

    pub fn config_poll(&self) -> Duration {
        Duration::from_millis(self.config_poll_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration for the workspace containing `start`.
    ///
    /// Searches `start` and its ancestors for a `.tidsync` directory; falls
    /// back to defaults plus environment when none exists.
    pub fn load(start: &Path) -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config(start)
            .unwrap_or_else(|| start.join(CONFIG_DIR).join(SETTINGS_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels.
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)
    }

    /// Find `.tidsync/settings.toml` in `start` or any ancestor.
    pub fn find_workspace_config(start: &Path) -> Option<PathBuf> {
        start.ancestors().find_map(|ancestor| {
            let config_dir = ancestor.join(CONFIG_DIR);
            config_dir
                .is_dir()
                .then(|| config_dir.join(SETTINGS_FILE))
        })
    }

    /// Save current configuration to file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file under `workspace`.
    pub fn init_config_file(
        workspace: &Path,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = workspace.join(CONFIG_DIR).join(SETTINGS_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        crate::log_event!("config", "created", "{}", config_path.display());

        Ok(config_path)
    }

    /// The default root, resolved against `workspace` when relative.
    pub fn default_root_in(&self, workspace: &Path) -> PathBuf {
        if self.sync.default_root.is_absolute() {
            self.sync.default_root.clone()
        } else {
            workspace.join(&self.sync.default_root)
        }
    }

    /// Keys that differ in `next` but only take effect on restart.
    pub fn restart_required(&self, next: &Settings) -> Vec<&'static str> {
        let (a, b) = (&self.watch, &next.watch);
        let (r, q) = (&self.retry, &next.retry);
        [
            ("watch.batch_window_ms", a.batch_window_ms != b.batch_window_ms),
            ("watch.delete_grace_ms", a.delete_grace_ms != b.delete_grace_ms),
            ("watch.inclusion_delay_ms", a.inclusion_delay_ms != b.inclusion_delay_ms),
            ("watch.sync_debounce_ms", a.sync_debounce_ms != b.sync_debounce_ms),
            ("watch.vcs_debounce_ms", a.vcs_debounce_ms != b.vcs_debounce_ms),
            ("watch.cache_fields", a.cache_fields != b.cache_fields),
            (
                "watch.vcs_only_when_view_open",
                a.vcs_only_when_view_open != b.vcs_only_when_view_open,
            ),
            ("watch.config_poll_ms", a.config_poll_ms != b.config_poll_ms),
            ("retry.initial_delay_ms", r.initial_delay_ms != q.initial_delay_ms),
            ("retry.multiplier", r.multiplier != q.multiplier),
            ("retry.max_delay_ms", r.max_delay_ms != q.max_delay_ms),
            ("retry.max_attempts", r.max_attempts != q.max_attempts),
        ]
        .into_iter()
        .filter_map(|(key, changed)| changed.then_some(key))
        .collect()
    }
}

/// Route provider backed by a settings file.
///
/// Re-reads the file on every call so edits are picked up by the next
/// route rebuild.
#[derive(Debug, Clone)]
pub struct SettingsRoutes {
    path: PathBuf,
    workspace: PathBuf,
}

impl SettingsRoutes {
    pub fn new(path: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            workspace: workspace.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resolve(&self, mut route: RouteConfig) -> RouteConfig {
        if route.root.is_relative() {
            route.root = self.workspace.join(&route.root);
        }
        route
    }
}

impl RouteProvider for SettingsRoutes {
    fn get_route(&self, id: &str) -> Result<Option<RouteConfig>, crate::SyncError> {
        Ok(self.list_routes()?.into_iter().find(|route| route.id == id))
    }

    fn list_routes(&self) -> Result<Vec<RouteConfig>, crate::SyncError> {
        let settings = Settings::load_from(&self.path).map_err(|e| crate::SyncError::Config {
            reason: format!("Failed to load {}: {e}", self.path.display()),
        })?;
        Ok(settings
            .routes
            .into_iter()
            .map(|route| self.resolve(route))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.watch.delete_grace_ms, 100);
        assert_eq!(settings.watch.sync_debounce_ms, 200);
        assert_eq!(settings.watch.vcs_debounce_ms, 1000);
        assert_eq!(settings.retry.max_attempts, 10);
        assert!(settings.routes.is_empty());
        assert!(
            settings
                .watch
                .ignore_patterns
                .contains(&"node_modules/".to_string())
        );
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
[watch]
delete_grace_ms = 150
ignore_patterns = ["custom/"]

[retry]
max_attempts = 3

[[routes]]
id = "journal"
root = "/j"
tags = ["Journal"]
priority = 0

[[routes]]
id = "tasks"
root = "/t"
tags = ["Task"]
priority = 1
watch_enabled = false
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.watch.delete_grace_ms, 150);
        assert_eq!(settings.watch.ignore_patterns, vec!["custom/"]);
        assert_eq!(settings.retry.max_attempts, 3);
        // Untouched values keep their defaults
        assert_eq!(settings.retry.initial_delay_ms, 50);
        assert_eq!(settings.routes.len(), 2);
        assert_eq!(settings.routes[0].tags, vec!["Journal"]);
        assert!(settings.routes[0].watch_enabled);
        assert!(!settings.routes[1].watch_enabled);
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("settings.toml");

        let mut settings = Settings::default();
        settings.retry.max_attempts = 4;
        settings.routes.push(RouteConfig::new("r", "/r", ["Tag"]));

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.retry.max_attempts, 4);
        assert_eq!(loaded.routes, settings.routes);
    }

    #[test]
    fn test_init_config_file_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = Settings::init_config_file(temp_dir.path(), false).unwrap();
        assert!(path.exists());
        assert!(Settings::init_config_file(temp_dir.path(), false).is_err());
        assert!(Settings::init_config_file(temp_dir.path(), true).is_ok());
    }

    #[test]
    fn test_find_workspace_config_walks_up() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join(CONFIG_DIR)).unwrap();
        let nested = temp_dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let found = Settings::find_workspace_config(&nested).unwrap();
        assert_eq!(found, temp_dir.path().join(CONFIG_DIR).join(SETTINGS_FILE));
    }

    #[test]
    fn test_restart_required_lists_timing_changes() {
        let current = Settings::default();
        let mut next = Settings::default();
        assert!(current.restart_required(&next).is_empty());

        next.watch.ignore_patterns.push("*.bak".to_string());
        next.routes.push(RouteConfig::new("r", "/r", ["Tag"]));
        assert!(current.restart_required(&next).is_empty());

        next.watch.delete_grace_ms += 1;
        next.retry.max_attempts += 1;
        assert_eq!(
            current.restart_required(&next),
            vec!["watch.delete_grace_ms", "retry.max_attempts"]
        );
    }

    #[test]
    fn test_inclusion_delay_clamped() {
        let watch = WatchConfig {
            batch_window_ms: 300,
            inclusion_delay_ms: 100,
            ..WatchConfig::default()
        };
        assert_eq!(watch.inclusion_delay(), Duration::from_millis(350));
        assert_eq!(
            WatchConfig::default().inclusion_delay(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_settings_routes_resolves_relative_roots() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        fs::write(
            &config_path,
            "[[routes]]\nid = \"j\"\nroot = \"journal\"\ntags = [\"Journal\"]\n",
        )
        .unwrap();

        let provider = SettingsRoutes::new(&config_path, temp_dir.path());
        let routes = provider.list_routes().unwrap();
        assert_eq!(routes[0].root, temp_dir.path().join("journal"));
        assert!(provider.get_route("j").unwrap().is_some());
        assert!(provider.get_route("missing").unwrap().is_none());
    }

    #[test]
    fn test_settings_routes_reports_parse_errors() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        fs::write(&config_path, "[[routes]]\nid = 5\n").unwrap();

        let provider = SettingsRoutes::new(&config_path, temp_dir.path());
        assert!(matches!(
            provider.list_routes(),
            Err(crate::SyncError::Config { .. })
        ));
    }
}
