//! Bidirectional sync between an in-memory document store and files on disk.
//!
//! Documents are saved to backing files under routed root directories;
//! external edits to those files are detected, debounced and queued for the
//! host to load back.
//!
//! ```ignore
//! let engine = SyncEngine::builder("/path/to/wiki")
//!     .sync_target(Arc::new(tokio::sync::Notify::new()))
//!     .start()?;
//! engine.save(&Document::new("Entry1").with_tags(["Journal"])).await?;
//! let changes = engine.drain_changes();
//! ```

pub mod adaptor;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod index;
pub mod logging;
pub mod router;
pub mod watcher;

pub use adaptor::{Adaptor, Alert, AlertLog, AlertSink, FileStore, LocalFileStore, RetryPolicy};
pub use config::{RouteConfig, Settings, SettingsRoutes};
pub use document::{Document, Fields};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Result, SyncError};
pub use index::{FileIndex, FileRecord, IndexError, IndexSet, SharedIndex};
pub use router::{Route, RouteProvider, Router, StaticRoutes};
pub use watcher::{
    ChangeSource, DrainedChanges, SyncTarget, SyncWatcher, VcsNotifier, WatchError, WatchRoot,
    WatchState, WatcherHandle,
};
