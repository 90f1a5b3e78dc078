//! File watching for the sync roots.
//!
//! # Architecture
//!
//! ```text
//! ChangeSource (one per root, notify-backed)
//!         |  RawEvent
//!         v
//! SyncWatcher loop ---- batch window ----> EventPipeline
//!   - commands (add/remove root)             - exclusions, ignore rules
//!   - shutdown                               - delete grace timers
//!                                            - Index updates, ChangeQueue
//!                                            - sync / VCS debounce
//!         |
//!    +---------+---------+
//!    |                   |
//! SyncTarget        VcsNotifier
//! ```
//!
//! The adaptor and the host talk to the loop through [`WatcherHandle`].

mod collaborators;
mod debouncer;
mod error;
mod exclusions;
mod pipeline;
mod queue;
mod scan;
mod source;
mod sync_watcher;

pub use collaborators::{NoVcs, SyncTarget, VcsNotifier, VcsNotifyOptions};
pub use debouncer::Debouncer;
pub use error::WatchError;
pub use exclusions::{Exclusions, IgnoreRules};
pub use pipeline::{EventPipeline, PipelineTiming, RootRules, Signal, WatchRoot};
pub use queue::{ChangeKind, ChangeQueue, DrainedChanges, PendingChange, SharedQueue};
pub use scan::{Discovered, scan_root};
pub use source::{ChangeSource, EventSink, NotifySource, RawEvent, SourceFactory, convert};
pub use sync_watcher::{SyncWatcher, SyncWatcherBuilder, WatchState, WatcherHandle};
