//! Outbound notifications raised by the watcher.

use std::path::Path;

/// The host synchronizer, told when external changes are waiting.
pub trait SyncTarget: Send + Sync {
    fn changes_pending(&self);
}

impl SyncTarget for tokio::sync::Notify {
    fn changes_pending(&self) {
        self.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VcsNotifyOptions {
    /// Only refresh when the host is showing a version-control view.
    pub only_when_relevant_view_open: bool,
}

/// Version-control integration refreshed after files change under a root.
pub trait VcsNotifier: Send + Sync {
    fn notify_file_change(&self, root: &Path, options: VcsNotifyOptions);
}

/// Notifier for hosts without version-control integration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVcs;

impl VcsNotifier for NoVcs {
    fn notify_file_change(&self, _root: &Path, _options: VcsNotifyOptions) {}
}
