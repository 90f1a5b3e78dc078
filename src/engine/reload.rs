//! Reloads settings when the settings file changes on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::interval;

use super::SyncEngine;

/// Polls the settings file modification time.
#[derive(Debug)]
pub struct SettingsReloader {
    path: PathBuf,
    last_modified: Option<SystemTime>,
    check_interval: Duration,
}

impl SettingsReloader {
    pub fn new(path: &Path, check_interval: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            last_modified: modified(path),
            check_interval,
        }
    }

    /// Whether the file changed since the last check.
    pub fn check(&mut self) -> bool {
        let current = modified(&self.path);
        let changed = match (self.last_modified, current) {
            (Some(last), Some(now)) => now != last,
            (None, Some(_)) => true,
            // Deleted files keep the last good settings.
            (_, None) => false,
        };
        if changed {
            self.last_modified = current;
        }
        changed
    }

    /// Poll until the engine shuts down.
    pub async fn watch(mut self, engine: Arc<SyncEngine>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = engine.watcher().cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.check() {
                tracing::trace!("settings unchanged");
                continue;
            }

            crate::log_event!("settings", "changed", "{}", self.path.display());
            if let Err(e) = engine.reload_settings() {
                tracing::warn!("[settings] reload failed, keeping previous settings: {e}");
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}
