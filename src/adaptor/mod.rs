//! Persistence of documents to their backing files.
//!
//! The adaptor decides where a document lives (through the [`Router`]),
//! writes it with retry on transient lock errors, and keeps the index and
//! the watcher's exclusions consistent with what it wrote.

pub mod alert;
pub mod store;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::config::RetryConfig;
use crate::document::{Document, codec};
use crate::error::{Result, SyncError};
use crate::index::{FileRecord, IndexError, SharedIndex};
use crate::router::Router;
use crate::watcher::Exclusions;

pub use alert::{Alert, AlertLog, AlertSink};
pub use store::{FileStore, LocalFileStore};

/// Exponential backoff for writes that hit a lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_delay)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Writes and deletes documents on behalf of the host store.
pub struct Adaptor {
    index: SharedIndex,
    router: Arc<Router>,
    store: Arc<dyn FileStore>,
    exclusions: Exclusions,
    alerts: Arc<dyn AlertSink>,
    retry: RetryPolicy,
}

impl Adaptor {
    pub fn new(index: SharedIndex, router: Arc<Router>, exclusions: Exclusions) -> Self {
        Self {
            index,
            router,
            store: Arc::new(LocalFileStore),
            exclusions,
            alerts: Arc::new(AlertLog::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Persist `doc` and return the record now tracking it.
    ///
    /// The target path is excluded from the watcher for the duration of the
    /// write. Old backing files are removed only after the new ones are
    /// written, so a failed save never loses the previous copy.
    pub async fn save(&self, doc: &Document) -> Result<FileRecord> {
        let title = doc.title().to_string();
        let encoded = codec::encode(doc)?;
        let current = self.index.read().record_for_title(&title).cloned();
        let target = self.target_path(doc, current.as_ref(), encoded.extension);

        let mut written = vec![target.clone()];
        if encoded.sidecar.is_some() {
            written.push(codec::sidecar_path(&target));
        }
        for path in &written {
            self.exclusions.exclude(path);
        }

        if let Err(e) = self.write_all(&title, &target, &encoded).await {
            self.release(&written);
            self.raise_alert(&title, &e);
            return Err(e);
        }

        if let Some(old) = &current {
            let stale: Vec<PathBuf> = old
                .backing_files()
                .into_iter()
                .filter(|path| !written.contains(path))
                .collect();
            self.remove_stale(&title, &stale).await;
        }

        let record = FileRecord {
            relative_path: PathBuf::new(),
            absolute_path: target.clone(),
            title: title.clone(),
            content_type: encoded.content_type.clone(),
            has_sidecar_metadata: encoded.sidecar.is_some(),
            is_editable: doc.is_editable(),
        };
        let stored = {
            let mut index = self.index.write();
            if index.owning_root(&target).is_none() {
                index.register_root(self.router.resolve_target(doc).root_directory);
            }
            match index.insert(record) {
                Ok(_) => index
                    .record_for_title(&title)
                    .cloned()
                    .ok_or_else(|| IndexError::NotFound {
                        path: target.clone(),
                    }),
                Err(e) => Err(e),
            }
        };
        self.release(&written);

        let stored = stored?;
        crate::log_event!("adaptor", "saved", "'{title}' -> {}", target.display());
        Ok(stored)
    }

    /// Remove the backing files of `title`.
    ///
    /// A missing file counts as deleted. A permission error is reported as an
    /// alert but not returned, and the index entry is kept.
    pub async fn delete(&self, title: &str) -> Result<()> {
        let Some(record) = self.index.read().record_for_title(title).cloned() else {
            crate::debug_event!("adaptor", "delete of untracked title", "'{title}'");
            self.router.forget(title);
            return Ok(());
        };

        let files = record.backing_files();
        for path in &files {
            self.exclusions.exclude(path);
        }

        let mut denied = false;
        for path in &files {
            match self.store.remove(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    crate::debug_event!("adaptor", "already gone", "{}", path.display());
                }
                Err(e) if store::is_permission_denied(&e) => {
                    tracing::warn!("[adaptor] cannot delete {}: {e}", path.display());
                    self.alerts.raise(Alert::new(
                        title,
                        format!("Cannot delete {}: {e}", path.display()),
                        1,
                    ));
                    denied = true;
                }
                Err(source) => {
                    self.release(&files);
                    return Err(SyncError::Delete {
                        title: title.to_string(),
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        self.release(&files);

        if !denied {
            self.index.write().remove_title(title);
            self.router.forget(title);
            crate::log_event!("adaptor", "deleted", "'{title}'");
        }
        Ok(())
    }

    fn target_path(&self, doc: &Document, current: Option<&FileRecord>, extension: &str) -> PathBuf {
        let index = self.index.read();
        let title = doc.title();
        let is_taken = |candidate: &Path| {
            if current.is_some_and(|c| c.absolute_path == candidate) {
                return false;
            }
            match index.record_at(candidate) {
                Some(record) => record.title != title,
                None => self.store.exists(candidate),
            }
        };
        self.router.target_path(doc, current, extension, &is_taken)
    }

    async fn write_all(
        &self,
        title: &str,
        target: &Path,
        encoded: &codec::EncodedDocument,
    ) -> Result<()> {
        self.write_with_retry(title, target, &encoded.content).await?;
        if let Some(sidecar) = &encoded.sidecar {
            self.write_with_retry(title, &codec::sidecar_path(target), sidecar)
                .await?;
        }
        Ok(())
    }

    /// Write once, retrying transient lock errors with exponential backoff.
    async fn write_with_retry(&self, title: &str, path: &Path, contents: &str) -> Result<u32> {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.retry.max_attempts;
        let store = &self.store;

        let outcome = backoff::future::retry_notify(
            self.retry.backoff(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    store.write(path, contents).await.map_err(|e| {
                        if store::is_transient(&e) && attempt < max_attempts {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: io::Error, delay: Duration| {
                tracing::warn!(
                    "[adaptor] write of '{title}' failed (attempt {}), retrying in {delay:?}: {e}",
                    attempts.load(Ordering::SeqCst)
                );
            },
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match outcome {
            Ok(()) => Ok(attempts),
            Err(source) if store::is_transient(&source) => Err(SyncError::RetriesExhausted {
                title: title.to_string(),
                path: path.to_path_buf(),
                attempts,
                source,
            }),
            Err(source) => Err(SyncError::Write {
                title: title.to_string(),
                path: path.to_path_buf(),
                attempts,
                source,
            }),
        }
    }

    async fn remove_stale(&self, title: &str, stale: &[PathBuf]) {
        for path in stale {
            self.exclusions.exclude(path);
            match self.store.remove(path).await {
                Ok(()) => crate::debug_event!("adaptor", "removed old file", "{}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "[adaptor] '{title}' moved but {} could not be removed: {e}",
                    path.display()
                ),
            }
        }
        self.release(stale);
    }

    fn release(&self, paths: &[PathBuf]) {
        for path in paths {
            self.exclusions.schedule_inclusion(path);
        }
    }

    fn raise_alert(&self, title: &str, error: &SyncError) {
        self.alerts.raise(Alert::new(
            title,
            error.to_string(),
            error.attempts().unwrap_or(1),
        ));
    }
}
