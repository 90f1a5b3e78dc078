//! Bidirectional path <-> title index.
//!
//! One [`FileIndex`] exists per watched root (the main root plus any
//! registered sub-roots). [`IndexSet`] groups them, keeps titles unique
//! across roots, and resolves which root owns an absolute path by longest
//! prefix.

mod file_index;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{CANONICAL_URI_FIELD, Fields, TITLE_FIELD, TYPE_FIELD, codec};

pub use file_index::FileIndex;

/// Index shared between the adaptor and the watcher.
pub type SharedIndex = Arc<RwLock<IndexSet>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("No document tracked at {path}")]
    NotFound { path: PathBuf },

    #[error("No watched root owns {path}")]
    NoOwningRoot { path: PathBuf },
}

/// Backing-file information for one tracked document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the owning root.
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub title: String,
    pub content_type: String,
    pub has_sidecar_metadata: bool,
    pub is_editable: bool,
}

impl FileRecord {
    /// Every file backing this record: the primary file and its sidecar.
    pub fn backing_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.absolute_path.clone()];
        if self.has_sidecar_metadata {
            files.push(codec::sidecar_path(&self.absolute_path));
        }
        files
    }

    /// Record for a file found on disk, described by its first document.
    pub fn discovered(absolute_path: impl Into<PathBuf>, fields: &Fields) -> Self {
        let absolute_path = absolute_path.into();
        let content_type = fields
            .get(TYPE_FIELD)
            .filter(|ty| !ty.is_empty())
            .map_or(codec::DEFAULT_CONTENT_TYPE, String::as_str)
            .to_string();
        Self {
            relative_path: PathBuf::new(),
            has_sidecar_metadata: codec::sidecar_path(&absolute_path).is_file(),
            absolute_path,
            title: fields.get(TITLE_FIELD).cloned().unwrap_or_default(),
            content_type,
            is_editable: !fields.contains_key(CANONICAL_URI_FIELD),
        }
    }
}

/// All per-root indexes.
#[derive(Debug, Default)]
pub struct IndexSet {
    roots: HashMap<PathBuf, FileIndex>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set with a single registered root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut set = Self::new();
        set.register_root(root);
        set
    }

    pub fn into_shared(self) -> SharedIndex {
        Arc::new(RwLock::new(self))
    }

    /// Register a root. Returns false when it was already registered.
    pub fn register_root(&mut self, root: impl Into<PathBuf>) -> bool {
        let root = root.into();
        if self.roots.contains_key(&root) {
            return false;
        }
        self.roots.insert(root.clone(), FileIndex::new(root));
        true
    }

    /// Drop a root and everything indexed under it.
    pub fn deregister_root(&mut self, root: &Path) -> Option<FileIndex> {
        self.roots.remove(root)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.roots.keys().map(PathBuf::as_path)
    }

    pub fn root(&self, root: &Path) -> Option<&FileIndex> {
        self.roots.get(root)
    }

    pub fn root_mut(&mut self, root: &Path) -> Option<&mut FileIndex> {
        self.roots.get_mut(root)
    }

    /// The registered root owning `absolute`, by longest prefix.
    pub fn owning_root(&self, absolute: &Path) -> Option<&Path> {
        self.roots
            .keys()
            .filter(|root| absolute.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(PathBuf::as_path)
    }

    /// Split an absolute path into its owning root and the relative remainder.
    pub fn split(&self, absolute: &Path) -> Result<(PathBuf, PathBuf), IndexError> {
        let root = self
            .owning_root(absolute)
            .ok_or_else(|| IndexError::NoOwningRoot {
                path: absolute.to_path_buf(),
            })?;
        let relative = absolute
            .strip_prefix(root)
            .map_err(|_| IndexError::NoOwningRoot {
                path: absolute.to_path_buf(),
            })?;
        Ok((root.to_path_buf(), relative.to_path_buf()))
    }

    /// Look up the record tracked for `title` in any root.
    pub fn record_for_title(&self, title: &str) -> Option<&FileRecord> {
        self.roots
            .values()
            .find_map(|index| index.path_for_title(title).and_then(|path| index.get(path)))
    }

    /// Record tracked at an absolute path.
    pub fn record_at(&self, absolute: &Path) -> Option<&FileRecord> {
        let (root, relative) = self.split(absolute).ok()?;
        self.roots.get(&root)?.get(&relative)
    }

    /// Remember the titles after the first one in the file at `absolute`.
    pub fn set_bundled(&mut self, absolute: &Path, titles: Vec<String>) {
        let Ok((root, relative)) = self.split(absolute) else {
            return;
        };
        if let Some(index) = self.roots.get_mut(&root) {
            index.set_bundled(relative, titles);
        }
    }

    /// Untracked titles stored alongside the tracked one at `absolute`.
    pub fn bundled_at(&self, absolute: &Path) -> Vec<String> {
        let Ok((root, relative)) = self.split(absolute) else {
            return Vec::new();
        };
        self.roots
            .get(&root)
            .map(|index| index.bundled(&relative).to_vec())
            .unwrap_or_default()
    }

    /// Title tracked at an absolute path.
    pub fn title_at(&self, absolute: &Path) -> Result<String, IndexError> {
        let (root, relative) = self.split(absolute)?;
        let index = self
            .roots
            .get(&root)
            .ok_or_else(|| IndexError::NotFound {
                path: absolute.to_path_buf(),
            })?;
        index.title_by_path(&relative).map(str::to_string)
    }

    /// Track `record` at its absolute path.
    ///
    /// Any previous mapping of the record's title, in any root, is removed in
    /// the same step so a title never maps to two paths. Returns the record
    /// previously tracked at the same path, if it belonged to another title.
    pub fn insert(&mut self, record: FileRecord) -> Result<Option<FileRecord>, IndexError> {
        let (root, relative) = self.split(&record.absolute_path)?;
        let record = FileRecord {
            relative_path: relative.clone(),
            ..record
        };

        for (other_root, index) in self.roots.iter_mut() {
            if *other_root != root {
                index.remove_title(&record.title);
            }
        }

        let index = self
            .roots
            .get_mut(&root)
            .ok_or_else(|| IndexError::NoOwningRoot {
                path: record.absolute_path.clone(),
            })?;
        Ok(index.set(relative, record))
    }

    /// Stop tracking the document at an absolute path.
    pub fn remove_path(&mut self, absolute: &Path) -> Option<FileRecord> {
        let (root, relative) = self.split(absolute).ok()?;
        self.roots.get_mut(&root)?.delete(&relative)
    }

    /// Stop tracking `title` wherever it lives.
    pub fn remove_title(&mut self, title: &str) -> Option<FileRecord> {
        self.roots
            .values_mut()
            .find_map(|index| index.remove_title(title))
    }

    /// Total number of tracked documents.
    pub fn len(&self) -> usize {
        self.roots.values().map(FileIndex::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
