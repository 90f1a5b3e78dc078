//! Per-root path <-> title map.

use std::collections::HashMap;
use std::collections::hash_map::{Iter, Keys, Values};
use std::path::{Path, PathBuf};

use super::{FileRecord, IndexError};

/// Bidirectional map for a single watched root.
///
/// Keys are paths relative to the root. A path maps to at most one title
/// and a title to at most one path.
#[derive(Debug)]
pub struct FileIndex {
    root: PathBuf,
    by_path: HashMap<PathBuf, FileRecord>,
    by_title: HashMap<String, PathBuf>,
    /// Titles after the first in a multi-document file, by path.
    bundled: HashMap<PathBuf, Vec<String>>,
}

impl FileIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            by_path: HashMap::new(),
            by_title: HashMap::new(),
            bundled: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Track `record` at `path`.
    ///
    /// Drops whatever the title was previously mapped to and returns the
    /// record that occupied `path` if it belonged to another title.
    pub fn set(&mut self, path: impl Into<PathBuf>, record: FileRecord) -> Option<FileRecord> {
        let path = path.into();
        self.bundled.remove(&path);

        if let Some(old_path) = self.by_title.remove(&record.title) {
            if old_path != path {
                self.by_path.remove(&old_path);
                self.bundled.remove(&old_path);
            }
        }

        let title = record.title.clone();
        let displaced = self.by_path.insert(path.clone(), record);
        self.by_title.insert(title.clone(), path);

        match displaced {
            Some(old) if old.title != title => {
                // The path now belongs to another title; forget the old one.
                self.by_title.remove(&old.title);
                Some(old)
            }
            _ => None,
        }
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.by_path.get(path)
    }

    pub fn has(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn delete(&mut self, path: &Path) -> Option<FileRecord> {
        self.bundled.remove(path);
        let record = self.by_path.remove(path)?;
        self.by_title.remove(&record.title);
        Some(record)
    }

    /// Record the other titles stored in the file at `path`.
    ///
    /// Only the first document of a file is tracked as a [`FileRecord`];
    /// the rest ride along so a delete of the file reaches them too.
    pub fn set_bundled(&mut self, path: impl Into<PathBuf>, titles: Vec<String>) {
        let path = path.into();
        if titles.is_empty() || !self.by_path.contains_key(&path) {
            self.bundled.remove(&path);
        } else {
            self.bundled.insert(path, titles);
        }
    }

    pub fn bundled(&self, path: &Path) -> &[String] {
        self.bundled.get(path).map_or(&[], Vec::as_slice)
    }

    /// Title tracked at `path`.
    pub fn title_by_path(&self, path: &Path) -> Result<&str, IndexError> {
        self.by_path
            .get(path)
            .map(|record| record.title.as_str())
            .ok_or_else(|| IndexError::NotFound {
                path: path.to_path_buf(),
            })
    }

    pub fn path_for_title(&self, title: &str) -> Option<&Path> {
        self.by_title.get(title).map(PathBuf::as_path)
    }

    pub fn remove_title(&mut self, title: &str) -> Option<FileRecord> {
        let path = self.by_title.remove(title)?;
        self.bundled.remove(&path);
        self.by_path.remove(&path)
    }

    pub fn iter(&self) -> Iter<'_, PathBuf, FileRecord> {
        self.by_path.iter()
    }

    pub fn keys(&self) -> Keys<'_, PathBuf, FileRecord> {
        self.by_path.keys()
    }

    pub fn values(&self) -> Values<'_, PathBuf, FileRecord> {
        self.by_path.values()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}
