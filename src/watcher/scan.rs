//! Initial discovery of documents already on disk.

use std::path::PathBuf;

use ignore::WalkBuilder;

use crate::document::codec::{self, CodecError};
use crate::document::{Document, TITLE_FIELD};
use crate::index::{FileRecord, SharedIndex};

use super::pipeline::RootRules;

/// Result of scanning one root.
#[derive(Debug, Default)]
pub struct Discovered {
    pub documents: Vec<Document>,
    pub files: usize,
    /// Files that could not be decoded.
    pub failed: Vec<PathBuf>,
}

/// Walk `rules.root()`, index every document file and return the documents.
///
/// Sidecars are read with their primary file. Files of unknown type are
/// skipped silently; unreadable ones are reported in [`Discovered::failed`].
pub fn scan_root(index: &SharedIndex, rules: &RootRules) -> Discovered {
    let root = rules.root().to_path_buf();
    index.write().register_root(root.clone());

    let ignore = rules.ignore.clone();
    let mut builder = WalkBuilder::new(&root);
    builder
        .standard_filters(false)
        .follow_links(!rules.ignore_symlinks)
        .filter_entry(move |entry| !ignore.is_ignored(entry.path()));

    let mut discovered = Discovered::default();
    for entry in builder.build().filter_map(Result::ok) {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if codec::primary_for_sidecar(path).is_some_and(|primary| primary.is_file()) {
            continue;
        }

        let documents = match codec::read_documents(path) {
            Ok(documents) => documents,
            Err(CodecError::Unsupported { .. }) => continue,
            Err(e) => {
                tracing::warn!("[scan] skipping {}: {e}", path.display());
                discovered.failed.push(path.to_path_buf());
                continue;
            }
        };

        if let Some(first) = documents.first() {
            let record = FileRecord::discovered(path, first);
            let mut index = index.write();
            if let Err(e) = index.insert(record) {
                tracing::warn!("[scan] cannot index {}: {e}", path.display());
                continue;
            }
            let bundled = documents[1..]
                .iter()
                .filter_map(|fields| fields.get(TITLE_FIELD).cloned())
                .collect();
            index.set_bundled(path, bundled);
        }

        discovered.files += 1;
        discovered
            .documents
            .extend(documents.into_iter().filter_map(Document::from_fields));
    }

    crate::log_event!(
        "scan",
        "done",
        "{} documents in {} files under {}",
        discovered.documents.len(),
        discovered.files,
        root.display()
    );
    discovered
}
