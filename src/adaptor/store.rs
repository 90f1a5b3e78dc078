//! File persistence capability and error classification.

use std::io::{self, Write};
use std::path::Path;

use async_trait::async_trait;

/// Native file primitives used by the adaptor.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Write `contents` to `path`, creating parent directories.
    async fn write(&self, path: &Path, contents: &str) -> io::Result<()>;

    async fn remove(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;
}

/// Local filesystem store with atomic replace-on-write.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileStore;

impl LocalFileStore {
    fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
        std::fs::create_dir_all(parent)?;

        // Temp file in the same directory keeps the rename on one filesystem.
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)?;
        temp.write_all(contents)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Prefix of temp files created during atomic writes.
pub const TEMP_PREFIX: &str = ".tidsync-";

#[async_trait]
impl FileStore for LocalFileStore {
    async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let path = path.to_path_buf();
        let contents = contents.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &contents))
            .await
            .map_err(io::Error::other)?
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Whether a write error is a transient lock/busy condition worth retrying.
///
/// Covers EBUSY, EPERM/EACCES and EAGAIN on Unix and sharing/lock
/// violations on Windows.
pub fn is_transient(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock
    ) {
        return true;
    }

    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        if matches!(error.raw_os_error(), Some(32) | Some(33)) {
            return true;
        }
    }

    false
}

/// Whether a delete failed because unlinking was not permitted.
pub fn is_permission_denied(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::PermissionDenied
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ResourceBusy)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(!is_transient(&io::Error::other("disk on fire")));
    }

    #[tokio::test]
    async fn test_local_store_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("x.tid");

        LocalFileStore.write(&path, "title: X\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "title: X\n");
        assert!(LocalFileStore.exists(&path));

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_store_overwrite_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.tid");

        LocalFileStore.write(&path, "one").await.unwrap();
        LocalFileStore.write(&path, "two").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");

        LocalFileStore.remove(&path).await.unwrap();
        assert!(!path.exists());
        let err = LocalFileStore.remove(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
