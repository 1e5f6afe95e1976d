//! Recording file store.
//!
//! Filesystem operations confined to the recording base folder. Every
//! public operation takes a basename, never a path: anything containing a
//! separator or a parent-directory reference is rejected before it touches
//! the filesystem. Listings skip directories and symlinks and come back
//! newest first.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("Invalid file name")]
    InvalidName,
    #[error("File not found")]
    NotFound,
    #[error("Base folder does not exist")]
    NoBaseFolder,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct FileStatus {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub suffix: String,
    pub modified: Option<SystemTime>,
    pub birth_time: Option<SystemTime>,
    pub is_readable: bool,
}

#[derive(Clone)]
pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    pub fn new(base: PathBuf) -> Self {
        FileStore { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// A safe basename is non-empty and names a single path component:
    /// no `..`, no `/`, no `\`.
    pub fn is_safe_basename(name: &str) -> bool {
        !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
    }

    /// Absolute path of `name` under the base folder.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, FileStoreError> {
        if !Self::is_safe_basename(name) {
            return Err(FileStoreError::InvalidName);
        }
        let joined = self.base.join(name);
        Ok(std::path::absolute(&joined).unwrap_or(joined))
    }

    /// Regular files in the base folder, newest mtime first. Directories
    /// and symlinks are excluded; `ext_filter` keeps only matching
    /// extensions (case-insensitive).
    pub fn list(&self, ext_filter: Option<&str>) -> Result<Vec<FileEntry>, FileStoreError> {
        if !self.base.is_dir() {
            return Err(FileStoreError::NoBaseFolder);
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            // file_type() does not follow symlinks, so links fail is_file.
            let file_type = entry.file_type()?;
            if !file_type.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(ext) = ext_filter {
                let matches = Path::new(&name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case(ext))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }

            let metadata = entry.metadata()?;
            files.push(FileEntry {
                name,
                size_bytes: metadata.len(),
                modified: metadata.modified().ok(),
            });
        }

        files.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(files)
    }

    pub fn stat(&self, name: &str) -> Result<FileStatus, FileStoreError> {
        let path = self.resolve(name)?;
        let metadata = std::fs::metadata(&path).map_err(|_| FileStoreError::NotFound)?;
        if !metadata.is_file() {
            return Err(FileStoreError::NotFound);
        }

        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();

        Ok(FileStatus {
            name: name.to_string(),
            size_bytes: metadata.len(),
            suffix,
            modified: metadata.modified().ok(),
            // Birth time is best-effort; not every filesystem records it.
            birth_time: metadata.created().ok(),
            is_readable: std::fs::File::open(&path).is_ok(),
            path,
        })
    }

    pub fn remove(&self, name: &str) -> Result<(), FileStoreError> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(FileStoreError::NotFound);
        }
        std::fs::remove_file(&path)?;
        log::info!("deleted recording {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store_with_files(names: &[&str]) -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"data").unwrap();
            // Distinct mtimes so the newest-first order is deterministic.
            std::thread::sleep(Duration::from_millis(20));
        }
        (FileStore::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn basename_safety() {
        assert!(FileStore::is_safe_basename("rec_cam01_2025-11-29_12-58-03.mp4"));
        assert!(!FileStore::is_safe_basename(""));
        assert!(!FileStore::is_safe_basename(".."));
        assert!(!FileStore::is_safe_basename("../etc/passwd"));
        assert!(!FileStore::is_safe_basename("a/b.mp4"));
        assert!(!FileStore::is_safe_basename("a\\b.mp4"));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let (store, _dir) = store_with_files(&[]);
        assert!(matches!(
            store.resolve("../escape.mp4"),
            Err(FileStoreError::InvalidName)
        ));
    }

    #[test]
    fn list_is_newest_first_and_filtered() {
        let (store, dir) = store_with_files(&["a.mp4", "b.txt", "c.mp4"]);
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let mp4s = store.list(Some("mp4")).unwrap();
        let names: Vec<_> = mp4s.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["c.mp4", "a.mp4"]);

        let all = store.list(None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|f| f.name != "subdir"));
    }

    #[cfg(unix)]
    #[test]
    fn list_excludes_symlinks() {
        let (store, dir) = store_with_files(&["real.mp4"]);
        std::os::unix::fs::symlink(dir.path().join("real.mp4"), dir.path().join("link.mp4"))
            .unwrap();
        let files = store.list(Some("mp4")).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "real.mp4");
    }

    #[test]
    fn missing_base_folder_is_reported() {
        let store = FileStore::new(PathBuf::from("/nonexistent/vantage-test"));
        assert!(matches!(store.list(None), Err(FileStoreError::NoBaseFolder)));
    }

    #[test]
    fn stat_reports_size_and_suffix() {
        let (store, _dir) = store_with_files(&["a.mp4"]);
        let status = store.stat("a.mp4").unwrap();
        assert_eq!(status.size_bytes, 4);
        assert_eq!(status.suffix, "mp4");
        assert!(status.is_readable);
        assert!(status.modified.is_some());

        assert!(matches!(store.stat("b.mp4"), Err(FileStoreError::NotFound)));
    }

    #[test]
    fn remove_then_stat_fails() {
        let (store, _dir) = store_with_files(&["a.mp4"]);
        store.remove("a.mp4").unwrap();
        assert!(matches!(store.stat("a.mp4"), Err(FileStoreError::NotFound)));
        assert!(matches!(store.remove("a.mp4"), Err(FileStoreError::NotFound)));
    }
}
