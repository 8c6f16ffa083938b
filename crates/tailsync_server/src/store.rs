//! Files under the served root.

use crate::error::{ServerError, ServerResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncSeekExt;

/// The directory tree a server exposes.
///
/// Appends to one path are serialized through a per-path lock, so two
/// clients appending at once never interleave bytes within an append.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileStore {
    /// Creates a store serving `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the served root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a remote path to a file under the root.
    ///
    /// Leading separators are ignored, so `/shared/f.txt` and `shared/f.txt`
    /// name the same file. Parent components are rejected outright.
    pub fn resolve(&self, remote: &str) -> ServerResult<PathBuf> {
        normalize_under_root(&self.root, remote)
    }

    /// Returns the size of a file, or `None` if it does not exist.
    pub async fn size(&self, path: &Path) -> ServerResult<Option<u64>> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Err(ServerError::InvalidPath(format!(
                "{} is not a file",
                path.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the append lock for a resolved path.
    pub fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Opens a file for appending, creating it and its parents.
    pub async fn open_append(&self, path: &Path) -> ServerResult<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?)
    }

    /// Opens a file for reading at `start`.
    ///
    /// Returns the file and how many bytes lie between `start` and the end
    /// of the file as it is now. A `start` past the end yields zero bytes.
    pub async fn open_read(&self, path: &Path, start: u64) -> ServerResult<(File, u64, u64)> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ServerError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let start = start.min(size);
        file.seek(SeekFrom::Start(start)).await?;
        Ok((file, size, size - start))
    }
}

fn normalize_under_root(root: &Path, remote: &str) -> ServerResult<PathBuf> {
    if remote.contains('\0') {
        return Err(ServerError::InvalidPath("path contains NUL".into()));
    }

    let mut joined = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(remote).components() {
        match component {
            Component::Normal(part) => {
                #[cfg(windows)]
                if part.to_string_lossy().contains(':') {
                    return Err(ServerError::InvalidPath(format!(
                        "{remote}: component contains a colon"
                    )));
                }
                joined.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                return Err(ServerError::InvalidPath(format!(
                    "{remote}: parent components are not allowed"
                )))
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    if depth == 0 {
        return Err(ServerError::InvalidPath(format!("{remote:?} names no file")));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn resolve_strips_leading_slash() {
        let store = FileStore::new("/srv");
        assert_eq!(
            store.resolve("/shared/file1.txt").unwrap(),
            PathBuf::from("/srv/shared/file1.txt")
        );
        assert_eq!(
            store.resolve("./shared/file1.txt").unwrap(),
            PathBuf::from("/srv/shared/file1.txt")
        );
    }

    #[test]
    fn resolve_rejects_escapes() {
        let store = FileStore::new("/srv");
        for bad in ["../etc/passwd", "/shared/../../x", "", "/", "a\0b"] {
            assert!(
                matches!(store.resolve(bad), Err(ServerError::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn same_path_same_lock() {
        let store = FileStore::new("/srv");
        let a = store.lock_for(Path::new("/srv/f"));
        let b = store.lock_for(Path::new("/srv/f"));
        let c = store.lock_for(Path::new("/srv/g"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn append_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let path = store.resolve("/deep/nested/file.log").unwrap();

        assert_eq!(store.size(&path).await.unwrap(), None);
        let mut file = store.open_append(&path).await.unwrap();
        file.write_all(b"hello").await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(store.size(&path).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn open_read_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let path = store.resolve("f").unwrap();
        std::fs::write(&path, b"hello world!").unwrap();

        let (mut file, size, remaining) = store.open_read(&path, 6).await.unwrap();
        assert_eq!(size, 12);
        assert_eq!(remaining, 6);
        let mut out = String::new();
        file.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world!");

        let (_, _, remaining) = store.open_read(&path, 99).await.unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn open_read_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let path = store.resolve("missing").unwrap();
        assert!(matches!(
            store.open_read(&path, 0).await,
            Err(ServerError::NotFound(_))
        ));
    }
}
