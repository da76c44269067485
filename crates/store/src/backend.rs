//! Storage capability consumed by the chunk store and merge coordinator.
//!
//! Keys are `/`-separated paths relative to the storage root. Every key
//! component must be a plain name; the store builds keys from validated
//! hashes and filenames only.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StoreError;

/// Boxed future returned by [`StorageBackend`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Filesystem-like capability the store is written against.
pub trait StorageBackend: Send + Sync {
    /// Whether anything exists at `key`.
    fn exists(&self, key: &str) -> StoreFuture<'_, bool>;

    /// Creates the directory `key` and its parents; succeeds if it already exists.
    fn ensure_dir(&self, key: &str) -> StoreFuture<'_, ()>;

    /// Replaces the contents of `key` so that readers see either the old or
    /// the new bytes, never a prefix.
    fn write_atomically(&self, key: &str, data: Vec<u8>) -> StoreFuture<'_, ()>;

    /// Reads the whole entry at `key`.
    fn read(&self, key: &str) -> StoreFuture<'_, Vec<u8>>;

    /// Names of the entries directly under `dir`; empty if `dir` is absent.
    fn list_entries(&self, dir: &str) -> StoreFuture<'_, Vec<String>>;

    /// Byte length of the entry at `key`.
    fn file_len(&self, key: &str) -> StoreFuture<'_, u64>;

    /// Appends the whole of `src` to `dest`, creating `dest` if needed.
    /// Returns the number of bytes appended.
    fn stream_append(&self, dest: &str, src: &str) -> StoreFuture<'_, u64>;

    /// Flushes `key` to stable storage.
    fn sync(&self, key: &str) -> StoreFuture<'_, ()>;

    /// Moves `from` to `to`, replacing `to`.
    fn rename(&self, from: &str, to: &str) -> StoreFuture<'_, ()>;

    /// Removes a single entry; absent entries are ignored.
    fn remove_file(&self, key: &str) -> StoreFuture<'_, ()>;

    /// Removes `dir` recursively; absent directories are ignored.
    fn remove_tree(&self, dir: &str) -> StoreFuture<'_, ()>;
}

/// [`StorageBackend`] over a local directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Creates the backend, creating `root` if it does not exist.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `key` under the root, refusing anything but plain components.
    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        for component in Path::new(key).components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
        }
        Ok(self.root.join(key))
    }
}

fn ignore_not_found(result: std::io::Result<()>) -> Result<(), StoreError> {
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl StorageBackend for FsStorage {
    fn exists(&self, key: &str) -> StoreFuture<'_, bool> {
        let path = self.path(key);
        Box::pin(async move { Ok(fs::try_exists(path?).await?) })
    }

    fn ensure_dir(&self, key: &str) -> StoreFuture<'_, ()> {
        let path = self.path(key);
        Box::pin(async move {
            // create_dir_all tolerates concurrent creators.
            fs::create_dir_all(path?).await?;
            Ok(())
        })
    }

    fn write_atomically(&self, key: &str, data: Vec<u8>) -> StoreFuture<'_, ()> {
        let paths = self
            .path(key)
            .and_then(|path| Ok((path, self.path(&crate::temp_key(key))?)));
        Box::pin(async move {
            let (path, temp_path) = paths?;
            let written = async {
                let mut file = fs::File::create(&temp_path).await?;
                file.write_all(&data).await?;
                file.sync_all().await?;
                fs::rename(&temp_path, &path).await
            }
            .await;
            if let Err(e) = written {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e.into());
            }
            debug!(path = %path.display(), bytes = data.len(), "entry written");
            Ok(())
        })
    }

    fn read(&self, key: &str) -> StoreFuture<'_, Vec<u8>> {
        let path = self.path(key);
        Box::pin(async move { Ok(fs::read(path?).await?) })
    }

    fn list_entries(&self, dir: &str) -> StoreFuture<'_, Vec<String>> {
        let path = self.path(dir);
        Box::pin(async move {
            let mut entries = match fs::read_dir(path?).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
            Ok(names)
        })
    }

    fn file_len(&self, key: &str) -> StoreFuture<'_, u64> {
        let path = self.path(key);
        Box::pin(async move { Ok(fs::metadata(path?).await?.len()) })
    }

    fn stream_append(&self, dest: &str, src: &str) -> StoreFuture<'_, u64> {
        let paths = self
            .path(dest)
            .and_then(|dest| Ok((dest, self.path(src)?)));
        Box::pin(async move {
            let (dest, src) = paths?;
            let mut reader = fs::File::open(&src).await?;
            let mut writer = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&dest)
                .await?;
            let appended = tokio::io::copy(&mut reader, &mut writer).await?;
            writer.flush().await?;
            Ok(appended)
        })
    }

    fn sync(&self, key: &str) -> StoreFuture<'_, ()> {
        let path = self.path(key);
        Box::pin(async move {
            let file = fs::OpenOptions::new().append(true).open(path?).await?;
            file.sync_all().await?;
            Ok(())
        })
    }

    fn rename(&self, from: &str, to: &str) -> StoreFuture<'_, ()> {
        let paths = self.path(from).and_then(|from| Ok((from, self.path(to)?)));
        Box::pin(async move {
            let (from, to) = paths?;
            fs::rename(from, to).await?;
            Ok(())
        })
    }

    fn remove_file(&self, key: &str) -> StoreFuture<'_, ()> {
        let path = self.path(key);
        Box::pin(async move { ignore_not_found(fs::remove_file(path?).await) })
    }

    fn remove_tree(&self, dir: &str) -> StoreFuture<'_, ()> {
        let path = self.path(dir);
        Box::pin(async move { ignore_not_found(fs::remove_dir_all(path?).await) })
    }
}
