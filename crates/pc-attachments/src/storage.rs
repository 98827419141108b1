//! Storage Abstraction
//!
//! Attachment files are keyed by interpolated relative paths such as
//! `users/avatars/1/thumb_me.png`. The filesystem backend is the reference
//! implementation; the in-memory backend serves tests and embedding.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// File metadata from storage
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,
    /// Content type (MIME)
    pub content_type: String,
    /// SHA256 digest
    pub digest: String,
}

impl FileMetadata {
    fn describe(key: &str, data: &[u8]) -> Self {
        Self {
            size: data.len() as u64,
            content_type: guess_content_type(key),
            digest: calculate_digest(data),
        }
    }
}

/// Storage trait - unified interface for storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store data under a key, replacing any previous content
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<FileMetadata>;

    /// Store the contents of a local file under a key
    async fn put_file(&self, key: &str, source: &Path) -> StorageResult<FileMetadata> {
        let data = fs::read(source).await?;
        self.put(key, Bytes::from(data)).await
    }

    /// Retrieve data by key
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Delete data by key. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get storage name for logging
    fn name(&self) -> &str;
}

/// Local filesystem storage
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Root directory for storage
    root: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a full path below the root
    fn resolve_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(StorageError::InvalidPath(key.to_string()));
        }

        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || relative.file_name().is_none() {
            return Err(StorageError::InvalidPath(key.to_string()));
        }

        Ok(self.root.join(relative))
    }

    /// Ensure parent directory exists
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Sibling temp path the final file is renamed from
    fn staging_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
    }

    async fn commit(staging: &Path, path: &Path) -> StorageResult<()> {
        if let Err(e) = fs::rename(staging, path).await {
            let _ = fs::remove_file(staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove directories left empty by a delete, stopping at the root
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();

        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            match fs::remove_dir(dir).await {
                Ok(()) => debug!(dir = ?dir, "Empty directory pruned"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                // not empty, or not ours to remove
                Err(_) => break,
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    #[instrument(skip(self, data), fields(storage = "local"))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<FileMetadata> {
        let path = self.resolve_path(key)?;
        self.ensure_parent(&path).await?;

        let staging = Self::staging_path(&path);
        let written = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Self::commit(&staging, &path).await?;

        debug!(path = ?path, size = data.len(), "File stored");

        Ok(FileMetadata::describe(key, &data))
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn put_file(&self, key: &str, source: &Path) -> StorageResult<FileMetadata> {
        let data = fs::read(source).await?;
        self.put(key, Bytes::from(data)).await
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.resolve_path(key)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve_path(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => debug!(path = ?path, "File deleted"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = ?path, "File already gone")
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "File delete failed");
                return Err(e.into());
            }
        }

        self.prune_empty_parents(&path).await;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.resolve_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// In-memory storage for testing
pub struct MemoryStorage {
    files: RwLock<HashMap<String, (Bytes, FileMetadata)>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    /// All stored keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        let files = self.files.read().await;
        let mut keys: Vec<String> = files.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<FileMetadata> {
        let metadata = FileMetadata::describe(key, &data);

        let mut files = self.files.write().await;
        files.insert(key.to_string(), (data, metadata.clone()));

        Ok(metadata)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let files = self.files.read().await;
        files
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut files = self.files.write().await;
        files.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let files = self.files.read().await;
        Ok(files.contains_key(key))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Calculate SHA256 digest
fn calculate_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Guess content type from filename
fn guess_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .to_string()
}
