//! Local byte-blob storage of a storage node.

use crate::error::StorageError;
use crate::types::name_key;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Named blob storage. Names compare case-insensitively.
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    /// Write `data` under `name`, replacing any previous content.
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Read the content stored under `name`.
    async fn read(&self, name: &str) -> Result<Bytes, StorageError>;

    /// Delete `name`.
    async fn delete(&self, name: &str) -> Result<(), StorageError>;

    /// Names of every stored file, ordered.
    async fn list(&self) -> Result<Vec<String>, StorageError>;
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(&['/', '\\', '\0'][..]);
    if invalid {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Files kept in one directory on disk.
#[derive(Debug)]
pub struct DiskFileStore {
    dir: PathBuf,
    /// Name key to the name the file was written with.
    catalog: RwLock<HashMap<String, String>>,
}

impl DiskFileStore {
    /// Prepare `dir` for use: create it if missing and remove whatever it holds.
    pub async fn prepare(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(StorageError::NotADirectory(dir.display().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(dir = %dir.display(), "Storage directory does not exist, creating");
                tokio::fs::create_dir_all(&dir).await?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(dir = %dir.display(), "Clearing storage directory");
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            result?;
            debug!(path = %path.display(), "Removed stale entry");
        }

        Ok(Self {
            dir,
            catalog: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stored_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        let stored = self
            .catalog
            .read()
            .get(&name_key(name))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        Ok(self.dir.join(stored))
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        validate_name(name)?;
        let key = name_key(name);
        let existing = self.catalog.read().get(&key).cloned();
        let stored = existing.unwrap_or_else(|| name.to_string());
        tokio::fs::write(self.dir.join(&stored), data).await?;
        self.catalog.write().insert(key, stored);
        debug!(file = name, len = data.len(), "Wrote file");
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Bytes, StorageError> {
        let path = self.stored_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = name, "File vanished from disk");
                self.catalog.write().remove(&name_key(name));
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.stored_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.catalog.write().remove(&name_key(name));
        debug!(file = name, "Deleted file");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.catalog.read().values().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, (String, Bytes)>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        validate_name(name)?;
        self.files.write().insert(
            name_key(name),
            (name.to_string(), Bytes::copy_from_slice(data)),
        );
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Bytes, StorageError> {
        self.files
            .read()
            .get(&name_key(name))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.files
            .write()
            .remove(&name_key(name))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self
            .files
            .read()
            .values()
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
