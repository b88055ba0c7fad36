//! Chunk stores backed by memory and local disk
//!
//! The S3 store lives in [`crate::s3_store`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tether_core::traits::Result;
use tether_core::{ChunkStore, TetherError};
use tracing::debug;

/// Chunks in process memory
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.chunks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put_chunk(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.chunks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_chunk(&self, key: &str) -> Result<Vec<u8>> {
        self.chunks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| TetherError::NotFound(key.to_string()))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .chunks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_keys(&self, prefix: &str) -> Result<()> {
        self.chunks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// One file per key under a root directory (`a/b` is stored as `root/a/b`)
#[derive(Debug, Clone)]
pub struct LocalChunkStore {
    root: PathBuf,
}

impl LocalChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(TetherError::Storage(format!("invalid key: {}", key)));
        }
        Ok(self.root.join(key))
    }

    /// Temp file of an in-progress write: the full file name plus `.partial`
    fn partial_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".partial");
        PathBuf::from(name)
    }

    fn storage_err(key: &str, e: std::io::Error) -> TetherError {
        if e.kind() == std::io::ErrorKind::NotFound {
            TetherError::NotFound(key.to_string())
        } else {
            TetherError::Storage(format!("{}: {}", key, e))
        }
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn put_chunk(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::storage_err(key, e))?;
        }

        // Write then rename so readers never see a partial chunk.
        let tmp = Self::partial_path(&path);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Self::storage_err(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::storage_err(key, e))?;

        debug!(key, bytes = bytes.len(), "Chunk stored");
        Ok(())
    }

    async fn get_chunk(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key)?;
        tokio::fs::read(&path).await.map_err(|e| Self::storage_err(key, e))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            if !root.exists() {
                return Ok(keys);
            }
            for entry in walkdir::WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| TetherError::Storage(format!("walk: {}", e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(".partial") {
                    continue;
                }
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| TetherError::Internal(e.to_string()))?
    }

    async fn delete_keys(&self, prefix: &str) -> Result<()> {
        for key in self.list_keys(prefix).await? {
            let path = self.path(&key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Self::storage_err(&key, e)),
            }
        }
        Ok(())
    }
}
