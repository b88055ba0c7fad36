//! Snapshot engine
//!
//! Seals a resource's working directory into an immutable, chunked artifact and
//! restores it onto another resource.
//!
//! ```text
//! archive ─► split into N chunks ─► compress each ─► upload (bounded pool)
//!                                                        │
//!                    {artifact_id}/0 .. {artifact_id}/N-1, {artifact_id}/manifest
//! ```
//!
//! Restore downloads with the same bounded pool, decompresses each chunk on its
//! own, reassembles by chunk index and verifies the SHA-256 of the archive
//! before anything is extracted.

pub mod archive;
pub mod codec;
pub mod engine;
pub mod store;

pub use archive::{ExecArchiver, LocalDirArchiver};
pub use codec::ZstdCodec;
pub use engine::{RestoreStage, SnapshotEngine};
pub use store::{LocalChunkStore, MemoryChunkStore};

use crate::config::duration_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tether_core::{ResourceId, WorkloadId};

/// Snapshot tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Fixed number of chunks per artifact
    pub chunk_count: usize,

    /// Concurrent chunk transfers
    pub workers: usize,

    /// Attempts per chunk transfer
    pub max_attempts: u32,

    /// Wait before the first retry; doubled for each further one
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,

    /// Bound on one chunk transfer
    #[serde(with = "duration_ms")]
    pub transfer_timeout: Duration,

    pub compression_level: i32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            chunk_count: 32,
            workers: 8,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            transfer_timeout: Duration::from_secs(120),
            compression_level: 3,
        }
    }
}

impl SnapshotConfig {
    /// Set chunk count
    pub fn with_chunk_count(mut self, chunk_count: usize) -> Self {
        self.chunk_count = chunk_count;
        self
    }

    /// Set worker pool size
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set attempts per chunk
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// A sealed snapshot. Immutable once returned by `seal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotArtifact {
    pub id: String,
    pub workload_id: WorkloadId,
    pub source_resource_id: ResourceId,
    pub created_at: DateTime<Utc>,

    /// SHA-256 (hex) of the archive before compression
    pub content_hash: String,

    pub original_size: u64,
    pub compressed_size: u64,
    pub chunk_count: usize,

    /// Chunk keys, by chunk index
    pub storage_locations: Vec<String>,
}

impl SnapshotArtifact {
    /// Key of chunk `index`
    pub fn chunk_key(&self, index: usize) -> String {
        self.storage_locations
            .get(index)
            .cloned()
            .unwrap_or_else(|| chunk_key(&self.id, index))
    }
}

/// One entry of a stored manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub index: usize,
    pub key: String,
    pub compressed_size: u64,
}

/// Stored next to the chunks so an artifact can be found with `list_keys`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub artifact: SnapshotArtifact,
    pub chunks: Vec<ChunkEntry>,
}

/// Key prefix of every object belonging to an artifact
pub fn artifact_prefix(artifact_id: &str) -> String {
    format!("{}/", artifact_id)
}

pub fn chunk_key(artifact_id: &str, index: usize) -> String {
    format!("{}/{}", artifact_id, index)
}

pub fn manifest_key(artifact_id: &str) -> String {
    format!("{}/manifest", artifact_id)
}

/// SHA-256 hex digest
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Split into exactly `count` chunks.
///
/// The first `len % count` chunks are one byte longer than the rest, so the
/// boundaries depend only on the length. Chunks may be empty.
pub fn split_chunks(data: &[u8], count: usize) -> Vec<&[u8]> {
    let count = count.max(1);
    let base = data.len() / count;
    let extra = data.len() % count;

    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0;
    for i in 0..count {
        let len = base + usize::from(i < extra);
        chunks.push(&data[offset..offset + len]);
        offset += len;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_boundaries() {
        let data: Vec<u8> = (0..10).collect();
        let chunks = split_chunks(&data, 3);
        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn test_split_chunks_tiny_archive() {
        let chunks = split_chunks(b"ab", 4);
        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1, 1, 0, 0]);
        assert_eq!(split_chunks(b"", 5).len(), 5);
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_keys() {
        assert_eq!(chunk_key("a-1", 7), "a-1/7");
        assert_eq!(manifest_key("a-1"), "a-1/manifest");
        assert!(chunk_key("a-1", 0).starts_with(&artifact_prefix("a-1")));
    }
}
