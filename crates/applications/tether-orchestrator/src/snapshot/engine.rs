//! Seal and restore

use super::{
    artifact_prefix, chunk_key, content_hash, manifest_key, split_chunks, ChunkEntry, ChunkManifest,
    SnapshotArtifact, SnapshotConfig,
};
use crate::error::{OrchestratorError, Result};
use crate::race::DataStage;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ChunkCodec, ChunkStore, ResourceHandle, TetherError, WorkspaceArchiver};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunked, compressed, hash-verified snapshots
pub struct SnapshotEngine {
    store: Arc<dyn ChunkStore>,
    codec: Arc<dyn ChunkCodec>,
    archiver: Arc<dyn WorkspaceArchiver>,
    config: SnapshotConfig,
}

impl SnapshotEngine {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        codec: Arc<dyn ChunkCodec>,
        archiver: Arc<dyn WorkspaceArchiver>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            store,
            codec,
            archiver,
            config,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Freeze the working directory of `resource` into a new artifact
    pub async fn seal(&self, resource: &ResourceHandle, cancel: &CancellationToken) -> Result<SnapshotArtifact> {
        let started = Instant::now();
        let archive = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            archive = self.archiver.archive(resource) => archive?,
        };

        let artifact_id = uuid::Uuid::new_v4().to_string();
        let hash = content_hash(&archive);
        let chunk_count = self.config.chunk_count.max(1);

        debug!(
            artifact_id = %artifact_id,
            resource_id = %resource.id,
            bytes = archive.len(),
            chunk_count,
            "Sealing"
        );

        let archive = Arc::new(archive);
        let uploads = stream::iter(0..chunk_count)
            .map(|index| self.upload_chunk(&artifact_id, archive.clone(), chunk_count, index, cancel))
            .buffer_unordered(self.config.workers.max(1));
        tokio::pin!(uploads);

        let mut entries: Vec<Option<ChunkEntry>> = vec![None; chunk_count];
        while let Some(result) = uploads.next().await {
            match result {
                Ok(entry) => {
                    let index = entry.index;
                    entries[index] = Some(entry);
                }
                Err(e) => {
                    self.discard_partial(&artifact_id).await;
                    return Err(e);
                }
            }
        }
        let entries: Vec<ChunkEntry> = entries.into_iter().flatten().collect();

        let artifact = SnapshotArtifact {
            id: artifact_id.clone(),
            workload_id: resource.workload_id.clone(),
            source_resource_id: resource.id.clone(),
            created_at: Utc::now(),
            content_hash: hash,
            original_size: archive.len() as u64,
            compressed_size: entries.iter().map(|e| e.compressed_size).sum(),
            chunk_count,
            storage_locations: entries.iter().map(|e| e.key.clone()).collect(),
        };

        let manifest = ChunkManifest {
            artifact: artifact.clone(),
            chunks: entries,
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let key = manifest_key(&artifact_id);
        if let Err(e) = self
            .with_retry(&key, cancel, || self.store.put_chunk(&key, manifest_bytes.clone()))
            .await
        {
            self.discard_partial(&artifact_id).await;
            return Err(e);
        }

        info!(
            artifact_id = %artifact.id,
            resource_id = %resource.id,
            original_size = artifact.original_size,
            compressed_size = artifact.compressed_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot sealed"
        );
        Ok(artifact)
    }

    async fn upload_chunk(
        &self,
        artifact_id: &str,
        archive: Arc<Vec<u8>>,
        chunk_count: usize,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<ChunkEntry> {
        let codec = self.codec.clone();
        let compressed = tokio::task::spawn_blocking(move || {
            let chunk = split_chunks(&archive, chunk_count)[index];
            codec.compress(chunk)
        })
        .await
        .map_err(|e| TetherError::Internal(e.to_string()))??;

        let key = chunk_key(artifact_id, index);
        let compressed_size = compressed.len() as u64;
        self.with_retry(&key, cancel, || self.store.put_chunk(&key, compressed.clone()))
            .await?;

        Ok(ChunkEntry {
            index,
            key,
            compressed_size,
        })
    }

    async fn discard_partial(&self, artifact_id: &str) {
        if let Err(e) = self.store.delete_keys(&artifact_prefix(artifact_id)).await {
            warn!(artifact_id, error = %e, "Failed to clean up partial artifact");
        }
    }

    /// Restore `artifact` into the working directory of `target`.
    ///
    /// Content is verified against the sealed hash before extraction; a
    /// mismatch or an undecodable chunk is an `IntegrityFailure`.
    pub async fn restore(
        &self,
        artifact: &SnapshotArtifact,
        target: &ResourceHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        debug!(artifact_id = %artifact.id, resource_id = %target.id, "Restoring");

        let downloads = stream::iter(0..artifact.chunk_count)
            .map(|index| self.download_chunk(artifact, index, cancel))
            .buffer_unordered(self.config.workers.max(1));
        tokio::pin!(downloads);

        let mut chunks: Vec<Option<Vec<u8>>> = vec![None; artifact.chunk_count];
        while let Some(result) = downloads.next().await {
            let (index, bytes) = result?;
            chunks[index] = Some(bytes);
        }

        // Reassemble by index, never by completion order.
        let mut archive = Vec::with_capacity(artifact.original_size as usize);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let chunk = chunk.ok_or_else(|| OrchestratorError::integrity(&artifact.id, format!("chunk {} missing", index)))?;
            archive.extend_from_slice(&chunk);
        }

        if archive.len() as u64 != artifact.original_size {
            return Err(OrchestratorError::integrity(
                &artifact.id,
                format!("size {} != sealed size {}", archive.len(), artifact.original_size),
            ));
        }
        let hash = content_hash(&archive);
        if hash != artifact.content_hash {
            return Err(OrchestratorError::integrity(
                &artifact.id,
                format!("hash {} != sealed hash {}", hash, artifact.content_hash),
            ));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            res = self.archiver.extract(target, archive) => res?,
        }

        info!(
            artifact_id = %artifact.id,
            resource_id = %target.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot restored"
        );
        Ok(())
    }

    async fn download_chunk(
        &self,
        artifact: &SnapshotArtifact,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<(usize, Vec<u8>)> {
        let key = artifact.chunk_key(index);
        let compressed = self.with_retry(&key, cancel, || self.store.get_chunk(&key)).await?;

        let codec = self.codec.clone();
        let decoded = tokio::task::spawn_blocking(move || codec.decompress(&compressed))
            .await
            .map_err(|e| TetherError::Internal(e.to_string()))?;

        match decoded {
            Ok(bytes) => Ok((index, bytes)),
            Err(e) => Err(OrchestratorError::integrity(
                &artifact.id,
                format!("chunk {} does not decode: {}", index, e),
            )),
        }
    }

    /// Run a transfer with the bounded retry budget
    async fn with_retry<T, F, Fut>(&self, key: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = tether_core::traits::Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.retry_backoff;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                res = timeout(self.config.transfer_timeout, op()) => res,
            };

            let reason = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.config.transfer_timeout),
            };

            if attempt >= attempts {
                return Err(OrchestratorError::TransferFailure {
                    key: key.to_string(),
                    attempts,
                    reason,
                });
            }

            warn!(key, attempt, reason = %reason, "Chunk transfer failed, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2).min(Duration::from_secs(60));
        }
    }

    /// Read an artifact back from its stored manifest
    pub async fn load_artifact(&self, artifact_id: &str) -> Result<SnapshotArtifact> {
        let bytes = self.store.get_chunk(&manifest_key(artifact_id)).await?;
        let manifest: ChunkManifest = serde_json::from_slice(&bytes)?;
        Ok(manifest.artifact)
    }

    /// Every artifact with a manifest in the store, oldest first
    pub async fn discover(&self) -> Result<Vec<SnapshotArtifact>> {
        let mut artifacts = Vec::new();
        for key in self.store.list_keys("").await? {
            if let Some(artifact_id) = key.strip_suffix("/manifest") {
                match self.load_artifact(artifact_id).await {
                    Ok(artifact) => artifacts.push(artifact),
                    Err(e) => warn!(key = %key, error = %e, "Skipping unreadable manifest"),
                }
            }
        }
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    /// Delete every stored object of an artifact. Used by retention sweeps.
    pub async fn purge(&self, artifact_id: &str) -> Result<()> {
        self.store.delete_keys(&artifact_prefix(artifact_id)).await?;
        info!(artifact_id, "Artifact purged");
        Ok(())
    }
}

/// Race data stage that restores an artifact into each candidate
pub struct RestoreStage {
    engine: Arc<SnapshotEngine>,
    artifact: SnapshotArtifact,
}

impl RestoreStage {
    pub fn new(engine: Arc<SnapshotEngine>, artifact: SnapshotArtifact) -> Self {
        Self { engine, artifact }
    }
}

#[async_trait]
impl DataStage for RestoreStage {
    async fn prepare(&self, candidate: &ResourceHandle, cancel: &CancellationToken) -> Result<()> {
        self.engine.restore(&self.artifact, candidate, cancel).await
    }
}
