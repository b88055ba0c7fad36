//! Core traits for Tether
//!
//! The MarketplaceDriver trait is the only way the orchestrator talks to the
//! marketplace. Snapshot storage, compression and archiving are likewise
//! capabilities behind traits so the orchestration logic never depends on a
//! concrete transport or codec.

use async_trait::async_trait;

use crate::error::TetherError;
use crate::types::*;

/// Result type for capability operations
pub type Result<T> = std::result::Result<T, TetherError>;

/// Interface to a single spot marketplace.
///
/// All resource-addressing calls take the marketplace-assigned id
/// (`ResourceHandle::remote_id`).
#[async_trait]
pub trait MarketplaceDriver: Send + Sync {
    /// Offers currently matching `spec`
    async fn search(&self, spec: &ResourceSpec) -> Result<Vec<Offer>>;

    /// Rent the resource behind `offer`. `label` is attached to the remote resource.
    async fn create(&self, offer: &Offer, label: &str) -> Result<Provisioned>;

    /// Current remote status
    async fn poll(&self, remote_id: &str) -> Result<StatusSnapshot>;

    /// Release the resource. Destroying an unknown resource succeeds.
    async fn destroy(&self, remote_id: &str) -> Result<()>;

    /// Run a shell command on the resource
    async fn exec(&self, remote_id: &str, command: &str) -> Result<ExecOutput>;

    async fn pause(&self, remote_id: &str) -> Result<()>;

    async fn resume(&self, remote_id: &str) -> Result<()>;
}

/// Durable key/value storage for snapshot chunks.
///
/// Read-after-write is strongly consistent per key.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn put_chunk(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get_chunk(&self, key: &str) -> Result<Vec<u8>>;

    /// Keys starting with `prefix`, sorted
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete_keys(&self, prefix: &str) -> Result<()>;
}

/// Byte-in/byte-out chunk compression.
///
/// `decompress(compress(x)) == x`, and every compressed chunk decodes on its own.
pub trait ChunkCodec: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Turns a resource's working directory into an archive and back.
///
/// Archiving an unchanged directory must produce identical bytes.
#[async_trait]
pub trait WorkspaceArchiver: Send + Sync {
    async fn archive(&self, resource: &ResourceHandle) -> Result<Vec<u8>>;

    /// Replace the working directory of `resource` with the archive contents
    async fn extract(&self, resource: &ResourceHandle, archive: Vec<u8>) -> Result<()>;
}
