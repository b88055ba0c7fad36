//! # Tether Orchestrator
//!
//! Keeps GPU workloads alive on unreliable spot marketplaces.
//!
//! ## Architecture
//!
//! ```text
//! FailoverOrchestrator ──── supervisor task per workload
//! ├── RaceCoordinator         launch N offers, keep the first ready one
//! ├── SnapshotEngine          seal / restore chunked workspace artifacts
//! ├── HealthProber            poll + liveness command
//! └── Registry                lifecycle state machine, persisted as JSON
//!          │
//!          ▼
//!   MarketplaceDriver (REST)  search / create / poll / destroy / exec
//! ```
//!
//! ## Provisioning race
//!
//! Boot times on spot marketplaces vary by minutes, so a request launches a
//! batch of candidates and keeps the first one to pass every readiness stage.
//! Losers are destroyed. See [`race`].
//!
//! ## Failover
//!
//! A [`FailoverPolicy`] attached to a running primary decides how recovery
//! works:
//!
//! 1. **SnapshotOnly**: periodic snapshots, recovery races a replacement and restores the latest one
//! 2. **HotStandby**: a second resource kept in sync, recovery swaps to it
//! 3. **WarmPool**: an idle reserved resource, recovery swaps to it and restores
//!
//! See [`failover`] and [`snapshot`].

#![warn(clippy::all)]

pub mod assign;
pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod marketplace;
pub mod monitor;
pub mod persist;
pub mod race;
pub mod registry;
pub mod s3_store;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

// Error handling
pub use error::{ExhaustionCause, OrchestratorError, RaceFailure, Result};

// Configuration
pub use config::{MarketplaceConfig, StorageConfig, TetherConfig, WorkspaceConfig};

// Provisioning race
pub use assign::TieBreak;
pub use race::{DataStage, RaceConfig, RaceCoordinator, RaceRequest, RaceSession, RaceStatus};

// Snapshots
pub use s3_store::{create_s3_client, S3ChunkStore};
pub use snapshot::{
    ExecArchiver, LocalChunkStore, LocalDirArchiver, MemoryChunkStore, RestoreStage, SnapshotArtifact,
    SnapshotConfig, SnapshotEngine, ZstdCodec,
};

// Failover orchestration
pub use events::{FailoverEvent, FailoverOutcome, FailoverTrigger};
pub use failover::{FailoverConfig, FailoverOrchestrator, FailoverPolicy, PolicyKind, WorkloadStatus};
pub use monitor::{FailureCounter, HealthProber, ProbeReport};

// Lifecycle state
pub use persist::JsonStateStore;
pub use registry::{Registry, WorkloadPhase, WorkloadRecord};

// Marketplace access
pub use marketplace::RestMarketplaceDriver;
