//! Tether Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - the race coordinator (provisioning candidates on a spot marketplace)
//! - the snapshot engine (sealing and restoring working directories)
//! - the failover orchestrator (supervising primaries)
//!
//! Key types:
//! - MarketplaceDriver trait (interface for the remote marketplace)
//! - ChunkStore / ChunkCodec / WorkspaceArchiver traits (snapshot capabilities)
//! - Resource handles and the lifecycle state machine
//! - Error types

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
