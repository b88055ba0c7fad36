//! Error types for the orchestrator

use crate::events::FailoverEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_core::{RaceId, ResourceId, ResourceState, TetherError, WorkloadId};
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Why a race ran out of candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionCause {
    /// The market had nothing to offer after the first batch
    NoOffers,
    /// Every candidate hit a stage deadline
    AllTimedOut,
    /// Every candidate died during setup
    AllFailed,
    /// Some candidates timed out, others died
    Mixed,
}

impl std::fmt::Display for ExhaustionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NoOffers => "market had nothing left to offer",
            Self::AllTimedOut => "every candidate was too slow",
            Self::AllFailed => "every candidate died mid-setup",
            Self::Mixed => "candidates were too slow or died mid-setup",
        };
        f.write_str(text)
    }
}

/// Last error of one discarded candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFailure {
    pub resource_id: ResourceId,
    pub offer_id: String,
    pub batch_index: usize,
    /// Stage the candidate was in
    pub stage: String,
    pub timed_out: bool,
    pub error: String,
}

/// Details of a session-terminal race failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceFailure {
    pub race_id: RaceId,
    pub batches_attempted: usize,
    pub cause: ExhaustionCause,
    pub candidates: Vec<CandidateFailure>,
}

impl std::fmt::Display for RaceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "race {} exhausted {} batch(es), {}",
            self.race_id, self.batches_attempted, self.cause
        )?;
        for c in &self.candidates {
            write!(f, "; {} ({}) at {}: {}", c.resource_id, c.offer_id, c.stage, c.error)?;
        }
        Ok(())
    }
}

/// Errors that can occur in the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No matching capacity at request time
    #[error("No offer matches {0}")]
    OfferUnavailable(String),

    /// A candidate exceeded a stage deadline
    #[error("Resource {resource_id} timed out in stage {stage} after {timeout:?}")]
    ProvisioningTimeout {
        resource_id: ResourceId,
        stage: String,
        timeout: Duration,
    },

    /// Every batch was exhausted without a usable candidate
    #[error("No capacity available: {0}")]
    NoCapacityAvailable(Box<RaceFailure>),

    /// A chunk could not be transferred within the retry budget
    #[error("Transfer of {key} failed after {attempts} attempt(s): {reason}")]
    TransferFailure {
        key: String,
        attempts: u32,
        reason: String,
    },

    /// Restored content does not match the sealed artifact
    #[error("Integrity failure restoring artifact {artifact_id}: {reason}")]
    IntegrityFailure { artifact_id: String, reason: String },

    /// The primary failed its health probes
    #[error("Health check failed for {resource_id} after {consecutive} probe(s): {reason}")]
    HealthCheckFailure {
        resource_id: ResourceId,
        consecutive: u32,
        reason: String,
    },

    /// Recovery itself failed; the workload needs an operator
    #[error("Workload {workload_id} is unrecoverable: {reason} ({} event(s) in trail)", .trail.len())]
    Unrecoverable {
        workload_id: WorkloadId,
        reason: String,
        trail: Vec<FailoverEvent>,
    },

    /// Lifecycle edge does not exist
    #[error("Invalid transition for {resource_id}: {from} -> {to}")]
    InvalidTransition {
        resource_id: ResourceId,
        from: ResourceState,
        to: ResourceState,
    },

    /// Resource not in the registry
    #[error("Resource {0} not found")]
    ResourceNotFound(ResourceId),

    /// Workload not in the registry
    #[error("Workload {0} not found")]
    WorkloadNotFound(WorkloadId),

    /// Workload has no primary
    #[error("Workload {0} has no primary")]
    NoPrimary(WorkloadId),

    /// Primary pointer moved underneath a swap
    #[error("Primary of {workload_id} is {actual:?}, expected {expected}")]
    StalePrimary {
        workload_id: WorkloadId,
        expected: ResourceId,
        actual: Option<ResourceId>,
    },

    /// A policy is already attached to the workload's primary
    #[error("A failover policy is already attached to {0}")]
    PolicyAlreadyAttached(ResourceId),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Capability adapter error
    #[error(transparent)]
    Capability(#[from] TetherError),

    /// S3 error
    #[error("S3 error: {0}")]
    S3(#[from] aws_sdk_s3::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A workload record could not be written to the state directory
    #[error("Failed to persist workload {workload_id}: {reason}")]
    Persist { workload_id: WorkloadId, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an integrity error
    pub fn integrity(artifact_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IntegrityFailure {
            artifact_id: artifact_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a race exhaustion error
    pub fn no_capacity(failure: RaceFailure) -> Self {
        Self::NoCapacityAvailable(Box::new(failure))
    }

    /// Whether the error ends the workload's automatic recovery for good
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IntegrityFailure { .. } | Self::Unrecoverable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_race_failure_display_names_cause() {
        let failure = RaceFailure {
            race_id: RaceId::new("race-1"),
            batches_attempted: 3,
            cause: ExhaustionCause::AllTimedOut,
            candidates: vec![CandidateFailure {
                resource_id: ResourceId::new("r-1"),
                offer_id: "o-1".to_string(),
                batch_index: 0,
                stage: "exists".to_string(),
                timed_out: true,
                error: "no answer".to_string(),
            }],
        };
        let text = OrchestratorError::no_capacity(failure).to_string();
        assert!(text.contains("race-1"));
        assert!(text.contains("3 batch"));
        assert!(text.contains("too slow"));
        assert!(text.contains("r-1 (o-1) at exists"));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(OrchestratorError::integrity("a-1", "hash mismatch").is_fatal());
        assert!(!OrchestratorError::Cancelled.is_fatal());
    }
}
