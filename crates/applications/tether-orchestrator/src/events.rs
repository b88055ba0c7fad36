//! Failover audit log
//!
//! Every supervised workload keeps an append-only list of [`FailoverEvent`]s in
//! the registry. The trail is persisted with the workload and returned in full
//! when a workload becomes unrecoverable.
//!
//! A health-check failover writes two entries: [`FailoverOutcome::Degraded`]
//! when the primary is declared lost, then the final outcome once recovery ends.

use crate::config::duration_ms;
use crate::failover::PolicyKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_core::{ResourceId, WorkloadId};

/// What started a failover action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverTrigger {
    /// Consecutive failed probes of the primary
    HealthCheck,
    ManualHibernation,
    ManualResume,
    ManualTeardown,
}

/// How a failover action ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailoverOutcome {
    /// Primary declared lost; recovery has started
    Degraded { primary: ResourceId, reason: String },
    /// Primary pointer now references `new_primary`
    Recovered { new_primary: ResourceId },
    /// Primary sealed into `artifact_id` and destroyed
    Hibernated { artifact_id: String },
    /// Hibernated workload is running again
    Resumed { new_primary: ResourceId },
    Abandoned,
    Failed { error: String },
}

/// One entry of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub timestamp: DateTime<Utc>,
    pub workload_id: WorkloadId,
    /// Policy in force when the event happened
    pub policy: Option<PolicyKind>,
    pub trigger: FailoverTrigger,
    pub outcome: FailoverOutcome,
    /// Time from the trigger to the outcome
    #[serde(with = "duration_ms")]
    pub recovery_latency: Duration,
}

impl FailoverEvent {
    pub fn new(
        workload_id: WorkloadId,
        policy: Option<PolicyKind>,
        trigger: FailoverTrigger,
        outcome: FailoverOutcome,
        recovery_latency: Duration,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            workload_id,
            policy,
            trigger,
            outcome,
            recovery_latency,
        }
    }

    /// Check if the action succeeded
    pub fn is_success(&self) -> bool {
        !matches!(
            self.outcome,
            FailoverOutcome::Failed { .. } | FailoverOutcome::Degraded { .. }
        )
    }

    /// Recovery was started but this entry does not say how it ended
    pub fn is_in_progress(&self) -> bool {
        matches!(self.outcome, FailoverOutcome::Degraded { .. })
    }
}
