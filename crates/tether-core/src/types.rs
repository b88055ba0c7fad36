//! Core types shared across Tether components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random (v4) identifier
            pub fn random() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Locally assigned identifier of a resource handle
    ResourceId
);
string_id!(
    /// Logical workload served by a primary resource
    WorkloadId
);
string_id!(
    /// Identifier of a provisioning race session
    RaceId
);

/// Immutable snapshot of one marketplace offer at query time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub gpu_class: String,
    pub region: String,
    pub price_per_hour: f64,
    /// 0.0 (flaky host) ..= 1.0 (never seen failing)
    pub reliability_score: f64,
}

/// What a caller asks the marketplace for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// GPU class, e.g. "RTX_4090"
    pub gpu_class: String,

    /// Restrict to one region
    #[serde(default)]
    pub region: Option<String>,

    /// Price ceiling (USD per hour)
    #[serde(default)]
    pub max_price_per_hour: Option<f64>,

    /// Minimum reliability score
    #[serde(default)]
    pub min_reliability: Option<f64>,

    /// Commands that must exit 0 before a candidate counts as having its software installed
    #[serde(default)]
    pub required_software: Vec<String>,
}

impl ResourceSpec {
    /// Create a spec for a GPU class
    pub fn new(gpu_class: impl Into<String>) -> Self {
        Self {
            gpu_class: gpu_class.into(),
            region: None,
            max_price_per_hour: None,
            min_reliability: None,
            required_software: vec![],
        }
    }

    /// Spec describing the same class and region as an existing offer
    pub fn matching(offer: &Offer) -> Self {
        Self::new(offer.gpu_class.clone()).with_region(offer.region.clone())
    }

    /// Set region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set price ceiling
    pub fn with_max_price(mut self, price: f64) -> Self {
        self.max_price_per_hour = Some(price);
        self
    }

    /// Set minimum reliability
    pub fn with_min_reliability(mut self, score: f64) -> Self {
        self.min_reliability = Some(score);
        self
    }

    /// Add a required-software check command
    pub fn with_required_software(mut self, check: impl Into<String>) -> Self {
        self.required_software.push(check.into());
        self
    }

    /// Check whether an offer satisfies this spec
    pub fn matches(&self, offer: &Offer) -> bool {
        offer.gpu_class == self.gpu_class
            && self.region.as_ref().is_none_or(|r| *r == offer.region)
            && self
                .max_price_per_hour
                .is_none_or(|max| offer.price_per_hour <= max)
            && self
                .min_reliability
                .is_none_or(|min| offer.reliability_score >= min)
    }
}

/// Resource lifecycle state
///
/// `Hibernating` and `Restoring` are only entered by the failover orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    Requested,
    Provisioning,
    Booting,
    Ready,
    Running,
    Paused,
    Hibernating,
    Restoring,
    Failed,
    Destroyed,
}

impl ResourceState {
    /// Check whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        match self {
            Requested => matches!(next, Provisioning | Failed | Destroyed),
            Provisioning => matches!(next, Booting | Failed | Destroyed),
            Booting => matches!(next, Ready | Failed | Destroyed),
            Ready => matches!(next, Running | Restoring | Failed | Destroyed),
            Running => matches!(next, Paused | Hibernating | Restoring | Failed | Destroyed),
            Paused => matches!(next, Running | Failed | Destroyed),
            Hibernating | Restoring => matches!(next, Running | Destroyed),
            Failed => matches!(next, Destroyed),
            Destroyed => false,
        }
    }

    /// Destroyed is the only terminal state
    pub fn is_terminal(self) -> bool {
        self == ResourceState::Destroyed
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One provisioned (or provisioning) compute unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub id: ResourceId,
    pub workload_id: WorkloadId,
    pub state: ResourceState,

    /// Offer this resource was created from
    pub offer: Offer,

    /// Marketplace-assigned id, known once `create` returns
    pub remote_id: Option<String>,

    /// Address of the resource (host or host:port), once known
    pub endpoint: Option<String>,

    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,

    /// Race that created this handle
    pub owner_race_id: Option<RaceId>,

    /// Last error seen while driving this resource
    pub last_error: Option<String>,
}

impl ResourceHandle {
    /// New handle in `Requested` state
    pub fn requested(workload_id: WorkloadId, offer: Offer, owner_race_id: Option<RaceId>) -> Self {
        Self {
            id: ResourceId::random(),
            workload_id,
            state: ResourceState::Requested,
            offer,
            remote_id: None,
            endpoint: None,
            created_at: Utc::now(),
            ready_at: None,
            owner_race_id,
            last_error: None,
        }
    }

    /// Marketplace id, if the resource exists remotely
    pub fn remote(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }
}

/// Remote state as reported by the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Pending,
    Running,
    Paused,
    Failed,
    /// The marketplace no longer knows the resource
    Gone,
}

/// Result of polling one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: RemoteState,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusSnapshot {
    pub fn new(state: RemoteState) -> Self {
        Self {
            state,
            endpoint: None,
            message: None,
        }
    }
}

/// Result of `create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provisioned {
    pub remote_id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Output of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecOutput {
    /// Check if the command exited 0
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
