//! Offer ranking and winner selection for provisioning races
//!
//! Two decisions are made here, both pure:
//!
//! - **Which offers to launch next**: offers matching the spec are ordered by
//!   reliability (highest first), then price (lowest first). Offers already
//!   used in the session are skipped. A preferred offer (the warm pool's
//!   reserved offer) jumps the queue.
//! - **Which ready candidate wins**: every candidate that became ready since the
//!   previous coordinator tick counts as simultaneously ready and is ordered by
//!   the [`TieBreak`] policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tether_core::{Offer, ResourceId};

/// Tie-break policy among simultaneously-ready candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TieBreak {
    /// Lowest price per hour, then earliest creation
    #[default]
    CheapestFirst,

    /// Earliest creation, then lowest price
    EarliestFirst,
}

/// A candidate that completed every readiness stage
#[derive(Debug, Clone)]
pub struct ReadyCandidate {
    pub resource_id: ResourceId,
    pub price_per_hour: f64,
    pub created_at: DateTime<Utc>,
    /// Position in the session's creation order
    pub sequence: usize,
}

impl TieBreak {
    fn compare(self, a: &ReadyCandidate, b: &ReadyCandidate) -> Ordering {
        let by_price = a.price_per_hour.total_cmp(&b.price_per_hour);
        let by_time = a.created_at.cmp(&b.created_at);
        let primary = match self {
            TieBreak::CheapestFirst => by_price.then(by_time),
            TieBreak::EarliestFirst => by_time.then(by_price),
        };
        primary.then(a.sequence.cmp(&b.sequence))
    }

    /// Order candidates best first
    pub fn rank(self, candidates: &mut [ReadyCandidate]) {
        candidates.sort_by(|a, b| self.compare(a, b));
    }
}

/// Order offers for launching: preferred first, then reliability desc, price asc.
///
/// Offers whose id is in `used` are dropped; duplicates keep their first occurrence.
pub fn rank_offers(offers: Vec<Offer>, used: &HashSet<String>, preferred: Option<&Offer>) -> Vec<Offer> {
    let mut seen: HashSet<String> = used.clone();
    let mut ranked = Vec::with_capacity(offers.len() + 1);

    if let Some(p) = preferred {
        if seen.insert(p.id.clone()) {
            ranked.push(p.clone());
        }
    }

    let mut rest: Vec<Offer> = offers
        .into_iter()
        .filter(|o| seen.insert(o.id.clone()))
        .collect();
    rest.sort_by(|a, b| {
        b.reliability_score
            .total_cmp(&a.reliability_score)
            .then(a.price_per_hour.total_cmp(&b.price_per_hour))
            .then_with(|| a.id.cmp(&b.id))
    });

    ranked.extend(rest);
    ranked
}
