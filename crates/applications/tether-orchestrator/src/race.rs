//! Provisioning race coordinator
//!
//! Spot capacity is unreliable: a rented unit may never boot, boot slowly, or die
//! halfway through setup. Instead of waiting on one candidate at a time, the
//! coordinator rents several at once and keeps the first one that is fully usable.
//!
//! ```text
//! t=0            t=T                t=2T
//! batch 0 ──┬──  batch 1 ──┬──      batch 2 ...
//!           │              │
//!           ▼              ▼
//!   exists → reachable → software ready → data restored → Ready
//!                                                          │
//!                                   decision tick ─────────┘
//!                                   (winner Running, everyone else Destroyed)
//! ```
//!
//! - Every candidate runs as its own task with its own cancellation token and
//!   enforces its own per-stage deadlines. A candidate that misses a deadline or
//!   dies destroys itself without waiting for its batch.
//! - Batches are additive. Launching a new batch never cancels older candidates.
//! - Decisions happen on a tick offset by half a poll interval from candidate
//!   polling; candidates that became ready between two ticks are ordered by the
//!   configured [`TieBreak`].
//! - The race returns only once every non-winner is Destroyed.

use crate::assign::{rank_offers, ReadyCandidate, TieBreak};
use crate::config::duration_ms;
use crate::error::{CandidateFailure, ExhaustionCause, OrchestratorError, RaceFailure, Result};
use crate::registry::Registry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    MarketplaceDriver, Offer, RaceId, RemoteState, ResourceHandle, ResourceId, ResourceSpec,
    ResourceState, WorkloadId,
};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Race tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Candidates launched per batch
    pub batch_size: usize,

    /// Batches before giving up
    pub max_batches: usize,

    /// Deadline of each boot stage, and the spacing between batches
    #[serde(with = "duration_ms")]
    pub boot_stage_timeout: Duration,

    /// Deadline of the data-restore stage
    #[serde(with = "duration_ms")]
    pub restore_stage_timeout: Duration,

    /// Candidate polling and decision interval
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    #[serde(with = "duration_ms")]
    pub search_timeout: Duration,

    /// Destroy calls before a resource is left for the retention sweep
    pub destroy_attempts: u32,

    pub tie_break: TieBreak,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_batches: 3,
            boot_stage_timeout: Duration::from_secs(10),
            restore_stage_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            search_timeout: Duration::from_secs(30),
            destroy_attempts: 3,
            tie_break: TieBreak::CheapestFirst,
        }
    }
}

impl RaceConfig {
    /// Set candidates per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set batch limit
    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = max_batches;
        self
    }

    /// Set boot stage deadline
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.boot_stage_timeout = timeout;
        self
    }

    /// Set data-restore stage deadline
    pub fn with_restore_stage_timeout(mut self, timeout: Duration) -> Self {
        self.restore_stage_timeout = timeout;
        self
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set tie-break policy
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }
}

/// Optional last readiness stage, e.g. restoring a snapshot into the candidate
#[async_trait]
pub trait DataStage: Send + Sync {
    async fn prepare(&self, candidate: &ResourceHandle, cancel: &CancellationToken) -> Result<()>;
}

/// What to race for
#[derive(Clone)]
pub struct RaceRequest {
    pub workload_id: WorkloadId,
    pub spec: ResourceSpec,
    /// Offer launched first in batch 0
    pub preferred_offer: Option<Offer>,
    pub data_stage: Option<Arc<dyn DataStage>>,
}

impl RaceRequest {
    pub fn new(workload_id: WorkloadId, spec: ResourceSpec) -> Self {
        Self {
            workload_id,
            spec,
            preferred_offer: None,
            data_stage: None,
        }
    }

    /// Launch `offer` first
    pub fn with_preferred_offer(mut self, offer: Offer) -> Self {
        self.preferred_offer = Some(offer);
        self
    }

    /// Add a data stage to readiness
    pub fn with_data_stage(mut self, stage: Arc<dyn DataStage>) -> Self {
        self.data_stage = Some(stage);
        self
    }
}

/// Candidates launched together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAttempt {
    pub batch_index: usize,
    pub candidates: Vec<ResourceId>,
    pub launched_at: DateTime<Utc>,
    /// Deadline of the first stage of this batch's candidates
    pub stage_deadline: DateTime<Utc>,
}

/// Race status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RaceStatus {
    Running,
    Won,
    Failed { reason: String },
    Cancelled,
}

/// One race, as recorded in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceSession {
    pub id: RaceId,
    pub workload_id: WorkloadId,
    pub spec: ResourceSpec,
    pub batches: Vec<BatchAttempt>,
    pub winner: Option<ResourceId>,
    #[serde(with = "duration_ms")]
    pub stage_timeout: Duration,
    #[serde(flatten)]
    pub status: RaceStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RaceSession {
    fn new(workload_id: WorkloadId, spec: ResourceSpec, stage_timeout: Duration) -> Self {
        Self {
            id: RaceId::random(),
            workload_id,
            spec,
            batches: Vec::new(),
            winner: None,
            stage_timeout,
            status: RaceStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn finish(&mut self, status: RaceStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Every candidate ever launched
    pub fn candidates(&self) -> impl Iterator<Item = &ResourceId> {
        self.batches.iter().flat_map(|b| b.candidates.iter())
    }
}

/// Readiness stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Exists,
    Reachable,
    SoftwareReady,
    DataRestored,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Exists => "exists",
            Stage::Reachable => "reachable",
            Stage::SoftwareReady => "software_ready",
            Stage::DataRestored => "data_restored",
        }
    }
}

#[derive(Debug)]
enum StageError {
    Cancelled,
    TimedOut,
    Failed(String),
}

enum CandidateOutcome {
    Ready(ReadyCandidate),
    Discarded(CandidateFailure),
    Cancelled,
}

/// Race `fut` against the stage deadline and the candidate's token
async fn within<T, F>(cancel: &CancellationToken, deadline: Instant, fut: F) -> std::result::Result<T, StageError>
where
    F: Future<Output = std::result::Result<T, String>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageError::Cancelled),
        res = timeout_at(deadline, fut) => match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(StageError::Failed(e)),
            Err(_) => Err(StageError::TimedOut),
        },
    }
}

/// Destroy a resource remotely (bounded retries) and mark it Destroyed.
///
/// A resource that still cannot be destroyed is marked Destroyed anyway and
/// logged with its remote id for the external retention sweep.
pub async fn release(
    driver: &dyn MarketplaceDriver,
    registry: &Registry,
    resource_id: &ResourceId,
    attempts: u32,
    backoff: Duration,
) -> Result<()> {
    let handle = registry.get(resource_id)?;
    if handle.state.is_terminal() {
        return Ok(());
    }

    if let Some(remote_id) = handle.remote() {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match driver.destroy(remote_id).await {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    warn!(resource_id = %resource_id, remote_id, attempt, error = %e, "Destroy failed, retrying");
                    sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        resource_id = %resource_id,
                        remote_id,
                        error = %e,
                        "Giving up destroying resource; left for retention sweep"
                    );
                }
            }
        }
    }

    if registry.mark_destroyed(resource_id)? {
        debug!(resource_id = %resource_id, "Resource destroyed");
    }
    Ok(())
}

/// One candidate's task
struct Candidate {
    driver: Arc<dyn MarketplaceDriver>,
    registry: Arc<Registry>,
    config: RaceConfig,
    spec: ResourceSpec,
    data_stage: Option<Arc<dyn DataStage>>,
    handle: ResourceHandle,
    batch_index: usize,
    sequence: usize,
    cancel: CancellationToken,
}

impl Candidate {
    async fn run(self) -> CandidateOutcome {
        let resource_id = self.handle.id.clone();

        match self.drive().await {
            Ok(ready) => CandidateOutcome::Ready(ready),
            Err((_, StageError::Cancelled)) => {
                debug!(resource_id = %resource_id, "Candidate cancelled");
                self.discard().await;
                CandidateOutcome::Cancelled
            }
            Err((stage, err)) => {
                let (timed_out, error) = match err {
                    StageError::TimedOut => (
                        true,
                        OrchestratorError::ProvisioningTimeout {
                            resource_id: resource_id.clone(),
                            stage: stage.as_str().to_string(),
                            timeout: self.stage_timeout(stage),
                        }
                        .to_string(),
                    ),
                    StageError::Failed(e) => (false, e),
                    StageError::Cancelled => (false, "cancelled".to_string()),
                };

                warn!(
                    resource_id = %resource_id,
                    offer_id = %self.handle.offer.id,
                    stage = stage.as_str(),
                    timed_out,
                    error = %error,
                    "Discarding candidate"
                );

                let last_error = error.clone();
                if let Ok(handle) = self.registry.annotate(&resource_id, |h| h.last_error = Some(last_error)) {
                    if handle.state.can_transition_to(ResourceState::Failed) {
                        if let Err(e) = self.registry.transition(&resource_id, ResourceState::Failed) {
                            warn!(resource_id = %resource_id, error = %e, "Failed to mark candidate Failed");
                        }
                    }
                }
                self.discard().await;

                CandidateOutcome::Discarded(CandidateFailure {
                    resource_id,
                    offer_id: self.handle.offer.id.clone(),
                    batch_index: self.batch_index,
                    stage: stage.as_str().to_string(),
                    timed_out,
                    error,
                })
            }
        }
    }

    fn stage_timeout(&self, stage: Stage) -> Duration {
        match stage {
            Stage::DataRestored => self.config.restore_stage_timeout,
            _ => self.config.boot_stage_timeout,
        }
    }

    fn deadline(&self, stage: Stage) -> Instant {
        Instant::now() + self.stage_timeout(stage)
    }

    async fn discard(&self) {
        if let Err(e) = release(
            self.driver.as_ref(),
            &self.registry,
            &self.handle.id,
            self.config.destroy_attempts,
            self.config.poll_interval,
        )
        .await
        {
            error!(resource_id = %self.handle.id, error = %e, "Failed to release candidate");
        }
    }

    fn advance(&self, to: ResourceState) -> std::result::Result<ResourceHandle, StageError> {
        self.registry
            .transition(&self.handle.id, to)
            .map_err(|e| StageError::Failed(e.to_string()))
    }

    async fn drive(&self) -> std::result::Result<ReadyCandidate, (Stage, StageError)> {
        let id = &self.handle.id;

        // Exists: create, then wait until the marketplace reports it running
        let stage = Stage::Exists;
        self.advance(ResourceState::Provisioning).map_err(|e| (stage, e))?;
        let deadline = self.deadline(stage);

        // The create is never dropped mid-flight. A reply that lands after the
        // deadline still records its remote id so discard() destroys it.
        let mut create = tokio::spawn({
            let driver = self.driver.clone();
            let offer = self.handle.offer.clone();
            let label = format!("tether-{}-{}", self.handle.workload_id, id);
            async move { driver.create(&offer, &label).await }
        });
        let (created, late) = match timeout_at(deadline, &mut create).await {
            Ok(joined) => (joined, false),
            Err(_) => {
                warn!(resource_id = %id, "Create still in flight at the stage deadline, waiting to release it");
                (create.await, true)
            }
        };
        let provisioned = match created {
            Ok(Ok(p)) => p,
            Ok(Err(_)) if late => return Err((stage, StageError::TimedOut)),
            Ok(Err(e)) => return Err((stage, StageError::Failed(e.to_string()))),
            Err(e) => return Err((stage, StageError::Failed(format!("create task failed: {}", e)))),
        };

        let handle = self
            .registry
            .annotate(id, |h| {
                h.remote_id = Some(provisioned.remote_id.clone());
                h.endpoint = provisioned.endpoint.clone();
            })
            .map_err(|e| {
                error!(resource_id = %id, remote_id = %provisioned.remote_id, error = %e, "Failed to record created remote");
                (stage, StageError::Failed(e.to_string()))
            })?;
        debug!(resource_id = %id, remote_id = %provisioned.remote_id, late, "Candidate created");

        if late {
            return Err((stage, StageError::TimedOut));
        }

        if self.cancel.is_cancelled() {
            return Err((stage, StageError::Cancelled));
        }

        let remote_id = provisioned.remote_id.as_str();
        within(&self.cancel, deadline, self.wait_running(remote_id))
            .await
            .map_err(|e| (stage, e))?;
        self.advance(ResourceState::Booting).map_err(|e| (stage, e))?;

        // Reachable: exec channel answers
        let stage = Stage::Reachable;
        within(&self.cancel, self.deadline(stage), self.wait_exec(remote_id, "true"))
            .await
            .map_err(|e| (stage, e))?;

        // Software ready: every check exits 0
        let stage = Stage::SoftwareReady;
        let deadline = self.deadline(stage);
        for check in &self.spec.required_software {
            within(&self.cancel, deadline, self.wait_exec(remote_id, check))
                .await
                .map_err(|e| (stage, e))?;
        }

        // Data restored
        if let Some(data_stage) = &self.data_stage {
            let stage = Stage::DataRestored;
            let current = self.registry.get(id).unwrap_or(handle);
            within(&self.cancel, self.deadline(stage), async {
                data_stage
                    .prepare(&current, &self.cancel)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| (stage, e))?;
        }

        let ready = self.advance(ResourceState::Ready).map_err(|e| (Stage::DataRestored, e))?;
        info!(
            resource_id = %id,
            offer_id = %ready.offer.id,
            price_per_hour = ready.offer.price_per_hour,
            "Candidate ready"
        );

        Ok(ReadyCandidate {
            resource_id: id.clone(),
            price_per_hour: ready.offer.price_per_hour,
            created_at: ready.created_at,
            sequence: self.sequence,
        })
    }

    async fn wait_running(&self, remote_id: &str) -> std::result::Result<(), String> {
        loop {
            match self.driver.poll(remote_id).await {
                Ok(status) => match status.state {
                    RemoteState::Running => {
                        if status.endpoint.is_some() {
                            let endpoint = status.endpoint.clone();
                            if let Err(e) = self.registry.annotate(&self.handle.id, |h| h.endpoint = endpoint) {
                                warn!(resource_id = %self.handle.id, error = %e, "Failed to record endpoint");
                            }
                        }
                        return Ok(());
                    }
                    RemoteState::Failed | RemoteState::Gone => {
                        return Err(format!(
                            "remote reported {:?}: {}",
                            status.state,
                            status.message.unwrap_or_default()
                        ));
                    }
                    RemoteState::Pending | RemoteState::Paused => {}
                },
                Err(e) if e.is_transient() => debug!(remote_id, error = %e, "Poll failed, retrying"),
                Err(e) => return Err(e.to_string()),
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Retry `command` until it exits 0; a dead remote fails the stage
    async fn wait_exec(&self, remote_id: &str, command: &str) -> std::result::Result<(), String> {
        loop {
            match self.driver.exec(remote_id, command).await {
                Ok(out) if out.is_success() => return Ok(()),
                Ok(out) => debug!(remote_id, command, exit_code = out.exit_code, "Check not passing yet"),
                Err(e) => {
                    debug!(remote_id, command, error = %e, "Exec failed");
                    if let Ok(status) = self.driver.poll(remote_id).await {
                        if matches!(status.state, RemoteState::Failed | RemoteState::Gone) {
                            return Err(format!("remote died: {}", e));
                        }
                    }
                }
            }
            sleep(self.config.poll_interval).await;
        }
    }
}

/// Races batches of candidates for one workload
pub struct RaceCoordinator {
    driver: Arc<dyn MarketplaceDriver>,
    registry: Arc<Registry>,
    config: RaceConfig,
}

/// Mutable bookkeeping of one running race
struct RaceState {
    session: RaceSession,
    tasks: JoinSet<CandidateOutcome>,
    token: CancellationToken,
    used_offers: HashSet<String>,
    ready: Vec<ReadyCandidate>,
    failures: Vec<CandidateFailure>,
    sequence: usize,
}

impl RaceCoordinator {
    pub fn new(driver: Arc<dyn MarketplaceDriver>, registry: Arc<Registry>) -> Self {
        Self::with_config(driver, registry, RaceConfig::default())
    }

    pub fn with_config(driver: Arc<dyn MarketplaceDriver>, registry: Arc<Registry>, config: RaceConfig) -> Self {
        Self {
            driver,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &RaceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run a race to completion.
    ///
    /// Returns the winner in `Running` state. Cancelling `cancel` destroys every
    /// candidate and returns [`OrchestratorError::Cancelled`].
    pub async fn race(&self, request: RaceRequest, cancel: &CancellationToken) -> Result<ResourceHandle> {
        let start = Instant::now();
        self.registry.ensure_workload(&request.workload_id)?;

        let mut state = RaceState {
            session: RaceSession::new(
                request.workload_id.clone(),
                request.spec.clone(),
                self.config.boot_stage_timeout,
            ),
            tasks: JoinSet::new(),
            token: cancel.child_token(),
            used_offers: HashSet::new(),
            ready: Vec::new(),
            failures: Vec::new(),
            sequence: 0,
        };
        self.registry.record_race(&request.workload_id, &state.session)?;

        info!(
            race_id = %state.session.id,
            workload_id = %request.workload_id,
            gpu_class = %request.spec.gpu_class,
            batch_size = self.config.batch_size,
            max_batches = self.config.max_batches,
            "Starting provisioning race"
        );

        // Batch 0: an empty market is surfaced, not retried.
        match self.launch_batch(&request, &mut state).await {
            Ok(0) => {
                let reason = format!("{:?}", request.spec);
                return self.fail(&mut state, OrchestratorError::OfferUnavailable(reason)).await;
            }
            Ok(_) => {}
            Err(e) => return self.fail(&mut state, e).await,
        }

        let poll = self.config.poll_interval;
        let mut tick = interval_at(start + poll / 2, poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let winner = loop {
            let batches = state.session.batches.len();
            let more_batches = batches < self.config.max_batches;

            if state.tasks.is_empty() && state.ready.is_empty() {
                if more_batches {
                    if let Err(e) = self.launch_batch(&request, &mut state).await {
                        warn!(race_id = %state.session.id, error = %e, "Batch launch failed");
                    }
                    continue;
                }
                break None;
            }

            let next_batch = start + self.config.boot_stage_timeout * batches as u32;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(race_id = %state.session.id, "Race cancelled");
                    self.wind_down(&mut state, None).await;
                    state.session.finish(RaceStatus::Cancelled);
                    self.registry.record_race(&request.workload_id, &state.session)?;
                    return Err(OrchestratorError::Cancelled);
                }

                Some(joined) = state.tasks.join_next(), if !state.tasks.is_empty() => {
                    Self::absorb(&mut state, joined);
                }

                _ = tick.tick() => {
                    if !state.ready.is_empty() {
                        self.config.tie_break.rank(&mut state.ready);
                        break Some(state.ready.remove(0));
                    }
                }

                _ = sleep_until(next_batch), if more_batches && state.ready.is_empty() => {
                    if let Err(e) = self.launch_batch(&request, &mut state).await {
                        warn!(race_id = %state.session.id, error = %e, "Batch launch failed");
                    }
                }
            }
        };

        let Some(winner) = winner else {
            let failure = RaceFailure {
                race_id: state.session.id.clone(),
                batches_attempted: state.session.batches.len(),
                cause: exhaustion_cause(&state.failures),
                candidates: state.failures.clone(),
            };
            return self.fail(&mut state, OrchestratorError::no_capacity(failure)).await;
        };

        let handle = match self.registry.transition(&winner.resource_id, ResourceState::Running) {
            Ok(handle) => handle,
            Err(e) => return self.fail(&mut state, e).await,
        };
        self.wind_down(&mut state, Some(&winner.resource_id)).await;

        state.session.winner = Some(winner.resource_id.clone());
        state.session.finish(RaceStatus::Won);
        if let Err(e) = self.registry.record_race(&request.workload_id, &state.session) {
            error!(race_id = %state.session.id, error = %e, "Failed to record race outcome");
        }

        info!(
            race_id = %state.session.id,
            resource_id = %handle.id,
            offer_id = %handle.offer.id,
            price_per_hour = handle.offer.price_per_hour,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Race won"
        );
        Ok(handle)
    }

    /// Wind down every candidate and record the race as failed with `err`
    async fn fail<T>(&self, state: &mut RaceState, err: OrchestratorError) -> Result<T> {
        warn!(race_id = %state.session.id, error = %err, "Race failed");
        self.wind_down(state, None).await;
        state.session.finish(RaceStatus::Failed {
            reason: err.to_string(),
        });
        if let Err(e) = self.registry.record_race(&state.session.workload_id, &state.session) {
            error!(race_id = %state.session.id, error = %e, "Failed to record race outcome");
        }
        Err(err)
    }

    fn absorb(state: &mut RaceState, joined: std::result::Result<CandidateOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(CandidateOutcome::Ready(candidate)) => state.ready.push(candidate),
            Ok(CandidateOutcome::Discarded(failure)) => state.failures.push(failure),
            Ok(CandidateOutcome::Cancelled) => {}
            Err(e) => error!(race_id = %state.session.id, error = %e, "Candidate task failed"),
        }
    }

    /// Search, rank and launch one batch. Returns the number of candidates launched.
    async fn launch_batch(&self, request: &RaceRequest, state: &mut RaceState) -> Result<usize> {
        let batch_index = state.session.batches.len();
        let launched_at = Utc::now();
        let stage_deadline = launched_at
            + chrono::Duration::from_std(self.config.boot_stage_timeout).unwrap_or(chrono::Duration::zero());

        // The batch counts as attempted even if the market turns out empty.
        state.session.batches.push(BatchAttempt {
            batch_index,
            candidates: Vec::new(),
            launched_at,
            stage_deadline,
        });

        let search = tokio::time::timeout(self.config.search_timeout, self.driver.search(&request.spec)).await;
        let offers = match search {
            Ok(Ok(offers)) => offers,
            Ok(Err(e)) => {
                self.registry.record_race(&request.workload_id, &state.session)?;
                return Err(e.into());
            }
            Err(_) => {
                self.registry.record_race(&request.workload_id, &state.session)?;
                return Err(OrchestratorError::Timeout(self.config.search_timeout));
            }
        };

        let matching: Vec<Offer> = offers.into_iter().filter(|o| request.spec.matches(o)).collect();
        let preferred = if batch_index == 0 {
            request.preferred_offer.as_ref()
        } else {
            None
        };
        let picked: Vec<Offer> = rank_offers(matching, &state.used_offers, preferred)
            .into_iter()
            .take(self.config.batch_size)
            .collect();

        let mut count = 0;
        for offer in picked {
            state.used_offers.insert(offer.id.clone());
            let handle = ResourceHandle::requested(
                request.workload_id.clone(),
                offer,
                Some(state.session.id.clone()),
            );
            // Listed before the insert is checked so wind_down sees it either way.
            let inserted = self.registry.insert(handle.clone());
            if let Some(batch) = state.session.batches.last_mut() {
                batch.candidates.push(handle.id.clone());
            }
            inserted?;
            count += 1;

            let candidate = Candidate {
                driver: self.driver.clone(),
                registry: self.registry.clone(),
                config: self.config.clone(),
                spec: request.spec.clone(),
                data_stage: request.data_stage.clone(),
                handle,
                batch_index,
                sequence: state.sequence,
                cancel: state.token.child_token(),
            };
            state.sequence += 1;
            state.tasks.spawn(candidate.run());
        }

        info!(
            race_id = %state.session.id,
            batch_index,
            candidates = count,
            "Launched batch"
        );

        self.registry.record_race(&request.workload_id, &state.session)?;
        Ok(count)
    }

    /// Cancel and join every outstanding candidate, then destroy every
    /// non-winner that is still alive.
    async fn wind_down(&self, state: &mut RaceState, winner: Option<&ResourceId>) {
        state.token.cancel();
        while let Some(joined) = state.tasks.join_next().await {
            Self::absorb(state, joined);
        }

        let mut to_release: HashSet<ResourceId> = state.ready.drain(..).map(|c| c.resource_id).collect();

        // Candidates whose task died without cleaning up
        for id in state.session.candidates() {
            if Some(id) != winner {
                if let Ok(handle) = self.registry.get(id) {
                    if !handle.state.is_terminal() {
                        to_release.insert(id.clone());
                    }
                }
            }
        }

        for id in to_release {
            debug!(race_id = %state.session.id, resource_id = %id, "Destroying losing candidate");
            if let Err(e) = release(
                self.driver.as_ref(),
                &self.registry,
                &id,
                self.config.destroy_attempts,
                self.config.poll_interval,
            )
            .await
            {
                error!(resource_id = %id, error = %e, "Failed to release losing candidate");
            }
        }
    }
}

fn exhaustion_cause(failures: &[CandidateFailure]) -> ExhaustionCause {
    if failures.is_empty() {
        return ExhaustionCause::NoOffers;
    }
    let timed_out = failures.iter().filter(|f| f.timed_out).count();
    match timed_out {
        0 => ExhaustionCause::AllFailed,
        n if n == failures.len() => ExhaustionCause::AllTimedOut,
        _ => ExhaustionCause::Mixed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{chunk_key, MemoryChunkStore, RestoreStage, SnapshotArtifact, SnapshotConfig, SnapshotEngine, ZstdCodec};
    use crate::testing::{offer, Boot, FakeMarketplace, MemoryArchiver, Op};
    use tether_core::ChunkStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_err;

    fn coordinator(market: &Arc<FakeMarketplace>, config: RaceConfig) -> (RaceCoordinator, Arc<Registry>) {
        let registry = Arc::new(Registry::in_memory());
        let coordinator = RaceCoordinator::with_config(market.clone(), registry.clone(), config);
        (coordinator, registry)
    }

    fn request() -> RaceRequest {
        RaceRequest::new(WorkloadId::new("w-1"), ResourceSpec::new("RTX_4090"))
    }

    fn state_of(registry: &Registry, offer_id: &str) -> ResourceState {
        registry
            .workload(&WorkloadId::new("w-1"))
            .unwrap()
            .resources
            .values()
            .find(|h| h.offer.id == offer_id)
            .map(|h| h.state)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_ready_candidate_wins_and_losers_are_destroyed() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("x", 0.5, 0.99),
            offer("y", 0.4, 0.98),
            offer("z", 0.3, 0.97),
        ]));
        market.set_boot("x", Boot::After(Duration::from_secs(5)));
        market.set_boot("y", Boot::After(Duration::from_secs(8)));
        market.set_boot("z", Boot::Never);
        let (coordinator, registry) = coordinator(&market, RaceConfig::default());

        let start = Instant::now();
        let winner = coordinator.race(request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(winner.offer.id, "x");
        assert_eq!(winner.state, ResourceState::Running);
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(state_of(&registry, "y"), ResourceState::Destroyed);
        assert_eq!(state_of(&registry, "z"), ResourceState::Destroyed);
        assert_eq!(market.live(), vec![winner.remote_id.clone().unwrap()]);

        let record = registry.workload(&WorkloadId::new("w-1")).unwrap();
        assert_eq!(record.races.len(), 1);
        assert_eq!(record.races[0].status, RaceStatus::Won);
        assert_eq!(record.races[0].winner.as_ref(), Some(&winner.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneously_ready_cheapest_wins() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("pricey", 0.9, 0.99),
            offer("cheap", 0.3, 0.95),
        ]));
        market.set_boot("pricey", Boot::After(Duration::from_secs(2)));
        market.set_boot("cheap", Boot::After(Duration::from_secs(2)));
        let (coordinator, registry) = coordinator(&market, RaceConfig::default());

        let winner = coordinator.race(request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(winner.offer.id, "cheap");
        assert_eq!(state_of(&registry, "pricey"), ResourceState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_first_tie_break() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("first", 0.9, 0.99),
            offer("second", 0.3, 0.95),
        ]));
        market.set_boot("first", Boot::After(Duration::from_secs(2)));
        market.set_boot("second", Boot::After(Duration::from_secs(2)));
        let config = RaceConfig::default().with_tie_break(TieBreak::EarliestFirst);
        let (coordinator, _) = coordinator(&market, config);

        let winner = coordinator.race(request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(winner.offer.id, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_candidate_destroyed_within_poll_interval() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("stuck", 0.2, 0.99),
            offer("late", 0.5, 0.90),
        ]));
        market.set_boot("stuck", Boot::Never);
        market.set_boot("late", Boot::After(Duration::from_secs(1)));
        let config = RaceConfig::default()
            .with_batch_size(1)
            .with_stage_timeout(Duration::from_secs(3));
        let (coordinator, registry) = coordinator(&market, config);

        let start = Instant::now();
        let winner = coordinator.race(request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(winner.offer.id, "late");

        let stuck_remote = market.remote_of("stuck").unwrap();
        let destroyed_at = market
            .log()
            .into_iter()
            .find(|r| r.op == Op::Destroy(stuck_remote.clone()))
            .map(|r| r.at)
            .unwrap();
        assert!(destroyed_at - start <= Duration::from_secs(4));
        assert_eq!(state_of(&registry, "stuck"), ResourceState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_replying_after_deadline_is_still_destroyed() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("slow-create", 0.2, 0.99),
            offer("ok", 0.5, 0.90),
        ]));
        market.set_create_delay("slow-create", Duration::from_secs(30));
        market.set_boot("ok", Boot::After(Duration::from_secs(5)));
        let config = RaceConfig::default().with_stage_timeout(Duration::from_secs(10));
        let (coordinator, registry) = coordinator(&market, config);

        let winner = coordinator.race(request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(winner.offer.id, "ok");

        let slow_remote = market.remote_of("slow-create").unwrap();
        assert!(market.is_destroyed(&slow_remote));
        assert_eq!(market.live(), vec![winner.remote_id.clone().unwrap()]);

        let record = registry.workload(&WorkloadId::new("w-1")).unwrap();
        let slow = record
            .resources
            .values()
            .find(|h| h.offer.id == "slow-create")
            .unwrap();
        assert_eq!(slow.state, ResourceState::Destroyed);
        assert_eq!(slow.remote_id.as_deref(), Some(slow_remote.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_create_counts_as_timed_out() {
        let market = Arc::new(FakeMarketplace::new(vec![offer("slow-create", 0.2, 0.99)]));
        market.set_create_delay("slow-create", Duration::from_secs(30));
        let config = RaceConfig::default()
            .with_stage_timeout(Duration::from_secs(10))
            .with_max_batches(1);
        let (coordinator, registry) = coordinator(&market, config);

        let err = coordinator.race(request(), &CancellationToken::new()).await.unwrap_err();
        let OrchestratorError::NoCapacityAvailable(failure) = err else {
            panic!("expected NoCapacityAvailable");
        };
        assert_eq!(failure.cause, ExhaustionCause::AllTimedOut);
        assert_eq!(failure.candidates[0].stage, "exists");
        assert!(market.live().is_empty());
        assert_eq!(state_of(&registry, "slow-create"), ResourceState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_additive() {
        // Each stage has its own deadline, so "slow" is still alive when batch 1
        // launches at 5s, and it must still be allowed to win at 8s.
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("slow", 0.2, 0.99),
            offer("dead", 0.5, 0.90),
        ]));
        market.set_boot("slow", Boot::After(Duration::from_secs(4)));
        market.set_setup_delay("slow", Duration::from_secs(4));
        market.set_boot("dead", Boot::Never);
        let config = RaceConfig::default()
            .with_batch_size(1)
            .with_stage_timeout(Duration::from_secs(5));
        let (coordinator, registry) = coordinator(&market, config);

        let mut request = request();
        request.spec = request.spec.clone().with_required_software("nvidia-smi");
        let winner = coordinator.race(request, &CancellationToken::new()).await.unwrap();

        assert_eq!(winner.offer.id, "slow");
        assert_eq!(market.creates(), 2);
        assert_eq!(state_of(&registry, "dead"), ResourceState::Destroyed);
        let record = registry.workload(&WorkloadId::new("w-1")).unwrap();
        assert_eq!(record.races[0].batches.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_candidate_too_slow_is_all_timed_out() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("slow", 0.2, 0.99),
            offer("dead", 0.5, 0.90),
        ]));
        market.set_boot("slow", Boot::After(Duration::from_secs(3)));
        market.set_boot("dead", Boot::Never);
        let config = RaceConfig::default()
            .with_batch_size(1)
            .with_stage_timeout(Duration::from_secs(2))
            .with_max_batches(2);
        let (coordinator, _) = coordinator(&market, config);

        let err = coordinator.race(request(), &CancellationToken::new()).await.unwrap_err();
        let OrchestratorError::NoCapacityAvailable(failure) = err else {
            panic!("expected NoCapacityAvailable");
        };
        assert_eq!(failure.batches_attempted, 2);
        assert_eq!(failure.cause, ExhaustionCause::AllTimedOut);
        assert_eq!(failure.candidates.len(), 2);
        assert!(market.live().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_matching_offer_is_offer_unavailable() {
        let market = Arc::new(FakeMarketplace::new(vec![offer("x", 0.5, 0.99)]));
        let (coordinator, registry) = coordinator(&market, RaceConfig::default());

        let request = RaceRequest::new(WorkloadId::new("w-1"), ResourceSpec::new("A100"));
        let err = coordinator.race(request, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::OfferUnavailable(_)));
        assert_eq!(market.creates(), 0);
        let record = registry.workload(&WorkloadId::new("w-1")).unwrap();
        assert!(matches!(record.races[0].status, RaceStatus::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_candidate_dying_is_all_failed() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("a", 0.2, 0.99),
            offer("b", 0.3, 0.98),
            offer("c", 0.4, 0.97),
        ]));
        market.set_boot("a", Boot::DiesAfter(Duration::from_secs(1)));
        market.set_boot("b", Boot::DiesAfter(Duration::from_secs(2)));
        market.fail_create("c");
        let config = RaceConfig::default().with_max_batches(1);
        let (coordinator, registry) = coordinator(&market, config);

        let err = coordinator.race(request(), &CancellationToken::new()).await.unwrap_err();
        let OrchestratorError::NoCapacityAvailable(failure) = err else {
            panic!("expected NoCapacityAvailable");
        };
        assert_eq!(failure.cause, ExhaustionCause::AllFailed);
        assert_eq!(failure.candidates.len(), 3);
        assert!(failure.to_string().contains("died mid-setup"));

        for id in ["a", "b", "c"] {
            assert_eq!(state_of(&registry, id), ResourceState::Destroyed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_software_checks_gate_readiness() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("fast-boot", 0.2, 0.99),
            offer("ready-first", 0.6, 0.98),
        ]));
        market.set_boot("fast-boot", Boot::After(Duration::from_secs(1)));
        market.set_setup_delay("fast-boot", Duration::from_secs(6));
        market.set_boot("ready-first", Boot::After(Duration::from_secs(3)));
        let (coordinator, _) = coordinator(&market, RaceConfig::default());

        let mut request = request();
        request.spec = request.spec.clone().with_required_software("nvidia-smi");
        let winner = coordinator.race(request, &CancellationToken::new()).await.unwrap();
        assert_eq!(winner.offer.id, "ready-first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_preferred_offer_launches_first() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("reliable", 0.3, 0.99),
            offer("reserved", 0.5, 0.60),
        ]));
        let (coordinator, _) = coordinator(&market, RaceConfig::default().with_batch_size(1));

        let request = request().with_preferred_offer(offer("reserved", 0.5, 0.60));
        let winner = coordinator.race(request, &CancellationToken::new()).await.unwrap();

        assert_eq!(winner.offer.id, "reserved");
        assert_eq!(market.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_destroys_every_candidate() {
        let market = Arc::new(FakeMarketplace::new(vec![
            offer("a", 0.2, 0.99),
            offer("b", 0.3, 0.98),
        ]));
        market.set_boot("a", Boot::Never);
        market.set_boot("b", Boot::Never);
        let (coordinator, registry) = coordinator(&market, RaceConfig::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        assert_err!(coordinator.race(request(), &cancel).await);
        assert!(market.live().is_empty());
        assert_eq!(state_of(&registry, "a"), ResourceState::Destroyed);
        let record = registry.workload(&WorkloadId::new("w-1")).unwrap();
        assert_eq!(record.races[0].status, RaceStatus::Cancelled);
    }

    struct CountingStage {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DataStage for CountingStage {
        async fn prepare(&self, candidate: &ResourceHandle, _cancel: &CancellationToken) -> Result<()> {
            assert!(candidate.remote_id.is_some());
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OrchestratorError::integrity("a-1", "hash mismatch"));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_stage_runs_before_ready() {
        let market = Arc::new(FakeMarketplace::new(vec![offer("x", 0.5, 0.99)]));
        let (coordinator, _) = coordinator(&market, RaceConfig::default());
        let stage = Arc::new(CountingStage {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let winner = coordinator
            .race(request().with_data_stage(stage.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(winner.state, ResourceState::Running);
        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_data_stage_discards_candidate() {
        let market = Arc::new(FakeMarketplace::new(vec![offer("x", 0.5, 0.99)]));
        let (coordinator, _) = coordinator(&market, RaceConfig::default().with_max_batches(1));
        let stage = Arc::new(CountingStage {
            calls: AtomicUsize::new(0),
            fail: true,
        });

        let err = coordinator
            .race(request().with_data_stage(stage), &CancellationToken::new())
            .await
            .unwrap_err();
        let OrchestratorError::NoCapacityAvailable(failure) = err else {
            panic!("expected NoCapacityAvailable");
        };
        assert_eq!(failure.candidates[0].stage, "data_restored");
        assert!(market.live().is_empty());
    }

    /// Chunk store whose reads take `delay`
    struct SlowReads {
        inner: MemoryChunkStore,
        delay: Duration,
    }

    #[async_trait]
    impl ChunkStore for SlowReads {
        async fn put_chunk(&self, key: &str, bytes: Vec<u8>) -> tether_core::traits::Result<()> {
            self.inner.put_chunk(key, bytes).await
        }

        async fn get_chunk(&self, key: &str) -> tether_core::traits::Result<Vec<u8>> {
            sleep(self.delay).await;
            self.inner.get_chunk(key).await
        }

        async fn list_keys(&self, prefix: &str) -> tether_core::traits::Result<Vec<String>> {
            self.inner.list_keys(prefix).await
        }

        async fn delete_keys(&self, prefix: &str) -> tether_core::traits::Result<()> {
            self.inner.delete_keys(prefix).await
        }
    }

    fn workspace() -> Vec<u8> {
        (0..20_000u32).flat_map(|i| (i % 97).to_le_bytes()).collect()
    }

    /// Seal `workspace()` from a resource outside the race
    async fn sealed(store: Arc<dyn ChunkStore>, archiver: Arc<MemoryArchiver>) -> (Arc<SnapshotEngine>, SnapshotArtifact) {
        let engine = Arc::new(SnapshotEngine::new(
            store,
            Arc::new(ZstdCodec::default()),
            archiver.clone(),
            SnapshotConfig::default().with_chunk_count(4),
        ));
        let source = ResourceHandle::requested(WorkloadId::new("w-0"), offer("src", 0.1, 0.9), None);
        archiver.put(&source.id, workspace());
        let artifact = engine.seal(&source, &CancellationToken::new()).await.unwrap();
        (engine, artifact)
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_stage_fills_the_winner() {
        let market = Arc::new(FakeMarketplace::new(vec![offer("x", 0.5, 0.99)]));
        let (coordinator, _) = coordinator(&market, RaceConfig::default());
        let archiver = Arc::new(MemoryArchiver::new());
        let (engine, artifact) = sealed(Arc::new(MemoryChunkStore::new()), archiver.clone()).await;

        let stage = Arc::new(RestoreStage::new(engine, artifact));
        let winner = coordinator
            .race(request().with_data_stage(stage), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(winner.state, ResourceState::Running);
        assert_eq!(archiver.content(&winner.id).unwrap(), workspace());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_chunk_discards_candidate_at_restore() {
        let market = Arc::new(FakeMarketplace::new(vec![offer("x", 0.5, 0.99)]));
        let (coordinator, registry) = coordinator(&market, RaceConfig::default().with_max_batches(1));
        let store = Arc::new(MemoryChunkStore::new());
        let archiver = Arc::new(MemoryArchiver::new());
        let (engine, artifact) = sealed(store.clone(), archiver.clone()).await;
        store
            .put_chunk(&chunk_key(&artifact.id, 1), b"not zstd".to_vec())
            .await
            .unwrap();

        let stage = Arc::new(RestoreStage::new(engine, artifact));
        let err = coordinator
            .race(request().with_data_stage(stage), &CancellationToken::new())
            .await
            .unwrap_err();
        let OrchestratorError::NoCapacityAvailable(failure) = err else {
            panic!("expected NoCapacityAvailable");
        };
        assert_eq!(failure.candidates[0].stage, "data_restored");
        assert!(!failure.candidates[0].timed_out);
        assert!(failure.candidates[0].error.contains("chunk 1"));
        assert_eq!(archiver.extracts(), 0);
        assert!(market.live().is_empty());
        assert_eq!(state_of(&registry, "x"), ResourceState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_stage_uses_its_own_deadline() {
        // Reads take 8s: past the 5s boot stage deadline, inside a 20s restore deadline.
        let store = || -> Arc<dyn ChunkStore> {
            Arc::new(SlowReads {
                inner: MemoryChunkStore::new(),
                delay: Duration::from_secs(8),
            })
        };
        let base = RaceConfig::default()
            .with_stage_timeout(Duration::from_secs(5))
            .with_max_batches(1);

        let market = Arc::new(FakeMarketplace::new(vec![offer("x", 0.5, 0.99)]));
        let (coordinator, _) = coordinator(&market, base.clone().with_restore_stage_timeout(Duration::from_secs(20)));
        let archiver = Arc::new(MemoryArchiver::new());
        let (engine, artifact) = sealed(store(), archiver.clone()).await;
        let winner = coordinator
            .race(request().with_data_stage(Arc::new(RestoreStage::new(engine, artifact))), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(archiver.content(&winner.id).unwrap(), workspace());

        let market = Arc::new(FakeMarketplace::new(vec![offer("x", 0.5, 0.99)]));
        let (coordinator, _) = self::coordinator(&market, base.with_restore_stage_timeout(Duration::from_secs(3)));
        let archiver = Arc::new(MemoryArchiver::new());
        let (engine, artifact) = sealed(store(), archiver.clone()).await;
        let err = coordinator
            .race(request().with_data_stage(Arc::new(RestoreStage::new(engine, artifact))), &CancellationToken::new())
            .await
            .unwrap_err();
        let OrchestratorError::NoCapacityAvailable(failure) = err else {
            panic!("expected NoCapacityAvailable");
        };
        assert_eq!(failure.candidates[0].stage, "data_restored");
        assert!(failure.candidates[0].timed_out);
        assert!(failure.candidates[0].error.contains("3s"));
        assert_eq!(archiver.extracts(), 0);
    }

    #[test]
    fn test_exhaustion_cause() {
        let failure = |timed_out| CandidateFailure {
            resource_id: ResourceId::new("r"),
            offer_id: "o".to_string(),
            batch_index: 0,
            stage: "exists".to_string(),
            timed_out,
            error: String::new(),
        };
        assert_eq!(exhaustion_cause(&[]), ExhaustionCause::NoOffers);
        assert_eq!(exhaustion_cause(&[failure(true)]), ExhaustionCause::AllTimedOut);
        assert_eq!(exhaustion_cause(&[failure(false)]), ExhaustionCause::AllFailed);
        assert_eq!(exhaustion_cause(&[failure(true), failure(false)]), ExhaustionCause::Mixed);
    }
}
