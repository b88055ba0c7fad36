//! Failover orchestration
//!
//! Supervises the primary of each workload and recovers it per the attached
//! [`FailoverPolicy`]:
//!
//! ```text
//! Monitoring ──(threshold failed probes)──► Degraded ──► Recovering
//!     ▲                                     (routing off)     │
//!     │                                                       │
//!     └──────────── swap primary, destroy old ◄───────────────┤
//!                                                             │
//!                                  recovery failed ──► Unrecoverable
//! ```
//!
//! While Monitoring, a policy-specific background task runs next to the probes:
//!
//! - **SnapshotOnly**: seals the primary every `interval`. Recovery races a
//!   replacement and restores the latest artifact into it.
//! - **HotStandby**: keeps a cheaper standby alive and rsyncs the primary's
//!   working directory onto it every `sync_interval`. Recovery swaps to the
//!   standby.
//! - **WarmPool**: keeps an idle unit of the primary's class alive. Recovery swaps
//!   to it without provisioning anything.
//!
//! The background task is stopped before recovery starts and restarted against
//! the new primary afterwards, so a replacement standby or warm unit is only
//! raced once the swap is done.

use crate::config::duration_ms;
use crate::error::{OrchestratorError, Result};
use crate::events::{FailoverEvent, FailoverOutcome, FailoverTrigger};
use crate::monitor::{FailureCounter, HealthProber};
use crate::race::{self, RaceCoordinator, RaceRequest};
use crate::registry::{Registry, WorkloadPhase, WorkloadRecord};
use crate::snapshot::{SnapshotArtifact, SnapshotEngine};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{
    MarketplaceDriver, Offer, ResourceHandle, ResourceId, ResourceSpec, ResourceState, TetherError,
    WorkloadId,
};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Recovery strategy attached to a primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailoverPolicy {
    SnapshotOnly {
        #[serde(with = "duration_ms")]
        interval: Duration,
    },
    HotStandby {
        #[serde(with = "duration_ms")]
        sync_interval: Duration,
        /// Usually a cheaper class than the primary
        standby_spec: ResourceSpec,
    },
    WarmPool {
        reserved_offer: Offer,
    },
}

impl FailoverPolicy {
    pub fn snapshot_only(interval: Duration) -> Self {
        Self::SnapshotOnly { interval }
    }

    pub fn hot_standby(sync_interval: Duration, standby_spec: ResourceSpec) -> Self {
        Self::HotStandby {
            sync_interval,
            standby_spec,
        }
    }

    pub fn warm_pool(reserved_offer: Offer) -> Self {
        Self::WarmPool { reserved_offer }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::SnapshotOnly { .. } => PolicyKind::SnapshotOnly,
            Self::HotStandby { .. } => PolicyKind::HotStandby,
            Self::WarmPool { .. } => PolicyKind::WarmPool,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    SnapshotOnly,
    HotStandby,
    WarmPool,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Configuration for supervision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,

    /// Consecutive failed probes before the primary counts as lost
    pub failure_threshold: u32,

    /// Bound on one probe (poll + liveness command)
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,

    /// Must exit 0 on a healthy primary
    pub liveness_command: String,

    /// Working directory synced to a hot standby
    pub workdir: String,

    /// Sync command run on the primary; `{workdir}` and `{target}` are substituted
    pub sync_command: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            failure_threshold: 2,
            probe_timeout: Duration::from_secs(5),
            liveness_command: "true".to_string(),
            workdir: "/workspace".to_string(),
            sync_command: "rsync -az --delete {workdir}/ {target}:{workdir}/".to_string(),
        }
    }
}

impl FailoverConfig {
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_liveness_command(mut self, command: impl Into<String>) -> Self {
        self.liveness_command = command.into();
        self
    }

    pub fn with_sync_command(mut self, command: impl Into<String>) -> Self {
        self.sync_command = command.into();
        self
    }

    /// Sync command targeting `endpoint` (host or host:port)
    pub fn render_sync_command(&self, endpoint: &str) -> String {
        let host = endpoint.rsplit_once(':').map_or(endpoint, |(host, _)| host);
        self.sync_command
            .replace("{workdir}", &self.workdir)
            .replace("{target}", host)
    }
}

/// Summary of a workload for callers
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadStatus {
    pub workload_id: WorkloadId,
    pub phase: WorkloadPhase,
    pub routable: bool,
    pub primary: Option<ResourceHandle>,
    pub standby: Option<ResourceHandle>,
    pub policy: Option<FailoverPolicy>,
    pub latest_artifact: Option<SnapshotArtifact>,
    /// A supervisor task is attached in this process
    pub supervised: bool,
    pub events: usize,
}

struct Supervisor {
    cancel: CancellationToken,
    /// Cancelled once the task has returned
    done: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// Supervises primaries and drives recovery
#[derive(Clone)]
pub struct FailoverOrchestrator {
    driver: Arc<dyn MarketplaceDriver>,
    registry: Arc<Registry>,
    race: Arc<RaceCoordinator>,
    snapshots: Arc<SnapshotEngine>,
    prober: HealthProber,
    config: FailoverConfig,
    supervisors: Arc<Mutex<HashMap<WorkloadId, Supervisor>>>,
}

impl FailoverOrchestrator {
    pub fn new(
        driver: Arc<dyn MarketplaceDriver>,
        registry: Arc<Registry>,
        race: RaceCoordinator,
        snapshots: Arc<SnapshotEngine>,
        config: FailoverConfig,
    ) -> Self {
        let prober = HealthProber::new(driver.clone(), config.liveness_command.clone(), config.probe_timeout);
        Self {
            driver,
            registry,
            race: Arc::new(race),
            snapshots,
            prober,
            config,
            supervisors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Primary lifecycle
    // ------------------------------------------------------------------

    /// Race for `spec` and install the winner as the workload's primary
    pub async fn provision(
        &self,
        workload_id: &WorkloadId,
        spec: ResourceSpec,
        cancel: &CancellationToken,
    ) -> Result<ResourceHandle> {
        self.registry.ensure_workload(workload_id)?;
        if let Some(current) = self.registry.primary(workload_id)? {
            return Err(OrchestratorError::StalePrimary {
                workload_id: workload_id.clone(),
                expected: current.id.clone(),
                actual: Some(current.id),
            });
        }
        self.registry.set_spec(workload_id, spec.clone())?;

        let handle = self
            .race
            .race(RaceRequest::new(workload_id.clone(), spec), cancel)
            .await?;
        if let Err(e) = self.registry.set_primary(workload_id, &handle.id) {
            self.destroy(&handle.id).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Attach `policy` to the current primary and start supervising it
    pub fn attach_policy(&self, workload_id: &WorkloadId, policy: FailoverPolicy) -> Result<()> {
        let kind = policy.kind();
        let primary = self.registry.attach_policy(workload_id, policy)?;
        info!(workload_id = %workload_id, primary = %primary, policy = %kind, "Failover policy attached");
        self.spawn_supervisor(workload_id);
        Ok(())
    }

    /// Stop supervising and release the standby, if any
    pub async fn detach_policy(&self, workload_id: &WorkloadId) -> Result<Option<FailoverPolicy>> {
        self.stop_supervisor(workload_id).await;
        let policy = self.registry.detach_policy(workload_id)?;
        if let Some(standby) = self.registry.standby(workload_id)? {
            self.destroy(&standby.id).await;
        }
        self.registry.set_phase(workload_id, WorkloadPhase::Unsupervised)?;
        Ok(policy)
    }

    /// Seal the primary now
    pub async fn seal_now(&self, workload_id: &WorkloadId, cancel: &CancellationToken) -> Result<SnapshotArtifact> {
        let primary = self.require_primary(workload_id)?;
        let artifact = self.snapshots.seal(&primary, cancel).await?;
        self.registry.record_artifact(workload_id, artifact.clone())?;
        Ok(artifact)
    }

    /// Restore a sealed artifact into a running resource of the workload
    pub async fn restore_into(
        &self,
        workload_id: &WorkloadId,
        artifact_id: &str,
        resource_id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<ResourceHandle> {
        let artifact = match self.registry.artifact(workload_id, artifact_id)? {
            Some(artifact) => artifact,
            None => self.snapshots.load_artifact(artifact_id).await?,
        };
        let target = self.registry.get(resource_id)?;
        self.restore_onto(&artifact, &target, cancel).await
    }

    /// Seal the primary and destroy it without replacement
    pub async fn hibernate(&self, workload_id: &WorkloadId, cancel: &CancellationToken) -> Result<SnapshotArtifact> {
        let started = Instant::now();
        let was_supervised = self.stop_supervisor(workload_id).await;
        let primary = self.require_primary(workload_id)?;

        self.registry.set_routable(workload_id, false)?;
        let hibernating = self.registry.transition(&primary.id, ResourceState::Hibernating)?;

        let artifact = match self.snapshots.seal(&hibernating, cancel).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(workload_id = %workload_id, error = %e, "Seal failed, hibernation aborted");
                self.registry.transition(&primary.id, ResourceState::Running)?;
                self.registry.set_routable(workload_id, true)?;
                if was_supervised {
                    self.spawn_supervisor(workload_id);
                }
                return Err(e);
            }
        };
        self.registry.record_artifact(workload_id, artifact.clone())?;

        let policy = self.registry.park_policy(workload_id)?;
        if let Some(standby) = self.registry.standby(workload_id)? {
            self.destroy(&standby.id).await;
        }
        self.destroy(&primary.id).await;
        self.registry.set_phase(workload_id, WorkloadPhase::Hibernated)?;

        self.registry.append_event(FailoverEvent::new(
            workload_id.clone(),
            policy,
            FailoverTrigger::ManualHibernation,
            FailoverOutcome::Hibernated {
                artifact_id: artifact.id.clone(),
            },
            started.elapsed(),
        ))?;
        info!(workload_id = %workload_id, artifact_id = %artifact.id, "Workload hibernated");
        Ok(artifact)
    }

    /// Race a fresh primary, restore the latest artifact into it and resume
    /// supervision if a policy was parked at hibernation
    pub async fn resume(&self, workload_id: &WorkloadId, cancel: &CancellationToken) -> Result<ResourceHandle> {
        let started = Instant::now();
        let record = self.registry.workload(workload_id)?;
        if let Some(current) = record.primary_handle() {
            return Err(OrchestratorError::StalePrimary {
                workload_id: workload_id.clone(),
                expected: current.id.clone(),
                actual: Some(current.id.clone()),
            });
        }

        let handle = self.replace_from_snapshot(workload_id, None, cancel).await?;
        if let Err(e) = self.registry.set_primary(workload_id, &handle.id) {
            self.destroy(&handle.id).await;
            return Err(e);
        }

        let policy = self.registry.take_parked_policy(workload_id)?;
        self.registry.append_event(FailoverEvent::new(
            workload_id.clone(),
            policy.as_ref().map(FailoverPolicy::kind),
            FailoverTrigger::ManualResume,
            FailoverOutcome::Resumed {
                new_primary: handle.id.clone(),
            },
            started.elapsed(),
        ))?;
        info!(workload_id = %workload_id, primary = %handle.id, "Workload resumed");

        match policy {
            Some(policy) => self.attach_policy(workload_id, policy)?,
            None => self.registry.set_phase(workload_id, WorkloadPhase::Unsupervised)?,
        }
        Ok(handle)
    }

    /// Pause the primary. Supervision stops until [`Self::unpause`].
    pub async fn pause(&self, workload_id: &WorkloadId) -> Result<ResourceHandle> {
        let primary = self.require_primary(workload_id)?;
        let remote_id = remote_of(&primary)?;

        self.stop_supervisor(workload_id).await;
        self.registry.set_routable(workload_id, false)?;
        self.driver.pause(&remote_id).await?;
        let paused = self.registry.transition(&primary.id, ResourceState::Paused)?;
        info!(workload_id = %workload_id, primary = %primary.id, "Primary paused");
        Ok(paused)
    }

    pub async fn unpause(&self, workload_id: &WorkloadId) -> Result<ResourceHandle> {
        let primary = self.require_primary(workload_id)?;
        let remote_id = remote_of(&primary)?;

        self.driver.resume(&remote_id).await?;
        let running = self.registry.transition(&primary.id, ResourceState::Running)?;
        self.registry.set_routable(workload_id, true)?;
        if self.registry.policy(workload_id)?.is_some() {
            self.spawn_supervisor(workload_id);
        }
        info!(workload_id = %workload_id, primary = %primary.id, "Primary resumed");
        Ok(running)
    }

    /// Cancel supervision (and any recovery in flight) and destroy every live
    /// resource of the workload
    pub async fn teardown(&self, workload_id: &WorkloadId) -> Result<()> {
        let started = Instant::now();
        let policy = self.registry.policy(workload_id)?.map(|p| p.kind());
        self.stop_supervisor(workload_id).await;

        let record = self.registry.workload(workload_id)?;
        for handle in record.live_resources() {
            self.destroy(&handle.id).await;
        }
        self.registry.detach_policy(workload_id)?;
        self.registry.set_phase(workload_id, WorkloadPhase::Abandoned)?;

        self.registry.append_event(FailoverEvent::new(
            workload_id.clone(),
            policy,
            FailoverTrigger::ManualTeardown,
            FailoverOutcome::Abandoned,
            started.elapsed(),
        ))?;
        info!(workload_id = %workload_id, "Workload torn down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn status(&self, workload_id: &WorkloadId) -> Result<WorkloadStatus> {
        let record: WorkloadRecord = self.registry.workload(workload_id)?;
        let supervised = self
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workload_id)
            .is_some_and(|s| !s.task.is_finished());

        Ok(WorkloadStatus {
            workload_id: record.workload_id.clone(),
            phase: record.phase,
            routable: record.routable,
            primary: record.primary_handle().cloned(),
            standby: record.standby_handle().cloned(),
            policy: record.policy.as_ref().map(|a| a.policy.clone()),
            latest_artifact: record.latest_artifact().cloned(),
            supervised,
            events: record.events.len(),
        })
    }

    pub fn events(&self, workload_id: &WorkloadId) -> Result<Vec<FailoverEvent>> {
        self.registry.events(workload_id)
    }

    /// Wait for the workload's supervisor to stop.
    ///
    /// Returns [`OrchestratorError::Unrecoverable`] if recovery failed. Dropping
    /// the future leaves the supervisor in place for [`Self::shutdown`].
    pub async fn wait(&self, workload_id: &WorkloadId) -> Result<()> {
        let done = self
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workload_id)
            .map(|s| s.done.clone());
        let Some(done) = done else {
            return Ok(());
        };
        done.cancelled().await;

        let supervisor = self
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workload_id);
        match supervisor {
            Some(supervisor) => join(supervisor.task).await,
            None => Ok(()),
        }
    }

    /// Cancel every supervisor along with any recovery or standby race it has
    /// in flight, and wait until all of them have cleaned up
    pub async fn shutdown(&self) {
        let supervisors: Vec<(WorkloadId, Supervisor)> = self
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if supervisors.is_empty() {
            return;
        }

        for (_, supervisor) in &supervisors {
            supervisor.cancel.cancel();
        }
        let count = supervisors.len();
        for (workload_id, supervisor) in supervisors {
            if let Err(e) = join(supervisor.task).await {
                warn!(workload_id = %workload_id, error = %e, "Supervisor ended with error");
            }
        }
        info!(supervisors = count, "Supervision shut down");
    }

    /// Clean up after a previous process.
    ///
    /// Races it left running are marked failed, and every live handle that is
    /// neither a primary nor a standby is destroyed. Call at startup before
    /// anything races. Returns how many handles were destroyed.
    pub async fn reap_orphans(&self) -> Result<usize> {
        let mut reaped = 0;
        for workload_id in self.registry.workload_ids() {
            let interrupted = self
                .registry
                .fail_unfinished_races(&workload_id, "interrupted before finishing")?;
            let record = self.registry.workload(&workload_id)?;
            let orphans: Vec<&ResourceHandle> = record
                .live_resources()
                .filter(|h| record.primary.as_ref() != Some(&h.id) && record.standby.as_ref() != Some(&h.id))
                .collect();
            if interrupted == 0 && orphans.is_empty() {
                continue;
            }

            warn!(
                workload_id = %workload_id,
                interrupted_races = interrupted,
                orphans = orphans.len(),
                "Cleaning up after an earlier run"
            );
            for handle in orphans {
                debug!(resource_id = %handle.id, state = %handle.state, remote_id = ?handle.remote_id, "Destroying orphan");
                self.destroy(&handle.id).await;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Restart supervisors for every persisted workload that still has a policy.
    /// Returns how many were started.
    pub fn resume_supervision(&self) -> Result<usize> {
        let mut started = 0;
        for workload_id in self.registry.workload_ids() {
            let record = self.registry.workload(&workload_id)?;
            let live_primary = record.primary_handle().is_some_and(|h| !h.state.is_terminal());
            if record.policy.is_none() || !live_primary || record.phase.is_terminal() {
                continue;
            }
            debug!(workload_id = %workload_id, phase = ?record.phase, "Resuming supervision");
            self.spawn_supervisor(&workload_id);
            started += 1;
        }
        Ok(started)
    }

    // ------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------

    fn spawn_supervisor(&self, workload_id: &WorkloadId) {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let supervise = self.clone().supervise(workload_id.clone(), cancel.clone());
        let finished = done.clone();
        let task = tokio::spawn(async move {
            let _finished = finished.drop_guard();
            supervise.await
        });

        let previous = self
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workload_id.clone(), Supervisor { cancel, done, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    /// Cancel and join the supervisor. Returns whether one was running.
    async fn stop_supervisor(&self, workload_id: &WorkloadId) -> bool {
        let supervisor = self
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workload_id);
        let Some(supervisor) = supervisor else {
            return false;
        };

        let running = !supervisor.task.is_finished();
        supervisor.cancel.cancel();
        if let Err(e) = join(supervisor.task).await {
            debug!(workload_id = %workload_id, error = %e, "Supervisor ended with error");
        }
        running
    }

    async fn supervise(self, workload_id: WorkloadId, cancel: CancellationToken) -> Result<()> {
        loop {
            let Some(policy) = self.registry.policy(&workload_id)? else {
                return Ok(());
            };
            let primary = self.require_primary(&workload_id)?;
            let remote_id = remote_of(&primary)?;
            self.registry.set_phase(&workload_id, WorkloadPhase::Monitoring)?;

            let background_cancel = cancel.child_token();
            let background = tokio::spawn(self.clone().background(
                workload_id.clone(),
                policy.clone(),
                primary.clone(),
                background_cancel.clone(),
            ));

            let mut probes = self
                .prober
                .probe_stream(primary.id.clone(), remote_id, self.config.probe_interval);
            let mut counter = FailureCounter::new(self.config.failure_threshold);

            let failure = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    Some(report) = probes.next() => {
                        if let Some(failure) = counter.record(&report) {
                            break Some(failure);
                        }
                    }
                }
            };

            background_cancel.cancel();
            if let Err(e) = background.await {
                error!(workload_id = %workload_id, error = %e, "Background task panicked");
            }

            let Some(failure) = failure else {
                debug!(workload_id = %workload_id, "Supervisor stopped");
                return Ok(());
            };

            let triggered = Instant::now();
            self.registry.set_routable(&workload_id, false)?;
            self.registry.set_phase(&workload_id, WorkloadPhase::Degraded)?;
            warn!(workload_id = %workload_id, policy = %policy.kind(), error = %failure, "Primary lost");
            self.registry.append_event(FailoverEvent::new(
                workload_id.clone(),
                Some(policy.kind()),
                FailoverTrigger::HealthCheck,
                FailoverOutcome::Degraded {
                    primary: primary.id.clone(),
                    reason: failure.to_string(),
                },
                Duration::ZERO,
            ))?;
            self.registry.set_phase(&workload_id, WorkloadPhase::Recovering)?;

            let recovered = match self.recover(&workload_id, &policy, &cancel).await {
                Ok(replacement) => {
                    let swapped = self.swap(&workload_id, &primary, &replacement).await;
                    swapped.map(|()| replacement)
                }
                Err(e) => Err(e),
            };

            match recovered {
                Ok(replacement) => {
                    self.registry.append_event(FailoverEvent::new(
                        workload_id.clone(),
                        Some(policy.kind()),
                        FailoverTrigger::HealthCheck,
                        FailoverOutcome::Recovered {
                            new_primary: replacement.id.clone(),
                        },
                        triggered.elapsed(),
                    ))?;
                    info!(
                        workload_id = %workload_id,
                        old_primary = %primary.id,
                        new_primary = %replacement.id,
                        latency_ms = triggered.elapsed().as_millis() as u64,
                        "Failover complete"
                    );
                }
                Err(OrchestratorError::Cancelled) => {
                    debug!(workload_id = %workload_id, "Recovery cancelled");
                    return Ok(());
                }
                Err(e) => return Err(self.give_up(&workload_id, &policy, triggered, e)),
            }
        }
    }

    fn give_up(
        &self,
        workload_id: &WorkloadId,
        policy: &FailoverPolicy,
        triggered: Instant,
        err: OrchestratorError,
    ) -> OrchestratorError {
        error!(workload_id = %workload_id, error = %err, "Recovery failed, workload is unrecoverable");

        let event = FailoverEvent::new(
            workload_id.clone(),
            Some(policy.kind()),
            FailoverTrigger::HealthCheck,
            FailoverOutcome::Failed {
                error: err.to_string(),
            },
            triggered.elapsed(),
        );
        if let Err(e) = self.registry.append_event(event) {
            error!(workload_id = %workload_id, error = %e, "Failed to record failover event");
        }
        if let Err(e) = self.registry.set_phase(workload_id, WorkloadPhase::Unrecoverable) {
            error!(workload_id = %workload_id, error = %e, "Failed to record workload phase");
        }

        OrchestratorError::Unrecoverable {
            workload_id: workload_id.clone(),
            reason: err.to_string(),
            trail: self.registry.events(workload_id).unwrap_or_default(),
        }
    }

    /// Produce a Running replacement for the lost primary
    async fn recover(
        &self,
        workload_id: &WorkloadId,
        policy: &FailoverPolicy,
        cancel: &CancellationToken,
    ) -> Result<ResourceHandle> {
        match policy {
            FailoverPolicy::SnapshotOnly { .. } => self.replace_from_snapshot(workload_id, None, cancel).await,
            FailoverPolicy::HotStandby { .. } => match self.healthy_standby(workload_id).await? {
                Some(standby) => Ok(standby),
                None => self.replace_from_snapshot(workload_id, None, cancel).await,
            },
            FailoverPolicy::WarmPool { reserved_offer } => match self.healthy_standby(workload_id).await? {
                Some(warm) => Ok(warm),
                None => {
                    self.replace_from_snapshot(workload_id, Some(reserved_offer.clone()), cancel)
                        .await
                }
            },
        }
    }

    /// The standby if it passes a probe; a failing standby is destroyed
    async fn healthy_standby(&self, workload_id: &WorkloadId) -> Result<Option<ResourceHandle>> {
        let Some(standby) = self.registry.standby(workload_id)? else {
            debug!(workload_id = %workload_id, "No standby to fail over to");
            return Ok(None);
        };
        if standby.state != ResourceState::Running {
            return Ok(None);
        }

        let remote_id = remote_of(&standby)?;
        match self.prober.probe(&remote_id).await {
            Ok(()) => Ok(Some(standby)),
            Err(reason) => {
                warn!(workload_id = %workload_id, standby = %standby.id, reason = %reason, "Standby unhealthy");
                self.destroy(&standby.id).await;
                Ok(None)
            }
        }
    }

    /// Race for the workload spec and restore the latest artifact, if any
    async fn replace_from_snapshot(
        &self,
        workload_id: &WorkloadId,
        preferred: Option<Offer>,
        cancel: &CancellationToken,
    ) -> Result<ResourceHandle> {
        let record = self.registry.workload(workload_id)?;
        let spec = record
            .spec
            .clone()
            .ok_or_else(|| OrchestratorError::config(format!("workload {} has no resource spec", workload_id)))?;

        let mut request = RaceRequest::new(workload_id.clone(), spec);
        if let Some(offer) = preferred {
            request = request.with_preferred_offer(offer);
        }
        let replacement = self.race.race(request, cancel).await?;

        match record.latest_artifact() {
            Some(artifact) => self.restore_onto(artifact, &replacement, cancel).await,
            None => {
                warn!(workload_id = %workload_id, "No artifact to restore, replacement starts empty");
                Ok(replacement)
            }
        }
    }

    /// Running -> Restoring -> Running. The target is destroyed if restore fails.
    async fn restore_onto(
        &self,
        artifact: &SnapshotArtifact,
        target: &ResourceHandle,
        cancel: &CancellationToken,
    ) -> Result<ResourceHandle> {
        let restoring = self.registry.transition(&target.id, ResourceState::Restoring)?;
        match self.snapshots.restore(artifact, &restoring, cancel).await {
            Ok(()) => self.registry.transition(&target.id, ResourceState::Running),
            Err(e) => {
                let last_error = e.to_string();
                if let Err(e) = self.registry.annotate(&target.id, |h| h.last_error = Some(last_error)) {
                    warn!(resource_id = %target.id, error = %e, "Failed to record restore error");
                }
                self.destroy(&target.id).await;
                Err(e)
            }
        }
    }

    /// Swap the primary pointer, then destroy the old primary
    async fn swap(&self, workload_id: &WorkloadId, old: &ResourceHandle, new: &ResourceHandle) -> Result<()> {
        if let Err(e) = self.registry.swap_primary(workload_id, &old.id, &new.id) {
            self.destroy(&new.id).await;
            return Err(e);
        }
        self.destroy(&old.id).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background actions
    // ------------------------------------------------------------------

    async fn background(
        self,
        workload_id: WorkloadId,
        policy: FailoverPolicy,
        primary: ResourceHandle,
        cancel: CancellationToken,
    ) {
        let result = match policy {
            FailoverPolicy::SnapshotOnly { interval } => {
                self.seal_periodically(&workload_id, &primary, interval, &cancel).await
            }
            FailoverPolicy::HotStandby {
                sync_interval,
                standby_spec,
            } => {
                self.keep_standby(&workload_id, &primary, standby_spec, None, Some(sync_interval), &cancel)
                    .await
            }
            FailoverPolicy::WarmPool { reserved_offer } => {
                let spec = self
                    .registry
                    .workload(&workload_id)
                    .ok()
                    .and_then(|r| r.spec)
                    .unwrap_or_else(|| ResourceSpec::matching(&reserved_offer));
                self.keep_standby(&workload_id, &primary, spec, Some(reserved_offer), None, &cancel)
                    .await
            }
        };

        match result {
            Ok(()) | Err(OrchestratorError::Cancelled) => {}
            Err(e) => warn!(workload_id = %workload_id, error = %e, "Background action stopped"),
        }
    }

    async fn seal_periodically(
        &self,
        workload_id: &WorkloadId,
        primary: &ResourceHandle,
        every: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match self.snapshots.seal(primary, cancel).await {
                Ok(artifact) => {
                    debug!(workload_id = %workload_id, artifact_id = %artifact.id, "Periodic seal");
                    self.registry.record_artifact(workload_id, artifact)?;
                }
                Err(OrchestratorError::Cancelled) => return Ok(()),
                Err(e) => warn!(workload_id = %workload_id, error = %e, "Periodic seal failed"),
            }
        }
    }

    /// Keep a standby (hot) or warm unit alive; sync onto it when `sync_every` is set
    async fn keep_standby(
        &self,
        workload_id: &WorkloadId,
        primary: &ResourceHandle,
        spec: ResourceSpec,
        preferred: Option<Offer>,
        sync_every: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let primary_remote = remote_of(primary)?;
        let every = sync_every.unwrap_or(self.config.probe_interval);

        loop {
            let standby = match self.registry.standby(workload_id)? {
                Some(standby) if !standby.state.is_terminal() => standby,
                _ => {
                    let mut request = RaceRequest::new(workload_id.clone(), spec.clone());
                    if let Some(offer) = &preferred {
                        request = request.with_preferred_offer(offer.clone());
                    }
                    match self.race.race(request, cancel).await {
                        Ok(standby) => {
                            self.registry.set_standby(workload_id, Some(standby.id.clone()))?;
                            info!(
                                workload_id = %workload_id,
                                standby = %standby.id,
                                offer_id = %standby.offer.id,
                                "Standby ready"
                            );
                            standby
                        }
                        Err(OrchestratorError::Cancelled) => return Ok(()),
                        Err(e) => {
                            warn!(workload_id = %workload_id, error = %e, "Standby race failed, retrying");
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return Ok(()),
                                _ = sleep(self.config.probe_interval) => continue,
                            }
                        }
                    }
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(every) => {}
            }

            let standby_remote = remote_of(&standby)?;
            if let Err(reason) = self.prober.probe(&standby_remote).await {
                warn!(workload_id = %workload_id, standby = %standby.id, reason = %reason, "Standby lost, replacing");
                self.destroy(&standby.id).await;
                continue;
            }

            if sync_every.is_some() {
                self.sync(&primary_remote, &standby, cancel).await;
            }
        }
    }

    async fn sync(&self, primary_remote: &str, standby: &ResourceHandle, cancel: &CancellationToken) {
        let Some(endpoint) = standby.endpoint.as_deref() else {
            warn!(standby = %standby.id, "Standby has no endpoint, skipping sync");
            return;
        };
        let command = self.config.render_sync_command(endpoint);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = self.driver.exec(primary_remote, &command) => outcome,
        };
        match outcome {
            Ok(out) if out.is_success() => debug!(standby = %standby.id, "Standby synced"),
            Ok(out) => warn!(standby = %standby.id, exit_code = out.exit_code, stderr = %out.stderr, "Sync failed"),
            Err(e) => warn!(standby = %standby.id, error = %e, "Sync failed"),
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn require_primary(&self, workload_id: &WorkloadId) -> Result<ResourceHandle> {
        self.registry
            .primary(workload_id)?
            .ok_or_else(|| OrchestratorError::NoPrimary(workload_id.clone()))
    }

    async fn destroy(&self, resource_id: &ResourceId) {
        let config = self.race.config();
        if let Err(e) = race::release(
            self.driver.as_ref(),
            &self.registry,
            resource_id,
            config.destroy_attempts,
            config.poll_interval,
        )
        .await
        {
            error!(resource_id = %resource_id, error = %e, "Failed to release resource");
        }
    }
}

fn remote_of(handle: &ResourceHandle) -> Result<String> {
    handle.remote_id.clone().ok_or_else(|| {
        OrchestratorError::Capability(TetherError::NotFound(format!(
            "resource {} has no remote id",
            handle.id
        )))
    })
}

async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
    task.await
        .map_err(|e| OrchestratorError::Capability(TetherError::Internal(e.to_string())))?
}
