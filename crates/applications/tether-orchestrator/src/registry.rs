//! Resource lifecycle registry
//!
//! The registry is the only shared mutable structure in the orchestrator. It
//! owns every [`ResourceHandle`], the primary/standby pointers of each
//! workload, the attached failover policy, race sessions, sealed artifacts and
//! the failover event log.
//!
//! Every mutation takes the lock of exactly one workload, applies the change
//! and takes a versioned copy of the record. The copy is written after the
//! lock is released; a write never replaces a newer version on disk, and a
//! failed write is returned to the caller. Lifecycle edges are validated
//! against [`ResourceState::can_transition_to`] here and nowhere else.

use crate::error::{OrchestratorError, Result};
use crate::events::FailoverEvent;
use crate::failover::{FailoverPolicy, PolicyKind};
use crate::persist::JsonStateStore;
use crate::race::{RaceSession, RaceStatus};
use crate::snapshot::SnapshotArtifact;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tether_core::{ResourceHandle, ResourceId, ResourceSpec, ResourceState, WorkloadId};
use tracing::{debug, error, info};

/// Supervision phase of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    /// No policy attached
    #[default]
    Unsupervised,
    Monitoring,
    Degraded,
    Recovering,
    /// Sealed and destroyed on request, waiting for `resume`
    Hibernated,
    /// Recovery failed; needs an operator
    Unrecoverable,
    /// Torn down on request
    Abandoned,
}

impl WorkloadPhase {
    /// Phases a supervisor never leaves on its own
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Unrecoverable | Self::Abandoned)
    }
}

/// Policy plus the handle it is attached to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedPolicy {
    pub resource_id: ResourceId,
    pub policy: FailoverPolicy,
}

/// Everything known about one workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub workload_id: WorkloadId,

    /// Spec the primary was raced with; reused for replacement races
    #[serde(default)]
    pub spec: Option<ResourceSpec>,

    pub primary: Option<ResourceId>,
    pub standby: Option<ResourceId>,

    /// Whether traffic may be routed to the primary
    pub routable: bool,

    pub policy: Option<AttachedPolicy>,

    /// Policy set aside while hibernated, re-attached on resume
    #[serde(default)]
    pub parked_policy: Option<FailoverPolicy>,

    pub phase: WorkloadPhase,

    pub resources: BTreeMap<ResourceId, ResourceHandle>,
    pub races: Vec<RaceSession>,
    pub artifacts: Vec<SnapshotArtifact>,
    pub events: Vec<FailoverEvent>,
}

impl WorkloadRecord {
    /// Empty record
    pub fn new(workload_id: WorkloadId) -> Self {
        Self {
            workload_id,
            spec: None,
            primary: None,
            standby: None,
            routable: false,
            policy: None,
            parked_policy: None,
            phase: WorkloadPhase::Unsupervised,
            resources: BTreeMap::new(),
            races: Vec::new(),
            artifacts: Vec::new(),
            events: Vec::new(),
        }
    }

    fn handle_mut(&mut self, id: &ResourceId) -> Result<&mut ResourceHandle> {
        self.resources
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::ResourceNotFound(id.clone()))
    }

    fn transition(&mut self, id: &ResourceId, to: ResourceState) -> Result<&mut ResourceHandle> {
        let handle = self.handle_mut(id)?;
        if !handle.state.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                resource_id: id.clone(),
                from: handle.state,
                to,
            });
        }
        debug!(resource_id = %id, from = %handle.state, to = %to, "Resource transition");
        handle.state = to;
        if to == ResourceState::Ready && handle.ready_at.is_none() {
            handle.ready_at = Some(Utc::now());
        }
        Ok(handle)
    }

    /// Primary handle, if any
    pub fn primary_handle(&self) -> Option<&ResourceHandle> {
        self.primary.as_ref().and_then(|id| self.resources.get(id))
    }

    /// Standby handle, if any
    pub fn standby_handle(&self) -> Option<&ResourceHandle> {
        self.standby.as_ref().and_then(|id| self.resources.get(id))
    }

    /// Handles not yet destroyed
    pub fn live_resources(&self) -> impl Iterator<Item = &ResourceHandle> {
        self.resources.values().filter(|h| !h.state.is_terminal())
    }

    /// Most recently sealed artifact
    pub fn latest_artifact(&self) -> Option<&SnapshotArtifact> {
        self.artifacts.iter().max_by_key(|a| a.created_at)
    }
}

/// One workload's record plus its persistence bookkeeping
struct WorkloadSlot {
    record: Mutex<WorkloadRecord>,
    /// Bumped under the record lock on every mutation
    version: AtomicU64,
    /// Version last written to disk. Held while writing, never with `record`.
    written: Mutex<u64>,
}

impl WorkloadSlot {
    fn new(record: WorkloadRecord) -> Self {
        Self {
            record: Mutex::new(record),
            version: AtomicU64::new(0),
            written: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkloadRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type Slot = Arc<WorkloadSlot>;

/// Single source of truth for resources and workloads
pub struct Registry {
    workloads: RwLock<HashMap<WorkloadId, Slot>>,
    /// resource -> owning workload
    index: RwLock<HashMap<ResourceId, WorkloadId>>,
    store: Option<JsonStateStore>,
}

impl Registry {
    /// Registry that is not persisted
    pub fn in_memory() -> Self {
        Self {
            workloads: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Registry persisted in `store`, loading every record already there
    pub fn open(store: JsonStateStore) -> Result<Self> {
        let records = store.load_all()?;
        let mut workloads = HashMap::new();
        let mut index = HashMap::new();

        for record in records {
            for id in record.resources.keys() {
                index.insert(id.clone(), record.workload_id.clone());
            }
            workloads.insert(record.workload_id.clone(), Arc::new(WorkloadSlot::new(record)));
        }

        info!(
            state_dir = %store.dir().display(),
            workloads = workloads.len(),
            resources = index.len(),
            "Registry loaded"
        );

        Ok(Self {
            workloads: RwLock::new(workloads),
            index: RwLock::new(index),
            store: Some(store),
        })
    }

    fn slot(&self, workload_id: &WorkloadId) -> Result<Slot> {
        self.workloads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workload_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::WorkloadNotFound(workload_id.clone()))
    }

    fn slot_or_create(&self, workload_id: &WorkloadId) -> Slot {
        let mut workloads = self.workloads.write().unwrap_or_else(|e| e.into_inner());
        workloads
            .entry(workload_id.clone())
            .or_insert_with(|| Arc::new(WorkloadSlot::new(WorkloadRecord::new(workload_id.clone()))))
            .clone()
    }

    fn owner(&self, resource_id: &ResourceId) -> Result<WorkloadId> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(resource_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::ResourceNotFound(resource_id.clone()))
    }

    /// Apply `f` to one workload under its lock, then persist the result.
    ///
    /// `f` must validate before it mutates: an `Err` leaves the record untouched.
    /// A failed save is returned as [`OrchestratorError::Persist`]; the change
    /// stays in memory and reaches disk with the next successful save.
    fn mutate<T>(
        &self,
        workload_id: &WorkloadId,
        f: impl FnOnce(&mut WorkloadRecord) -> Result<T>,
    ) -> Result<T> {
        let slot = self.slot(workload_id)?;
        let (out, snapshot) = {
            let mut record = slot.lock();
            let out = f(&mut record)?;
            (out, self.snapshot(&slot, &record))
        };
        if let Some((version, record)) = snapshot {
            self.persist(&slot, version, &record)?;
        }
        Ok(out)
    }

    fn read<T>(&self, workload_id: &WorkloadId, f: impl FnOnce(&WorkloadRecord) -> T) -> Result<T> {
        let slot = self.slot(workload_id)?;
        let record = slot.lock();
        Ok(f(&record))
    }

    /// Versioned copy to persist; `None` without a store. Call with the record locked.
    fn snapshot(&self, slot: &WorkloadSlot, record: &WorkloadRecord) -> Option<(u64, WorkloadRecord)> {
        self.store.as_ref()?;
        let version = slot.version.fetch_add(1, Ordering::SeqCst) + 1;
        Some((version, record.clone()))
    }

    fn persist(&self, slot: &WorkloadSlot, version: u64, record: &WorkloadRecord) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut written = slot.written.lock().unwrap_or_else(|e| e.into_inner());
        if *written >= version {
            return Ok(());
        }
        store.save(record).map_err(|e| {
            error!(workload_id = %record.workload_id, version, error = %e, "Failed to persist workload record");
            OrchestratorError::Persist {
                workload_id: record.workload_id.clone(),
                reason: e.to_string(),
            }
        })?;
        *written = version;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workloads
    // ------------------------------------------------------------------

    /// Create the workload if it does not exist
    pub fn ensure_workload(&self, workload_id: &WorkloadId) -> Result<()> {
        self.slot_or_create(workload_id);
        self.mutate(workload_id, |_| Ok(()))
    }

    /// Snapshot of a workload record
    pub fn workload(&self, workload_id: &WorkloadId) -> Result<WorkloadRecord> {
        self.read(workload_id, |r| r.clone())
    }

    /// All known workload ids, sorted
    pub fn workload_ids(&self) -> Vec<WorkloadId> {
        let mut ids: Vec<_> = self
            .workloads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Remember the spec replacement races should use
    pub fn set_spec(&self, workload_id: &WorkloadId, spec: ResourceSpec) -> Result<()> {
        self.mutate(workload_id, |r| {
            r.spec = Some(spec);
            Ok(())
        })
    }

    pub fn phase(&self, workload_id: &WorkloadId) -> Result<WorkloadPhase> {
        self.read(workload_id, |r| r.phase)
    }

    pub fn set_phase(&self, workload_id: &WorkloadId, phase: WorkloadPhase) -> Result<()> {
        self.mutate(workload_id, |r| {
            if r.phase != phase {
                info!(workload_id = %workload_id, from = ?r.phase, to = ?phase, "Workload phase");
                r.phase = phase;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Register a new handle (creating its workload if needed)
    pub fn insert(&self, handle: ResourceHandle) -> Result<()> {
        let workload_id = handle.workload_id.clone();
        self.slot_or_create(&workload_id);
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.id.clone(), workload_id.clone());
        self.mutate(&workload_id, |r| {
            r.resources.insert(handle.id.clone(), handle);
            Ok(())
        })
    }

    /// Current handle
    pub fn get(&self, resource_id: &ResourceId) -> Result<ResourceHandle> {
        let workload_id = self.owner(resource_id)?;
        self.read(&workload_id, |r| r.resources.get(resource_id).cloned())?
            .ok_or_else(|| OrchestratorError::ResourceNotFound(resource_id.clone()))
    }

    /// Move a handle along one lifecycle edge
    pub fn transition(&self, resource_id: &ResourceId, to: ResourceState) -> Result<ResourceHandle> {
        self.transition_with(resource_id, to, |_| {})
    }

    /// Move a handle along one lifecycle edge and update other fields atomically
    pub fn transition_with(
        &self,
        resource_id: &ResourceId,
        to: ResourceState,
        update: impl FnOnce(&mut ResourceHandle),
    ) -> Result<ResourceHandle> {
        let workload_id = self.owner(resource_id)?;
        self.mutate(&workload_id, |r| {
            let handle = r.transition(resource_id, to)?;
            update(handle);
            Ok(handle.clone())
        })
    }

    /// Update non-state fields of a handle
    pub fn annotate(
        &self,
        resource_id: &ResourceId,
        update: impl FnOnce(&mut ResourceHandle),
    ) -> Result<ResourceHandle> {
        let workload_id = self.owner(resource_id)?;
        self.mutate(&workload_id, |r| {
            let handle = r.handle_mut(resource_id)?;
            update(handle);
            Ok(handle.clone())
        })
    }

    /// Mark a handle Destroyed from whatever state it is in.
    ///
    /// Returns `false` if it already was. Pointers referencing it are cleared.
    pub fn mark_destroyed(&self, resource_id: &ResourceId) -> Result<bool> {
        let workload_id = self.owner(resource_id)?;
        self.mutate(&workload_id, |r| {
            if r.handle_mut(resource_id)?.state.is_terminal() {
                return Ok(false);
            }
            r.transition(resource_id, ResourceState::Destroyed)?;
            if r.primary.as_ref() == Some(resource_id) {
                r.primary = None;
                r.routable = false;
            }
            if r.standby.as_ref() == Some(resource_id) {
                r.standby = None;
            }
            if r.policy.as_ref().is_some_and(|p| &p.resource_id == resource_id) {
                r.policy = None;
            }
            Ok(true)
        })
    }

    // ------------------------------------------------------------------
    // Primary / standby pointers
    // ------------------------------------------------------------------

    /// Current primary handle
    pub fn primary(&self, workload_id: &WorkloadId) -> Result<Option<ResourceHandle>> {
        self.read(workload_id, |r| r.primary_handle().cloned())
    }

    /// Primary handle, only while traffic may be routed to it
    pub fn routable_primary(&self, workload_id: &WorkloadId) -> Result<Option<ResourceHandle>> {
        self.read(workload_id, |r| {
            if r.routable {
                r.primary_handle().cloned()
            } else {
                None
            }
        })
    }

    /// Install the first primary of a workload (the handle must be Running)
    pub fn set_primary(&self, workload_id: &WorkloadId, resource_id: &ResourceId) -> Result<()> {
        self.mutate(workload_id, |r| {
            if let Some(current) = r.primary_handle() {
                if !current.state.is_terminal() {
                    return Err(OrchestratorError::StalePrimary {
                        workload_id: workload_id.clone(),
                        expected: resource_id.clone(),
                        actual: Some(current.id.clone()),
                    });
                }
            }
            let handle = r.handle_mut(resource_id)?;
            if handle.state != ResourceState::Running {
                return Err(OrchestratorError::InvalidTransition {
                    resource_id: resource_id.clone(),
                    from: handle.state,
                    to: ResourceState::Running,
                });
            }
            r.primary = Some(resource_id.clone());
            r.routable = true;
            info!(workload_id = %workload_id, primary = %resource_id, "Primary set");
            Ok(())
        })
    }

    /// Atomically move the primary pointer from `expected` to `new_primary`.
    ///
    /// The new primary is moved to Running if needed, the policy follows it, the
    /// old primary is marked Failed (unless already gone) and routing resumes.
    /// Fails with `StalePrimary` if the pointer no longer references `expected`.
    pub fn swap_primary(
        &self,
        workload_id: &WorkloadId,
        expected: &ResourceId,
        new_primary: &ResourceId,
    ) -> Result<()> {
        self.mutate(workload_id, |r| {
            if r.primary.as_ref() != Some(expected) {
                return Err(OrchestratorError::StalePrimary {
                    workload_id: workload_id.clone(),
                    expected: expected.clone(),
                    actual: r.primary.clone(),
                });
            }

            let new_state = r.handle_mut(new_primary)?.state;
            if new_state != ResourceState::Running && !new_state.can_transition_to(ResourceState::Running) {
                return Err(OrchestratorError::InvalidTransition {
                    resource_id: new_primary.clone(),
                    from: new_state,
                    to: ResourceState::Running,
                });
            }
            let old_state = r.handle_mut(expected)?.state;

            // Validated; mutate.
            if new_state != ResourceState::Running {
                r.transition(new_primary, ResourceState::Running)?;
            }
            if old_state.can_transition_to(ResourceState::Failed) {
                r.transition(expected, ResourceState::Failed)?;
            }
            r.primary = Some(new_primary.clone());
            r.routable = true;
            if r.standby.as_ref() == Some(new_primary) {
                r.standby = None;
            }
            if let Some(attached) = r.policy.as_mut() {
                attached.resource_id = new_primary.clone();
            }

            info!(
                workload_id = %workload_id,
                old_primary = %expected,
                new_primary = %new_primary,
                "Primary swapped"
            );
            Ok(())
        })
    }

    /// Stop or resume routing to the primary
    pub fn set_routable(&self, workload_id: &WorkloadId, routable: bool) -> Result<()> {
        self.mutate(workload_id, |r| {
            r.routable = routable;
            Ok(())
        })
    }

    pub fn standby(&self, workload_id: &WorkloadId) -> Result<Option<ResourceHandle>> {
        self.read(workload_id, |r| r.standby_handle().cloned())
    }

    pub fn set_standby(&self, workload_id: &WorkloadId, resource_id: Option<ResourceId>) -> Result<()> {
        self.mutate(workload_id, |r| {
            if let Some(id) = &resource_id {
                r.handle_mut(id)?;
            }
            r.standby = resource_id;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------

    /// Attach a policy to the current primary
    pub fn attach_policy(&self, workload_id: &WorkloadId, policy: FailoverPolicy) -> Result<ResourceId> {
        self.mutate(workload_id, |r| {
            if let Some(attached) = &r.policy {
                return Err(OrchestratorError::PolicyAlreadyAttached(attached.resource_id.clone()));
            }
            let primary = r
                .primary
                .clone()
                .ok_or_else(|| OrchestratorError::NoPrimary(workload_id.clone()))?;
            r.policy = Some(AttachedPolicy {
                resource_id: primary.clone(),
                policy,
            });
            Ok(primary)
        })
    }

    /// Detach the policy, returning it
    pub fn detach_policy(&self, workload_id: &WorkloadId) -> Result<Option<FailoverPolicy>> {
        self.mutate(workload_id, |r| Ok(r.policy.take().map(|a| a.policy)))
    }

    pub fn policy(&self, workload_id: &WorkloadId) -> Result<Option<FailoverPolicy>> {
        self.read(workload_id, |r| r.policy.as_ref().map(|a| a.policy.clone()))
    }

    /// Detach the policy and keep it for [`Registry::take_parked_policy`]
    pub fn park_policy(&self, workload_id: &WorkloadId) -> Result<Option<PolicyKind>> {
        self.mutate(workload_id, |r| {
            let kind = r.policy.as_ref().map(|a| a.policy.kind());
            if let Some(attached) = r.policy.take() {
                r.parked_policy = Some(attached.policy);
            }
            Ok(kind)
        })
    }

    pub fn take_parked_policy(&self, workload_id: &WorkloadId) -> Result<Option<FailoverPolicy>> {
        self.mutate(workload_id, |r| Ok(r.parked_policy.take()))
    }

    // ------------------------------------------------------------------
    // Races, artifacts, events
    // ------------------------------------------------------------------

    /// Insert or replace a race session
    pub fn record_race(&self, workload_id: &WorkloadId, session: &RaceSession) -> Result<()> {
        self.slot_or_create(workload_id);
        self.mutate(workload_id, |r| {
            match r.races.iter_mut().find(|s| s.id == session.id) {
                Some(existing) => *existing = session.clone(),
                None => r.races.push(session.clone()),
            }
            Ok(())
        })
    }

    /// Mark every race still `Running` as failed. Returns how many were.
    pub fn fail_unfinished_races(&self, workload_id: &WorkloadId, reason: &str) -> Result<usize> {
        self.mutate(workload_id, |r| {
            let mut failed = 0;
            for session in r.races.iter_mut().filter(|s| s.status == RaceStatus::Running) {
                session.status = RaceStatus::Failed {
                    reason: reason.to_string(),
                };
                session.finished_at = Some(Utc::now());
                failed += 1;
            }
            Ok(failed)
        })
    }

    pub fn record_artifact(&self, workload_id: &WorkloadId, artifact: SnapshotArtifact) -> Result<()> {
        self.mutate(workload_id, |r| {
            r.artifacts.push(artifact);
            Ok(())
        })
    }

    pub fn latest_artifact(&self, workload_id: &WorkloadId) -> Result<Option<SnapshotArtifact>> {
        self.read(workload_id, |r| r.latest_artifact().cloned())
    }

    pub fn artifact(&self, workload_id: &WorkloadId, artifact_id: &str) -> Result<Option<SnapshotArtifact>> {
        self.read(workload_id, |r| {
            r.artifacts.iter().find(|a| a.id == artifact_id).cloned()
        })
    }

    /// Append to the failover log
    pub fn append_event(&self, event: FailoverEvent) -> Result<()> {
        let workload_id = event.workload_id.clone();
        self.mutate(&workload_id, |r| {
            r.events.push(event);
            Ok(())
        })
    }

    pub fn events(&self, workload_id: &WorkloadId) -> Result<Vec<FailoverEvent>> {
        self.read(workload_id, |r| r.events.clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::in_memory()
    }
}
