//! Scriptable fakes for tests
//!
//! Everything here runs on `tokio::time`, so tests use a paused clock and
//! observe exact virtual timings.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_core::{
    ExecOutput, MarketplaceDriver, Offer, Provisioned, RemoteState, ResourceHandle, ResourceId,
    ResourceSpec, StatusSnapshot, TetherError, WorkspaceArchiver,
};
use tether_core::traits::Result;
use tokio::time::Instant;

/// Offer for the RTX_4090 class in eu-west
pub(crate) fn offer(id: &str, price: f64, reliability: f64) -> Offer {
    Offer {
        id: id.to_string(),
        gpu_class: "RTX_4090".to_string(),
        region: "eu-west".to_string(),
        price_per_hour: price,
        reliability_score: reliability,
    }
}

/// How a created instance behaves
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Boot {
    /// Reports Running this long after create
    After(Duration),
    /// Pending forever
    Never,
    /// Pending, then Failed this long after create
    DiesAfter(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Search,
    Create { offer_id: String, remote_id: String },
    Destroy(String),
    Exec { remote_id: String, command: String },
    Pause(String),
    Resume(String),
}

#[derive(Debug, Clone)]
pub(crate) struct OpRecord {
    pub at: Instant,
    pub op: Op,
}

#[derive(Debug)]
struct FakeInstance {
    offer_id: String,
    created: Instant,
    boot: Boot,
    setup_delay: Duration,
    killed: bool,
    paused: bool,
    destroyed: bool,
}

impl FakeInstance {
    fn running_since(&self) -> Option<Instant> {
        match self.boot {
            Boot::After(d) => Some(self.created + d),
            _ => None,
        }
    }

    fn state(&self, now: Instant) -> RemoteState {
        if self.destroyed {
            return RemoteState::Gone;
        }
        if self.killed {
            return RemoteState::Failed;
        }
        match self.boot {
            Boot::Never => RemoteState::Pending,
            Boot::DiesAfter(d) if now >= self.created + d => RemoteState::Failed,
            Boot::DiesAfter(_) => RemoteState::Pending,
            Boot::After(d) if now >= self.created + d => {
                if self.paused {
                    RemoteState::Paused
                } else {
                    RemoteState::Running
                }
            }
            Boot::After(_) => RemoteState::Pending,
        }
    }
}

#[derive(Default)]
struct FakeState {
    offers: Vec<Offer>,
    boot: HashMap<String, Boot>,
    setup_delay: HashMap<String, Duration>,
    /// Delay between the instance existing and create replying
    create_delay: HashMap<String, Duration>,
    fail_create: HashSet<String>,
    /// remote id -> failing exec substrings
    exec_failures: HashMap<String, Vec<String>>,
    instances: HashMap<String, FakeInstance>,
    next_id: usize,
    log: Vec<OpRecord>,
}

/// In-memory marketplace with scripted boot behaviour per offer
pub(crate) struct FakeMarketplace {
    state: Mutex<FakeState>,
}

impl FakeMarketplace {
    /// Every offer boots immediately unless scripted otherwise
    pub fn new(offers: Vec<Offer>) -> Self {
        Self {
            state: Mutex::new(FakeState {
                offers,
                ..Default::default()
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_boot(&self, offer_id: &str, boot: Boot) {
        self.with_state(|s| s.boot.insert(offer_id.to_string(), boot));
    }

    /// Commands other than `true` exit 1 until this long after the instance runs
    pub fn set_setup_delay(&self, offer_id: &str, delay: Duration) {
        self.with_state(|s| s.setup_delay.insert(offer_id.to_string(), delay));
    }

    /// Create registers the instance at once but replies only after `delay`
    pub fn set_create_delay(&self, offer_id: &str, delay: Duration) {
        self.with_state(|s| s.create_delay.insert(offer_id.to_string(), delay));
    }

    pub fn fail_create(&self, offer_id: &str) {
        self.with_state(|s| s.fail_create.insert(offer_id.to_string()));
    }

    /// Exec of any command containing `needle` on `remote_id` exits 1
    pub fn fail_exec(&self, remote_id: &str, needle: &str) {
        self.with_state(|s| {
            s.exec_failures
                .entry(remote_id.to_string())
                .or_default()
                .push(needle.to_string())
        });
    }

    /// Simulate a spot preemption
    pub fn kill(&self, remote_id: &str) {
        self.with_state(|s| {
            if let Some(instance) = s.instances.get_mut(remote_id) {
                instance.killed = true;
            }
        });
    }

    pub fn creates(&self) -> usize {
        self.with_state(|s| s.log.iter().filter(|r| matches!(r.op, Op::Create { .. })).count())
    }

    /// Remote id of the most recent instance created from `offer_id`
    pub fn remote_of(&self, offer_id: &str) -> Option<String> {
        self.with_state(|s| {
            s.log.iter().rev().find_map(|r| match &r.op {
                Op::Create { offer_id: o, remote_id } if o == offer_id => Some(remote_id.clone()),
                _ => None,
            })
        })
    }

    /// Instances not destroyed, sorted
    pub fn live(&self) -> Vec<String> {
        self.with_state(|s| {
            let mut live: Vec<String> = s
                .instances
                .iter()
                .filter(|(_, i)| !i.destroyed)
                .map(|(id, _)| id.clone())
                .collect();
            live.sort();
            live
        })
    }

    pub fn is_destroyed(&self, remote_id: &str) -> bool {
        self.with_state(|s| s.instances.get(remote_id).is_some_and(|i| i.destroyed))
    }

    pub fn log(&self) -> Vec<OpRecord> {
        self.with_state(|s| s.log.clone())
    }

    /// Exec commands run on `remote_id` containing `needle`
    pub fn execs_matching(&self, remote_id: &str, needle: &str) -> usize {
        self.with_state(|s| {
            s.log
                .iter()
                .filter(|r| match &r.op {
                    Op::Exec { remote_id: id, command } => id == remote_id && command.contains(needle),
                    _ => false,
                })
                .count()
        })
    }

    fn record(state: &mut FakeState, op: Op) {
        state.log.push(OpRecord {
            at: Instant::now(),
            op,
        });
    }
}

#[async_trait]
impl MarketplaceDriver for FakeMarketplace {
    async fn search(&self, spec: &ResourceSpec) -> Result<Vec<Offer>> {
        Ok(self.with_state(|s| {
            Self::record(s, Op::Search);
            s.offers.iter().filter(|o| spec.matches(o)).cloned().collect()
        }))
    }

    async fn create(&self, offer: &Offer, _label: &str) -> Result<Provisioned> {
        let (created, reply_delay) = self.with_state(|s| {
            if s.fail_create.contains(&offer.id) {
                return (
                    Err(TetherError::Provider(format!("offer {} is gone", offer.id))),
                    Duration::ZERO,
                );
            }
            s.next_id += 1;
            let remote_id = format!("m-{}", s.next_id);
            let instance = FakeInstance {
                offer_id: offer.id.clone(),
                created: Instant::now(),
                boot: s.boot.get(&offer.id).copied().unwrap_or(Boot::After(Duration::ZERO)),
                setup_delay: s.setup_delay.get(&offer.id).copied().unwrap_or_default(),
                killed: false,
                paused: false,
                destroyed: false,
            };
            s.instances.insert(remote_id.clone(), instance);
            Self::record(
                s,
                Op::Create {
                    offer_id: offer.id.clone(),
                    remote_id: remote_id.clone(),
                },
            );
            let created = Ok(Provisioned {
                endpoint: Some(format!("10.0.0.{}:22", s.next_id)),
                remote_id,
            });
            (created, s.create_delay.get(&offer.id).copied().unwrap_or_default())
        });
        if !reply_delay.is_zero() {
            tokio::time::sleep(reply_delay).await;
        }
        created
    }

    async fn poll(&self, remote_id: &str) -> Result<StatusSnapshot> {
        self.with_state(|s| {
            let state = s
                .instances
                .get(remote_id)
                .map(|i| i.state(Instant::now()))
                .unwrap_or(RemoteState::Gone);
            Ok(StatusSnapshot::new(state))
        })
    }

    async fn destroy(&self, remote_id: &str) -> Result<()> {
        self.with_state(|s| {
            if let Some(instance) = s.instances.get_mut(remote_id) {
                instance.destroyed = true;
            }
            Self::record(s, Op::Destroy(remote_id.to_string()));
            Ok(())
        })
    }

    async fn exec(&self, remote_id: &str, command: &str) -> Result<ExecOutput> {
        self.with_state(|s| {
            Self::record(
                s,
                Op::Exec {
                    remote_id: remote_id.to_string(),
                    command: command.to_string(),
                },
            );
            let now = Instant::now();
            let instance = s
                .instances
                .get(remote_id)
                .ok_or_else(|| TetherError::NotFound(remote_id.to_string()))?;
            if instance.state(now) != RemoteState::Running {
                return Err(TetherError::Network(format!("{} unreachable", remote_id)));
            }

            let failing = s
                .exec_failures
                .get(remote_id)
                .is_some_and(|needles| needles.iter().any(|n| command.contains(n.as_str())));
            let setting_up = command != "true"
                && instance
                    .running_since()
                    .is_some_and(|since| now < since + instance.setup_delay);

            let exit_code = if failing || setting_up { 1 } else { 0 };
            Ok(ExecOutput {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            })
        })
    }

    async fn pause(&self, remote_id: &str) -> Result<()> {
        self.with_state(|s| {
            if let Some(instance) = s.instances.get_mut(remote_id) {
                instance.paused = true;
            }
            Self::record(s, Op::Pause(remote_id.to_string()));
            Ok(())
        })
    }

    async fn resume(&self, remote_id: &str) -> Result<()> {
        self.with_state(|s| {
            if let Some(instance) = s.instances.get_mut(remote_id) {
                instance.paused = false;
            }
            Self::record(s, Op::Resume(remote_id.to_string()));
            Ok(())
        })
    }
}

/// Working directories held in memory, keyed by resource id
#[derive(Default)]
pub(crate) struct MemoryArchiver {
    dirs: Mutex<HashMap<ResourceId, Vec<u8>>>,
    extracts: AtomicUsize,
}

impl MemoryArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, resource_id: &ResourceId, content: Vec<u8>) {
        self.dirs.lock().unwrap().insert(resource_id.clone(), content);
    }

    pub fn content(&self, resource_id: &ResourceId) -> Option<Vec<u8>> {
        self.dirs.lock().unwrap().get(resource_id).cloned()
    }

    pub fn extracts(&self) -> usize {
        self.extracts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceArchiver for MemoryArchiver {
    async fn archive(&self, resource: &ResourceHandle) -> Result<Vec<u8>> {
        Ok(self.content(&resource.id).unwrap_or_default())
    }

    async fn extract(&self, resource: &ResourceHandle, archive: Vec<u8>) -> Result<()> {
        self.extracts.fetch_add(1, Ordering::SeqCst);
        self.put(&resource.id, archive);
        Ok(())
    }
}
