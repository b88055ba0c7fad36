//! Primary health monitoring
//!
//! A probe succeeds when both hold within `probe_timeout`:
//!
//! 1. the marketplace reports the resource `Running`
//! 2. `liveness_command` exits 0 on it
//!
//! [`HealthProber::probe_stream`] yields one [`ProbeReport`] per interval;
//! [`FailureCounter`] turns consecutive failures into a
//! [`OrchestratorError::HealthCheckFailure`] once the threshold is reached.

use crate::error::OrchestratorError;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{MarketplaceDriver, RemoteState, ResourceId};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::debug;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub resource_id: ResourceId,
    pub at: Instant,
    /// `None` when healthy, otherwise why not
    pub failure: Option<String>,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        self.failure.is_none()
    }
}

/// Probes resources through the marketplace driver
#[derive(Clone)]
pub struct HealthProber {
    driver: Arc<dyn MarketplaceDriver>,
    liveness_command: String,
    probe_timeout: Duration,
}

impl HealthProber {
    pub fn new(driver: Arc<dyn MarketplaceDriver>, liveness_command: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            driver,
            liveness_command: liveness_command.into(),
            probe_timeout,
        }
    }

    /// Probe once. `Err` carries the reason the resource is unhealthy.
    pub async fn probe(&self, remote_id: &str) -> std::result::Result<(), String> {
        let check = async {
            let status = self.driver.poll(remote_id).await.map_err(|e| format!("poll: {}", e))?;
            if status.state != RemoteState::Running {
                return Err(format!("remote state {:?}", status.state));
            }

            let out = self
                .driver
                .exec(remote_id, &self.liveness_command)
                .await
                .map_err(|e| format!("liveness exec: {}", e))?;
            if !out.is_success() {
                return Err(format!("liveness command exited {}", out.exit_code));
            }
            Ok(())
        };

        match timeout(self.probe_timeout, check).await {
            Ok(result) => result,
            Err(_) => Err(format!("probe timed out after {:?}", self.probe_timeout)),
        }
    }

    /// Probe `remote_id` every `every`, starting one interval from now
    pub fn probe_stream(
        &self,
        resource_id: ResourceId,
        remote_id: String,
        every: Duration,
    ) -> Pin<Box<dyn futures::Stream<Item = ProbeReport> + Send>> {
        let prober = self.clone();

        Box::pin(async_stream::stream! {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let at = Instant::now();
                let failure = prober.probe(&remote_id).await.err();
                if let Some(reason) = &failure {
                    debug!(resource_id = %resource_id, reason = %reason, "Probe failed");
                }
                yield ProbeReport {
                    resource_id: resource_id.clone(),
                    at,
                    failure,
                };
            }
        })
    }
}

/// Counts consecutive failed probes
#[derive(Debug, Clone)]
pub struct FailureCounter {
    threshold: u32,
    consecutive: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Record a probe; returns the failure once the threshold is reached
    pub fn record(&mut self, report: &ProbeReport) -> Option<OrchestratorError> {
        match &report.failure {
            None => {
                self.consecutive = 0;
                None
            }
            Some(reason) => {
                self.consecutive += 1;
                (self.consecutive >= self.threshold).then(|| OrchestratorError::HealthCheckFailure {
                    resource_id: report.resource_id.clone(),
                    consecutive: self.consecutive,
                    reason: reason.clone(),
                })
            }
        }
    }
}
