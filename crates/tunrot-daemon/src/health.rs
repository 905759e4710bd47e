//! Health monitor for the Active tunnel.
//!
//! Probes the Active slot on a fixed interval. After `threshold`
//! consecutive failures the bound candidate is blacklisted and an
//! out-of-cycle rotation is requested.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::audit;
use crate::blacklist::BlacklistStore;
use crate::catalog::CandidateId;
use crate::scheduler::RotationTrigger;
use crate::slot::{EgressProbe, check_egress};
use crate::status::StatusSnapshot;

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Nothing is Active yet.
    NoActive,
    Healthy,
    /// Failed, but below the threshold.
    Degraded { consecutive: u32 },
    /// Threshold reached: candidate blacklisted, rotation requested.
    RotationRequested { candidate: CandidateId },
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub threshold: u32,
    pub blacklist_duration: Duration,
    pub host_address: IpAddr,
}

pub struct HealthMonitor {
    probe: Arc<dyn EgressProbe>,
    blacklist: Arc<BlacklistStore>,
    status: watch::Receiver<StatusSnapshot>,
    requests: mpsc::Sender<RotationTrigger>,
    settings: HealthSettings,
    consecutive: u32,
    tracked: Option<CandidateId>,
}

impl HealthMonitor {
    pub fn new(
        probe: Arc<dyn EgressProbe>,
        blacklist: Arc<BlacklistStore>,
        status: watch::Receiver<StatusSnapshot>,
        requests: mpsc::Sender<RotationTrigger>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            probe,
            blacklist,
            status,
            requests,
            settings,
            consecutive: 0,
            tracked: None,
        }
    }

    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// Probe the Active slot once.
    pub async fn check(&mut self) -> HealthVerdict {
        let (candidate, interface) = {
            let status = self.status.borrow();
            (status.active_candidate.clone(), status.active_interface.clone())
        };
        let (Some(candidate), Some(interface)) = (candidate, interface) else {
            self.consecutive = 0;
            self.tracked = None;
            return HealthVerdict::NoActive;
        };
        if self.tracked.as_ref() != Some(&candidate) {
            self.consecutive = 0;
            self.tracked = Some(candidate.clone());
        }

        let result = check_egress(
            &*self.probe,
            &interface,
            self.settings.host_address,
            self.settings.probe_timeout,
        )
        .await;

        match result {
            Ok(addr) => {
                if self.consecutive > 0 {
                    info!(candidate = %candidate, "Active tunnel recovered");
                }
                debug!(candidate = %candidate, egress = %addr, "Health check passed");
                self.consecutive = 0;
                HealthVerdict::Healthy
            }
            Err(e) => {
                self.consecutive += 1;
                audit::health_failure(
                    &candidate,
                    self.consecutive,
                    self.settings.threshold,
                    &e.to_string(),
                );
                if self.consecutive < self.settings.threshold {
                    return HealthVerdict::Degraded {
                        consecutive: self.consecutive,
                    };
                }
                self.consecutive = 0;
                self.escalate(&candidate).await;
                HealthVerdict::RotationRequested { candidate }
            }
        }
    }

    async fn escalate(&self, candidate: &CandidateId) {
        let reason = format!("{} consecutive health check failures", self.settings.threshold);
        if let Err(e) = self
            .blacklist
            .blacklist(
                candidate,
                self.settings.blacklist_duration,
                reason,
                SystemTime::now(),
            )
            .await
        {
            warn!(candidate = %candidate, error = %e, "Failed to blacklist unhealthy candidate");
        }
        match self.requests.try_send(RotationTrigger::Health) {
            Ok(()) => info!(candidate = %candidate, "Requested out-of-cycle rotation"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Rotation request already pending");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Rotation request channel closed");
            }
        }
    }

    /// Check on every interval tick until shutdown.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.settings.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        self.check().await;
                    }
                    _ = shutdown.changed() => {
                        info!("Health monitor shutting down");
                        return;
                    }
                }
            }
        })
    }
}
