//! Rotation scheduler: the single-flight section every mutation runs in.
//!
//! A rotation selects a candidate, brings it up on the standby slot,
//! verifies it, cuts the rotated route over and drains the old slot. The
//! active path is never torn down before its replacement has been verified
//! and cut over to.
//!
//! Cancellation only takes effect while a candidate is being brought up or
//! verified, or while the old slot drains. Once the route replace has been
//! issued, the cycle runs on until the new slot is Active.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, watch};
use tracing::{info, warn};
use tunrot_core::config::Config;

use crate::audit;
use crate::blacklist::{BlacklistStore, unix_secs};
use crate::catalog::{Candidate, CandidateCatalog, CandidateId, CatalogError};
use crate::routing::{RoutingError, RoutingSwitch};
use crate::slot::{SlotError, SlotId, SlotPair, TunnelSlot};
use crate::status::{RotationReport, StatusSnapshot};

/// Why a rotation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    Bootstrap,
    Periodic,
    Health,
    Retry,
}

impl fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bootstrap => "bootstrap",
            Self::Periodic => "periodic",
            Self::Health => "health",
            Self::Retry => "retry",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Rotated traffic now leaves through `to`.
    Rotated {
        from: Option<CandidateId>,
        to: CandidateId,
        attempts: u32,
    },
    /// Another rotation held the lock; this request was dropped.
    Coalesced,
}

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("rotation exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error(transparent)]
    CatalogEmpty(#[from] CatalogError),

    #[error("cutover failed: {0}")]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("rotation cancelled by shutdown")]
    Cancelled,
}

impl RotationError {
    fn outcome(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "exhausted",
            Self::CatalogEmpty(_) => "catalog-empty",
            Self::Routing(_) => "routing-failed",
            Self::Slot(_) => "slot-error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Fixed parameters of a rotation cycle.
#[derive(Debug, Clone)]
pub struct RotationSettings {
    pub max_attempts: u32,
    pub verify_timeout: Duration,
    pub drain_grace: Duration,
    pub launch_failure_blacklist: Duration,
    pub failure_blacklist: Duration,
    /// The host's own unrotated egress address.
    pub host_address: IpAddr,
}

impl RotationSettings {
    pub const fn from_config(config: &Config, host_address: IpAddr) -> Self {
        Self {
            max_attempts: config.rotation.max_attempts_per_cycle,
            verify_timeout: config.tunnel.verify_timeout(),
            drain_grace: config.tunnel.drain_grace(),
            launch_failure_blacklist: config.blacklist.launch_failure_duration(),
            failure_blacklist: config.blacklist.default_duration(),
            host_address,
        }
    }
}

/// Everything a rotation mutates, owned behind the single-flight lock.
#[derive(Debug)]
struct RotationCore {
    catalog: CandidateCatalog,
    slots: SlotPair,
    routing: RoutingSwitch,
    last_rotation: Option<RotationReport>,
}

#[derive(Debug)]
pub struct RotationScheduler {
    core: Mutex<RotationCore>,
    blacklist: Arc<BlacklistStore>,
    settings: RotationSettings,
    status: watch::Sender<StatusSnapshot>,
    cancel: watch::Sender<bool>,
}

impl RotationScheduler {
    pub fn new(
        catalog: CandidateCatalog,
        slots: SlotPair,
        routing: RoutingSwitch,
        settings: RotationSettings,
    ) -> Self {
        let blacklist = Arc::clone(catalog.blacklist());
        let (status, _) = watch::channel(StatusSnapshot::default());
        let (cancel, _) = watch::channel(false);
        Self {
            core: Mutex::new(RotationCore {
                catalog,
                slots,
                routing,
                last_rotation: None,
            }),
            blacklist,
            settings,
            status,
            cancel,
        }
    }

    /// Subscribe to status snapshots. Never blocks on the rotation lock.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Latest published snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub const fn blacklist(&self) -> &Arc<BlacklistStore> {
        &self.blacklist
    }

    /// Take over the state a previous run left behind.
    ///
    /// If `previous` names an Active tunnel that is still running and still
    /// verifies, it is adopted and the route re-pointed at it; everything
    /// else on the slot interfaces is killed. Returns whether a tunnel was
    /// adopted.
    pub async fn recover(&self, previous: Option<&StatusSnapshot>) -> bool {
        let mut core = self.core.lock().await;
        let adopted = match previous {
            Some(previous) => self.adopt(&mut core, previous).await,
            None => None,
        };
        core.slots.reclaim_except(adopted).await;
        self.publish(&core).await;
        adopted.is_some()
    }

    async fn adopt(&self, core: &mut RotationCore, previous: &StatusSnapshot) -> Option<SlotId> {
        let interface = previous.active_interface.as_deref()?;
        let candidate_id = previous.active_candidate.as_ref()?;
        let id = core.slots.by_interface(interface)?;
        let Some(candidate) = core.catalog.get(candidate_id) else {
            info!(candidate = %candidate_id, "Previous candidate is no longer in the catalog");
            return None;
        };

        let slot = core.slots.get_mut(id);
        match slot
            .adopt(candidate, self.settings.verify_timeout, self.settings.host_address)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return None,
            Err(e) => {
                warn!(interface, error = %e, "Leftover tunnel failed verification");
                return None;
            }
        }
        // Re-assert the route: the previous run may have died mid-cutover.
        if let Err(e) = core.routing.cutover(interface, SystemTime::now()).await {
            warn!(interface, error = %e, "Cannot route to the leftover tunnel");
            return None;
        }
        if let Err(e) = core.slots.promote(id, SystemTime::now()) {
            warn!(interface, error = %e, "Cannot promote the leftover tunnel");
            return None;
        }
        audit::cutover(None, interface, candidate_id);
        info!(interface, candidate = %candidate_id, "Adopted the tunnel left Active by a previous run");
        Some(id)
    }

    /// Stop the running rotation, if any, at its next safe point, and refuse
    /// every later one. Bring-up, verification and draining are abandoned;
    /// a cutover that has begun completes.
    pub fn cancel_in_flight(&self) {
        self.cancel.send_replace(true);
    }

    /// Run one rotation cycle, or return [`RotationOutcome::Coalesced`] if
    /// one is already running.
    pub async fn rotate(&self, trigger: RotationTrigger) -> Result<RotationOutcome, RotationError> {
        let Ok(mut core) = self.core.try_lock() else {
            info!(%trigger, "Rotation already in progress, request coalesced");
            return Ok(RotationOutcome::Coalesced);
        };
        info!(%trigger, "Starting rotation");

        let result = self.cycle(&mut core).await;
        let report = match &result {
            Ok(RotationOutcome::Rotated { to, attempts, .. }) => RotationReport {
                trigger: trigger.to_string(),
                outcome: "rotated".into(),
                candidate: Some(to.clone()),
                attempts: *attempts,
                detail: None,
                at: unix_secs(SystemTime::now()),
            },
            Ok(RotationOutcome::Coalesced) => return Ok(RotationOutcome::Coalesced),
            Err(e) => {
                warn!(%trigger, error = %e, "Rotation failed, active path unchanged");
                RotationReport {
                    trigger: trigger.to_string(),
                    outcome: e.outcome().into(),
                    candidate: None,
                    attempts: match e {
                        RotationError::Exhausted { attempts, .. } => *attempts,
                        _ => 0,
                    },
                    detail: Some(e.to_string()),
                    at: unix_secs(SystemTime::now()),
                }
            }
        };
        core.last_rotation = Some(report);
        self.publish(&core).await;
        result
    }

    async fn cycle(&self, core: &mut RotationCore) -> Result<RotationOutcome, RotationError> {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow() {
            return Err(RotationError::Cancelled);
        }
        let active = core.slots.active_candidate().map(|c| c.id.clone());
        let standby = core.slots.standby();
        // A standby left in any state other than Idle is stale.
        core.slots.get_mut(standby).teardown_now().await;

        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts < self.settings.max_attempts {
            let candidate = match core.catalog.next_candidate(SystemTime::now(), active.as_ref()).await {
                Ok(c) => c,
                Err(e) if attempts == 0 => return Err(e.into()),
                Err(e) => {
                    last_error = format!("{last_error}; {e}");
                    break;
                }
            };
            attempts += 1;

            let slot = core.slots.get_mut(standby);
            let staged = tokio::select! {
                r = self.stage(slot, &candidate) => Some(r),
                () = cancelled(&mut cancel) => None,
            };
            let Some(staged) = staged else {
                info!(slot = %standby, candidate = %candidate.id, "Rotation cancelled before cutover");
                core.slots.get_mut(standby).teardown_now().await;
                return Err(RotationError::Cancelled);
            };
            if let Err((blacklist_for, e)) = staged {
                self.quarantine(&candidate.id, blacklist_for, &e).await;
                core.slots.get_mut(standby).teardown_now().await;
                last_error = e.to_string();
                continue;
            }

            let interface = core.slots.get(standby).interface().to_string();
            let previous = core.routing.state().active_interface.clone();
            if let Err(e) = core.routing.cutover(&interface, SystemTime::now()).await {
                // Not the candidate's fault: no blacklist entry.
                core.slots.get_mut(standby).teardown_now().await;
                return Err(e.into());
            }
            let demoted = core.slots.promote(standby, SystemTime::now())?;
            audit::cutover(previous.as_deref(), &interface, &candidate.id);
            self.publish(core).await;

            if let Some(old) = demoted {
                let slot = core.slots.get_mut(old);
                tokio::select! {
                    r = slot.drain(self.settings.drain_grace) => {
                        if let Err(e) = r {
                            warn!(slot = %old, error = %e, "Drain failed");
                        }
                    }
                    () = cancelled(&mut cancel) => {
                        info!(slot = %old, "Drain cut short by shutdown");
                    }
                }
            }
            info!(from = ?active, to = %candidate.id, attempts, "Rotation complete");
            return Ok(RotationOutcome::Rotated {
                from: active,
                to: candidate.id.clone(),
                attempts,
            });
        }

        audit::exhausted(attempts, &last_error);
        Err(RotationError::Exhausted {
            attempts,
            last_error,
        })
    }

    /// Bring `candidate` up on `slot` and verify it. A failure carries the
    /// blacklist duration it earns.
    async fn stage(
        &self,
        slot: &mut TunnelSlot,
        candidate: &Arc<Candidate>,
    ) -> Result<(), (Duration, SlotError)> {
        slot.bring_up(Arc::clone(candidate))
            .await
            .map_err(|e| (self.settings.launch_failure_blacklist, e))?;
        slot.verify(self.settings.verify_timeout, self.settings.host_address)
            .await
            .map_err(|e| (self.settings.failure_blacklist, e))?;
        Ok(())
    }

    async fn quarantine(&self, candidate: &CandidateId, duration: Duration, error: &SlotError) {
        if !error.is_candidate_failure() {
            return;
        }
        if let Err(e) = self
            .blacklist
            .blacklist(candidate, duration, error.to_string(), SystemTime::now())
            .await
        {
            warn!(candidate = %candidate, error = %e, "Failed to blacklist candidate");
        }
    }

    /// Hard-stop every slot that is not Active. Called on shutdown once the
    /// in-flight rotation has stopped; the Active tunnel and its route stay
    /// in place.
    pub async fn abandon_in_flight(&self) {
        let mut core = self.core.lock().await;
        core.slots.teardown_inactive().await;
        self.publish(&core).await;
    }

    async fn publish(&self, core: &RotationCore) {
        let now = SystemTime::now();
        let active = core.slots.active();
        let snapshot = StatusSnapshot {
            active_candidate: active.and_then(|s| s.candidate()).map(|c| c.id.clone()),
            active_interface: core.routing.state().active_interface.clone(),
            active_since: active.and_then(|s| s.active_since()).map(unix_secs),
            slots: core.slots.views(),
            blacklist: self.blacklist.snapshot(now).await,
            last_rotation: core.last_rotation.clone(),
            updated_at: unix_secs(now),
        };
        self.status.send_replace(snapshot);
    }
}

/// Resolves once cancellation has been requested.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // The sender lives in the scheduler, so this only returns on cancel.
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}
