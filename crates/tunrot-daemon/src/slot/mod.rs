//! Tunnel slots: the two fixed positions a tunnel can occupy.
//!
//! At any time at most one slot is [`SlotState::Active`] and carries rotated
//! traffic; the other is brought up, verified and cut over to during a
//! rotation. Promotion of one slot and demotion of the other happen in a
//! single [`SlotPair::promote`] call.

pub mod error;
pub mod probe;
pub mod transport;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use error::{ProbeError, SlotError, TransportError};
pub use probe::{EgressProbe, HttpEgressProbe, check_egress};
pub use transport::{OpenVpnTransport, TransportHandle, TunnelTransport};

use crate::audit;
use crate::blacklist::unix_secs;
use crate::catalog::{Candidate, CandidateId};

/// Interval between interface and probe polls while verifying.
const VERIFY_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub const ALL: [Self; 2] = [Self::A, Self::B];

    pub const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("slot-a"),
            Self::B => f.write_str("slot-b"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Idle,
    Connecting,
    Verifying,
    Active,
    Draining,
    Failed,
}

/// Slot as shown on the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub id: SlotId,
    pub interface: String,
    pub state: SlotState,
    pub candidate: Option<CandidateId>,
    /// Unix seconds at which the slot became Active.
    pub active_since: Option<u64>,
}

/// One tunnel position bound to a fixed interface.
pub struct TunnelSlot {
    id: SlotId,
    interface: String,
    state: SlotState,
    candidate: Option<Arc<Candidate>>,
    handle: Option<TransportHandle>,
    verified: bool,
    active_since: Option<SystemTime>,
    transport: Arc<dyn TunnelTransport>,
    probe: Arc<dyn EgressProbe>,
}

impl fmt::Debug for TunnelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSlot")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .field("state", &self.state)
            .field("candidate", &self.candidate.as_ref().map(|c| &c.id))
            .field("verified", &self.verified)
            .finish_non_exhaustive()
    }
}

impl TunnelSlot {
    pub fn new(
        id: SlotId,
        interface: impl Into<String>,
        transport: Arc<dyn TunnelTransport>,
        probe: Arc<dyn EgressProbe>,
    ) -> Self {
        Self {
            id,
            interface: interface.into(),
            state: SlotState::Idle,
            candidate: None,
            handle: None,
            verified: false,
            active_since: None,
            transport,
            probe,
        }
    }

    pub const fn id(&self) -> SlotId {
        self.id
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub const fn state(&self) -> SlotState {
        self.state
    }

    pub const fn candidate(&self) -> Option<&Arc<Candidate>> {
        self.candidate.as_ref()
    }

    pub const fn is_verified(&self) -> bool {
        self.verified
    }

    pub const fn active_since(&self) -> Option<SystemTime> {
        self.active_since
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            id: self.id,
            interface: self.interface.clone(),
            state: self.state,
            candidate: self.candidate.as_ref().map(|c| c.id.clone()),
            active_since: self.active_since.map(unix_secs),
        }
    }

    fn transition(&mut self, to: SlotState) {
        if self.state != to {
            audit::slot_transition(self.id, &self.interface, self.state, to);
            self.state = to;
        }
    }

    fn require(&self, state: SlotState, operation: &'static str) -> Result<(), SlotError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SlotError::InvalidState {
                slot: self.id,
                state: self.state,
                operation,
            })
        }
    }

    fn candidate_id(&self) -> CandidateId {
        self.candidate
            .as_ref()
            .map_or_else(|| CandidateId::new("<none>"), |c| c.id.clone())
    }

    /// Launch the transport for `candidate` on this slot's interface.
    /// Idle -> Connecting, or -> Failed on a launch error.
    pub async fn bring_up(&mut self, candidate: Arc<Candidate>) -> Result<(), SlotError> {
        self.require(SlotState::Idle, "bring up")?;
        self.candidate = Some(Arc::clone(&candidate));
        self.verified = false;
        self.transition(SlotState::Connecting);

        match self.transport.launch(&candidate, &self.interface).await {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                audit::launch_failed(self.id, &candidate.id, &reason);
                self.transition(SlotState::Failed);
                Err(SlotError::Launch {
                    candidate: candidate.id.clone(),
                    reason,
                })
            }
        }
    }

    /// Wait for the interface to come up, then confirm traffic through it
    /// egresses with an address other than `host_address`, all within
    /// `timeout`.
    ///
    /// On success the slot is left Verifying with the verified mark set;
    /// [`SlotPair::promote`] makes it Active.
    pub async fn verify(
        &mut self,
        timeout: Duration,
        host_address: IpAddr,
    ) -> Result<IpAddr, SlotError> {
        self.require(SlotState::Connecting, "verify")?;
        let deadline = Instant::now() + timeout;
        let mut last_error = String::from("interface never came up");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let query = self.transport.interface_address(&self.interface);
            match tokio::time::timeout(remaining, query).await {
                Ok(Ok(Some(addr))) => {
                    debug!(slot = %self.id, interface = %self.interface, %addr, "Interface up");
                    break;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = "interface query did not answer".to_string();
                    return Err(self.verification_timeout(timeout, last_error));
                }
            }
            if Instant::now() + VERIFY_POLL > deadline {
                return Err(self.verification_timeout(timeout, last_error));
            }
            tokio::time::sleep(VERIFY_POLL).await;
        }

        self.transition(SlotState::Verifying);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.verification_timeout(timeout, last_error));
            }
            match check_egress(&*self.probe, &self.interface, host_address, remaining).await {
                Ok(observed) => {
                    self.verified = true;
                    info!(
                        slot = %self.id,
                        interface = %self.interface,
                        candidate = %self.candidate_id(),
                        egress = %observed,
                        "Tunnel verified"
                    );
                    return Ok(observed);
                }
                Err(ProbeError::Mismatch(observed)) => {
                    let err = SlotError::VerificationMismatch {
                        interface: self.interface.clone(),
                        observed,
                    };
                    audit::verification_failed(self.id, &self.candidate_id(), &err.to_string());
                    self.transition(SlotState::Failed);
                    return Err(err);
                }
                Err(e) => last_error = e.to_string(),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(VERIFY_POLL.min(remaining)).await;
        }
    }

    fn verification_timeout(&mut self, after: Duration, last_error: String) -> SlotError {
        let err = SlotError::VerificationTimeout {
            interface: self.interface.clone(),
            after,
            last_error,
        };
        audit::verification_failed(self.id, &self.candidate_id(), &err.to_string());
        self.transition(SlotState::Failed);
        err
    }

    /// Take over the tunnel a previous run left running on this interface
    /// for `candidate`, then verify it as [`verify`](Self::verify) does.
    ///
    /// Returns `Ok(None)` when nothing is running there; the slot stays Idle.
    pub async fn adopt(
        &mut self,
        candidate: Arc<Candidate>,
        timeout: Duration,
        host_address: IpAddr,
    ) -> Result<Option<IpAddr>, SlotError> {
        self.require(SlotState::Idle, "adopt")?;
        let handle = match self.transport.adopt(&self.interface).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(
                    slot = %self.id,
                    interface = %self.interface,
                    error = %e,
                    "Cannot inspect leftover tunnel"
                );
                return Ok(None);
            }
        };
        info!(
            slot = %self.id,
            interface = %self.interface,
            candidate = %candidate.id,
            "Found running tunnel, verifying it"
        );
        self.candidate = Some(candidate);
        self.handle = Some(handle);
        self.verified = false;
        self.transition(SlotState::Connecting);
        self.verify(timeout, host_address).await.map(Some)
    }

    /// Let in-flight flows finish for `grace`, then stop the transport.
    /// Active/Draining -> Idle.
    pub async fn drain(&mut self, grace: Duration) -> Result<(), SlotError> {
        match self.state {
            SlotState::Active => self.transition(SlotState::Draining),
            SlotState::Draining => {}
            state => {
                return Err(SlotError::InvalidState {
                    slot: self.id,
                    state,
                    operation: "drain",
                });
            }
        }
        tokio::time::sleep(grace).await;
        self.stop(false).await;
        audit::drained(self.id, &self.interface);
        self.clear();
        Ok(())
    }

    /// Stop the transport immediately, from any state. -> Idle.
    pub async fn teardown_now(&mut self) {
        if self.state == SlotState::Idle && self.handle.is_none() {
            return;
        }
        self.stop(true).await;
        self.clear();
    }

    /// Kill whatever a previous run left on this interface. -> Idle.
    pub async fn reclaim(&mut self) {
        if let Err(e) = self.transport.clear_stale(&self.interface).await {
            warn!(slot = %self.id, interface = %self.interface, error = %e, "Failed to clear stale tunnel");
        }
        self.handle = None;
        self.clear();
    }

    async fn stop(&mut self, hard: bool) {
        let result = match self.handle.take() {
            Some(handle) => self.transport.stop(&handle, hard).await,
            // A failed launch may still have left a process behind.
            None => self.transport.clear_stale(&self.interface).await,
        };
        if let Err(e) = result {
            warn!(slot = %self.id, interface = %self.interface, error = %e, "Failed to stop tunnel");
        }
    }

    fn clear(&mut self) {
        self.candidate = None;
        self.handle = None;
        self.verified = false;
        self.active_since = None;
        self.transition(SlotState::Idle);
    }
}

/// The two slots. Owns the "at most one Active" invariant.
#[derive(Debug)]
pub struct SlotPair {
    slots: [TunnelSlot; 2],
}

impl SlotPair {
    pub fn new(
        interfaces: &[String; 2],
        transport: &Arc<dyn TunnelTransport>,
        probe: &Arc<dyn EgressProbe>,
    ) -> Self {
        let slot = |id: SlotId| {
            TunnelSlot::new(
                id,
                interfaces[id.index()].clone(),
                Arc::clone(transport),
                Arc::clone(probe),
            )
        };
        Self {
            slots: [slot(SlotId::A), slot(SlotId::B)],
        }
    }

    pub const fn get(&self, id: SlotId) -> &TunnelSlot {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut TunnelSlot {
        &mut self.slots[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TunnelSlot> {
        self.slots.iter()
    }

    pub fn active(&self) -> Option<&TunnelSlot> {
        self.slots.iter().find(|s| s.state == SlotState::Active)
    }

    pub fn active_candidate(&self) -> Option<&Arc<Candidate>> {
        self.active().and_then(TunnelSlot::candidate)
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Active)
            .count()
    }

    /// The slot a rotation brings up: the one not Active.
    pub fn standby(&self) -> SlotId {
        match self.active() {
            Some(active) => active.id.other(),
            None => SlotId::A,
        }
    }

    /// Make the verified slot `id` Active and demote the current Active slot
    /// (if any) to Draining. Returns the demoted slot.
    pub fn promote(&mut self, id: SlotId, now: SystemTime) -> Result<Option<SlotId>, SlotError> {
        let target = self.get(id);
        if target.state != SlotState::Verifying || !target.verified {
            return Err(SlotError::InvalidState {
                slot: id,
                state: target.state,
                operation: "promote unverified slot",
            });
        }

        let other = self.get_mut(id.other());
        let demoted = if other.state == SlotState::Active {
            other.transition(SlotState::Draining);
            other.active_since = None;
            Some(other.id)
        } else {
            None
        };

        let target = self.get_mut(id);
        target.transition(SlotState::Active);
        target.active_since = Some(now);
        Ok(demoted)
    }

    pub fn views(&self) -> Vec<SlotView> {
        self.slots.iter().map(TunnelSlot::view).collect()
    }

    /// Reclaim the slot interfaces at startup, except `keep`.
    pub async fn reclaim_except(&mut self, keep: Option<SlotId>) {
        for slot in &mut self.slots {
            if Some(slot.id) != keep {
                slot.reclaim().await;
            }
        }
    }

    /// The slot bound to `interface`.
    pub fn by_interface(&self, interface: &str) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|s| s.interface == interface)
            .map(|s| s.id)
    }

    /// Hard-stop every slot that is not Active. The Active tunnel is left
    /// running.
    pub async fn teardown_inactive(&mut self) {
        for slot in &mut self.slots {
            if slot.state != SlotState::Active {
                slot.teardown_now().await;
            }
        }
    }
}
