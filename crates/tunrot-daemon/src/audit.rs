//! Structured audit records for every control-plane state transition.
//!
//! Records go to the `tunrot::audit` tracing target; where they end up (file,
//! journal, collector) is decided by the subscriber configuration.

use std::time::Duration;

use tracing::{info, warn};
use tunrot_core::tracing_init::AUDIT_TARGET;

use crate::catalog::CandidateId;
use crate::slot::{SlotId, SlotState};

pub fn slot_transition(slot: SlotId, interface: &str, from: SlotState, to: SlotState) {
    info!(
        target: AUDIT_TARGET,
        event = "slot_transition",
        slot = %slot,
        interface,
        from = ?from,
        to = ?to,
    );
}

pub fn blacklisted(candidate: &CandidateId, reason: &str, duration: Duration) {
    warn!(
        target: AUDIT_TARGET,
        event = "blacklist",
        candidate = %candidate,
        reason,
        duration_secs = duration.as_secs(),
    );
}

pub fn launch_failed(slot: SlotId, candidate: &CandidateId, error: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "launch_failed",
        slot = %slot,
        candidate = %candidate,
        error,
    );
}

pub fn verification_failed(slot: SlotId, candidate: &CandidateId, error: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "verification_failed",
        slot = %slot,
        candidate = %candidate,
        error,
    );
}

pub fn cutover(from: Option<&str>, to: &str, candidate: &CandidateId) {
    info!(
        target: AUDIT_TARGET,
        event = "cutover",
        from_interface = from.unwrap_or("none"),
        to_interface = to,
        candidate = %candidate,
    );
}

pub fn drained(slot: SlotId, interface: &str) {
    info!(
        target: AUDIT_TARGET,
        event = "drained",
        slot = %slot,
        interface,
    );
}

pub fn exhausted(attempts: u32, reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "rotation_exhausted",
        attempts,
        reason,
    );
}

pub fn health_failure(candidate: &CandidateId, consecutive: u32, threshold: u32, error: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "health_failure",
        candidate = %candidate,
        consecutive,
        threshold,
        error,
    );
}
