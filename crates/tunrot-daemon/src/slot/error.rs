//! Tunnel slot error types.

use std::net::IpAddr;
use std::time::Duration;

use crate::catalog::CandidateId;

use super::{SlotId, SlotState};

/// Errors from one slot's lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    /// The transport could not start. Not retried for this attempt.
    #[error("failed to launch tunnel for {candidate}: {reason}")]
    Launch {
        candidate: CandidateId,
        reason: String,
    },

    /// The tunnel did not come up and carry traffic within the deadline.
    #[error("tunnel on {interface} not verified within {after:?}: {last_error}")]
    VerificationTimeout {
        interface: String,
        after: Duration,
        last_error: String,
    },

    /// The tunnel is up but traffic still leaves with the host's own address.
    #[error("tunnel on {interface} egresses as {observed}, the host's own address")]
    VerificationMismatch { interface: String, observed: IpAddr },

    #[error("{slot} cannot {operation} while {state:?}")]
    InvalidState {
        slot: SlotId,
        state: SlotState,
        operation: &'static str,
    },
}

impl SlotError {
    /// Whether the failure is attributable to the candidate (and so warrants
    /// a blacklist entry).
    pub const fn is_candidate_failure(&self) -> bool {
        !matches!(self, Self::InvalidState { .. })
    }
}

/// Errors from the external transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("tunnel binary {0} not found")]
    BinaryNotFound(String),

    #[error("tunnel transport exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("failed to signal tunnel process {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from one egress probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("all probe endpoints failed: {0}")]
    Unreachable(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("egress address {0} is the host's own address")]
    Mismatch(IpAddr),
}
