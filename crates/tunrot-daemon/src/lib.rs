//! tunrot Daemon Library
//!
//! Rotation and health control plane for a host's rotated tunnel path:
//! - Candidate catalog and time-bounded blacklist
//! - Two tunnel slots with verified bring-up and graceful drain
//! - Atomic cutover of the rotated routing table
//! - Health monitoring with blacklist-and-rotate escalation
//! - Single-flight rotation scheduler and the control loop driving it

pub mod audit;
pub mod backoff;
pub mod blacklist;
pub mod catalog;
pub mod control;
pub mod health;
pub mod routing;
pub mod scheduler;
pub mod slot;
pub mod status;
