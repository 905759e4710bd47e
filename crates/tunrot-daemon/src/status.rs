//! Read-only status surface.
//!
//! The scheduler publishes a [`StatusSnapshot`] on a `watch` channel after
//! every transition; a writer task mirrors it to a JSON file that
//! `tunrot status` reads.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::blacklist::BlacklistView;
use crate::catalog::CandidateId;
use crate::slot::SlotView;

/// Outcome of the most recent rotation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub trigger: String,
    /// `rotated`, `exhausted`, `catalog-empty` or `routing-failed`.
    pub outcome: String,
    pub candidate: Option<CandidateId>,
    pub attempts: u32,
    pub detail: Option<String>,
    /// Unix seconds.
    pub at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub active_candidate: Option<CandidateId>,
    pub active_interface: Option<String>,
    /// Unix seconds of the cutover to the active candidate.
    pub active_since: Option<u64>,
    pub slots: Vec<SlotView>,
    pub blacklist: Vec<BlacklistView>,
    pub last_rotation: Option<RotationReport>,
    pub updated_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("failed to access status file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed status file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Write `snapshot` to `path` atomically (temp file in the same directory,
/// then rename).
pub async fn write_snapshot(path: &Path, snapshot: &StatusSnapshot) -> Result<(), StatusError> {
    let io_err = |source| StatusError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(snapshot).map_err(|source| StatusError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, json).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

pub async fn read_snapshot(path: &Path) -> Result<StatusSnapshot, StatusError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| StatusError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StatusError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Mirror every published snapshot to `path` until shutdown.
pub async fn run_writer(
    path: PathBuf,
    mut snapshots: watch::Receiver<StatusSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Err(e) = write_snapshot(&path, &snapshot).await {
            warn!(error = %e, "Failed to write status file");
        } else {
            debug!(path = %path.display(), "Status file updated");
        }
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Human-readable rendering for `tunrot status`.
pub fn render(snapshot: &StatusSnapshot, now_unix: u64) -> String {
    let mut out = String::new();
    match (&snapshot.active_candidate, &snapshot.active_interface) {
        (Some(candidate), Some(interface)) => {
            let _ = write!(out, "Active:     {candidate} via {interface}");
            if let Some(since) = snapshot.active_since {
                let _ = write!(out, " (for {})", human_duration(now_unix.saturating_sub(since)));
            }
            out.push('\n');
        }
        _ => out.push_str("Active:     none\n"),
    }

    out.push_str("Slots:\n");
    for slot in &snapshot.slots {
        let candidate = slot
            .candidate
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        let _ = writeln!(
            out,
            "  {:<7} {:<6} {:<11} {candidate}",
            slot.id.to_string(),
            slot.interface,
            format!("{:?}", slot.state).to_lowercase(),
        );
    }

    if snapshot.blacklist.is_empty() {
        out.push_str("Blacklist:  empty\n");
    } else {
        out.push_str("Blacklist:\n");
        for entry in &snapshot.blacklist {
            let _ = writeln!(
                out,
                "  {:<20} {:>9} left  {}",
                entry.candidate.as_str(),
                human_duration(entry.remaining_secs),
                entry.reason
            );
        }
    }

    if let Some(last) = &snapshot.last_rotation {
        let _ = write!(
            out,
            "Last rotation: {} ({}, {} attempt(s), {} ago)",
            last.outcome,
            last.trigger,
            last.attempts,
            human_duration(now_unix.saturating_sub(last.at))
        );
        if let Some(detail) = &last.detail {
            let _ = write!(out, ": {detail}");
        }
        out.push('\n');
    }
    out
}

fn human_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
