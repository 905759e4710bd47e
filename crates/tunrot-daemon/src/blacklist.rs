//! Time-bounded exclusion of failing candidates.
//!
//! Entries expire on their own: an entry whose `expires_at` is not strictly
//! after `now` is treated as absent and purged the next time it is looked up.
//! Callers pass `now` explicitly so expiry is deterministic under test.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::audit;
use crate::catalog::CandidateId;

/// A single exclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub candidate: CandidateId,
    pub expires_at: SystemTime,
    pub reason: String,
}

/// Blacklist entry as shown on the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistView {
    pub candidate: CandidateId,
    pub reason: String,
    /// Unix seconds.
    pub expires_at: u64,
    pub remaining_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BlacklistError {
    #[error("blacklist duration for {0} must be greater than zero")]
    ZeroDuration(CandidateId),

    #[error("blacklist expiry for {0} overflows the clock")]
    Overflow(CandidateId),
}

/// Shared blacklist, written by the scheduler and the health monitor.
#[derive(Debug, Default)]
pub struct BlacklistStore {
    entries: RwLock<HashMap<CandidateId, BlacklistEntry>>,
}

impl BlacklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `candidate`, expiring at
    /// `now + duration`.
    pub async fn blacklist(
        &self,
        candidate: &CandidateId,
        duration: Duration,
        reason: impl Into<String>,
        now: SystemTime,
    ) -> Result<BlacklistEntry, BlacklistError> {
        if duration.is_zero() {
            return Err(BlacklistError::ZeroDuration(candidate.clone()));
        }
        let expires_at = now
            .checked_add(duration)
            .ok_or_else(|| BlacklistError::Overflow(candidate.clone()))?;
        let entry = BlacklistEntry {
            candidate: candidate.clone(),
            expires_at,
            reason: reason.into(),
        };

        self.entries
            .write()
            .await
            .insert(candidate.clone(), entry.clone());
        audit::blacklisted(candidate, &entry.reason, duration);
        Ok(entry)
    }

    /// True iff a live entry exists for `candidate` at `now`.
    pub async fn is_blacklisted(&self, candidate: &CandidateId, now: SystemTime) -> bool {
        {
            let entries = self.entries.read().await;
            match entries.get(candidate) {
                None => return false,
                Some(entry) if entry.expires_at > now => return true,
                Some(_) => {}
            }
        }
        // Expired: purge, re-checking under the write lock in case a fresh
        // entry was written in between.
        let mut entries = self.entries.write().await;
        if entries.get(candidate).is_some_and(|e| e.expires_at <= now) {
            entries.remove(candidate);
            debug!(candidate = %candidate, "Blacklist entry expired");
            return false;
        }
        entries.contains_key(candidate)
    }

    /// Live entries with remaining TTL, sorted by candidate. Purges expired
    /// entries.
    pub async fn snapshot(&self, now: SystemTime) -> Vec<BlacklistView> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.expires_at > now);
        let mut views: Vec<BlacklistView> = entries
            .values()
            .map(|e| BlacklistView {
                candidate: e.candidate.clone(),
                reason: e.reason.clone(),
                expires_at: unix_secs(e.expires_at),
                remaining_secs: e
                    .expires_at
                    .duration_since(now)
                    .map_or(0, |d| d.as_secs()),
            })
            .collect();
        drop(entries);
        views.sort_by(|a, b| a.candidate.cmp(&b.candidate));
        views
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Whole seconds since the Unix epoch (0 for earlier times).
pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn t0() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[tokio::test]
    async fn blacklisted_until_expiry() {
        let store = BlacklistStore::new();
        let a = CandidateId::new("a");
        store.blacklist(&a, DAY, "verification failed", t0()).await.unwrap();

        assert!(store.is_blacklisted(&a, t0()).await);
        assert!(store.is_blacklisted(&a, t0() + DAY - Duration::from_secs(1)).await);
        // expires_at > now is required, so the exact expiry instant is clear.
        assert!(!store.is_blacklisted(&a, t0() + DAY).await);
    }

    #[tokio::test]
    async fn expired_entry_is_purged_on_lookup() {
        let store = BlacklistStore::new();
        let a = CandidateId::new("a");
        store.blacklist(&a, Duration::from_secs(60), "launch", t0()).await.unwrap();
        assert_eq!(store.len().await, 1);

        assert!(!store.is_blacklisted(&a, t0() + Duration::from_secs(61)).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn rewrite_overwrites_expiry() {
        let store = BlacklistStore::new();
        let a = CandidateId::new("a");
        store.blacklist(&a, DAY, "first", t0()).await.unwrap();
        store
            .blacklist(&a, Duration::from_secs(3600), "second", t0())
            .await
            .unwrap();
        assert!(!store.is_blacklisted(&a, t0() + Duration::from_secs(3601)).await);
    }

    #[tokio::test]
    async fn zero_duration_is_rejected() {
        let store = BlacklistStore::new();
        let a = CandidateId::new("a");
        let err = store.blacklist(&a, Duration::ZERO, "x", t0()).await;
        assert!(matches!(err, Err(BlacklistError::ZeroDuration(_))));
        assert!(!store.is_blacklisted(&a, t0()).await);
    }

    #[tokio::test]
    async fn expires_strictly_after_creation() {
        let store = BlacklistStore::new();
        let entry = store
            .blacklist(&CandidateId::new("a"), Duration::from_secs(1), "x", t0())
            .await
            .unwrap();
        assert!(entry.expires_at > t0());
    }

    #[tokio::test]
    async fn snapshot_reports_remaining_ttl() {
        let store = BlacklistStore::new();
        store.blacklist(&CandidateId::new("b"), DAY, "health", t0()).await.unwrap();
        store
            .blacklist(&CandidateId::new("a"), Duration::from_secs(3600), "launch", t0())
            .await
            .unwrap();

        let view = store.snapshot(t0() + Duration::from_secs(600)).await;
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].candidate.as_str(), "a");
        assert_eq!(view[0].remaining_secs, 3000);
        assert_eq!(view[1].reason, "health");

        let later = store.snapshot(t0() + Duration::from_secs(7200)).await;
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].candidate.as_str(), "b");
    }
}
