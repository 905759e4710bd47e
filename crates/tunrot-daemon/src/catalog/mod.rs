//! Candidate catalog: the registry of tunnel endpoints and their selection
//! order.
//!
//! The catalog is read-only after loading. Availability is derived on every
//! call from the [`BlacklistStore`] and the currently active candidate.

pub mod candidate;
pub mod selection;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{info, warn};
use tunrot_core::config::CatalogConfig;

pub use candidate::{Candidate, CandidateId};
pub use selection::{RoundRobin, SelectionPolicy, UniformRandom, policy_for};

use crate::blacklist::BlacklistStore;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Every candidate is blacklisted or active.
    #[error("no candidate available ({total} configured)")]
    CatalogEmpty { total: usize },

    #[error("no profiles matching {pattern} in {dir}")]
    NoProfiles { dir: PathBuf, pattern: String },

    #[error("failed to read profile directory {dir}: {source}")]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Registry of candidates plus the policy that orders them.
pub struct CandidateCatalog {
    candidates: Vec<Arc<Candidate>>,
    blacklist: Arc<BlacklistStore>,
    policy: Box<dyn SelectionPolicy>,
}

impl std::fmt::Debug for CandidateCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateCatalog")
            .field("candidates", &self.candidates.len())
            .finish_non_exhaustive()
    }
}

impl CandidateCatalog {
    /// Build a catalog from already-constructed candidates. Sorted by id so
    /// the rotation order is stable.
    pub fn new(
        mut candidates: Vec<Candidate>,
        blacklist: Arc<BlacklistStore>,
        policy: Box<dyn SelectionPolicy>,
    ) -> Self {
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates.dedup_by(|a, b| a.id == b.id);
        Self {
            candidates: candidates.into_iter().map(Arc::new).collect(),
            blacklist,
            policy,
        }
    }

    /// Discover candidates in the profile directory.
    pub fn load(
        config: &CatalogConfig,
        blacklist: Arc<BlacklistStore>,
        policy: Box<dyn SelectionPolicy>,
    ) -> Result<Self, CatalogError> {
        let dir = &config.profile_dir;
        let entries = std::fs::read_dir(dir).map_err(|source| CatalogError::Io {
            dir: dir.clone(),
            source,
        })?;

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CatalogError::Io {
                dir: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(c) = candidate::candidate_from_path(
                &path,
                &config.profile_prefix,
                &config.profile_suffix,
            ) {
                candidates.push(c.with_credentials(config.credentials_file.clone()));
            }
        }

        if candidates.is_empty() {
            return Err(CatalogError::NoProfiles {
                dir: dir.clone(),
                pattern: format!("{}*{}", config.profile_prefix, config.profile_suffix),
            });
        }
        if candidates.len() < 2 {
            warn!(
                count = candidates.len(),
                "Fewer than two candidates: periodic rotation will have nothing to rotate to"
            );
        }
        info!(
            count = candidates.len(),
            dir = %dir.display(),
            "Loaded candidate catalog"
        );
        Ok(Self::new(candidates, blacklist, policy))
    }

    /// Candidates that are neither blacklisted at `now` nor `active`, in
    /// catalog order.
    pub async fn list_available(
        &self,
        now: SystemTime,
        active: Option<&CandidateId>,
    ) -> Result<Vec<Arc<Candidate>>, CatalogError> {
        let mut available = Vec::with_capacity(self.candidates.len());
        for c in &self.candidates {
            if active == Some(&c.id) {
                continue;
            }
            if self.blacklist.is_blacklisted(&c.id, now).await {
                continue;
            }
            available.push(Arc::clone(c));
        }
        if available.is_empty() {
            return Err(CatalogError::CatalogEmpty {
                total: self.candidates.len(),
            });
        }
        Ok(available)
    }

    /// Pick the next rotation target with the configured policy.
    pub async fn next_candidate(
        &mut self,
        now: SystemTime,
        active: Option<&CandidateId>,
    ) -> Result<Arc<Candidate>, CatalogError> {
        let available = self.list_available(now, active).await?;
        self.policy
            .select(&available)
            .cloned()
            .ok_or(CatalogError::CatalogEmpty {
                total: self.candidates.len(),
            })
    }

    pub fn get(&self, id: &CandidateId) -> Option<Arc<Candidate>> {
        self.candidates.iter().find(|c| &c.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn blacklist(&self) -> &Arc<BlacklistStore> {
        &self.blacklist
    }
}
