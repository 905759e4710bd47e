//! Pluggable candidate selection.
//!
//! The catalog hands a policy the available candidates in stable catalog
//! order; the policy picks one. The default round-robin policy guarantees
//! every candidate that stays available is picked within `n` selections.

use std::sync::Arc;

use rand::RngExt;
use tunrot_core::config::SelectionMode;

use super::candidate::{Candidate, CandidateId};

/// Picks the next rotation target among available candidates.
pub trait SelectionPolicy: Send + Sync {
    /// `available` is non-empty and sorted by candidate id.
    fn select<'a>(&mut self, available: &'a [Arc<Candidate>]) -> Option<&'a Arc<Candidate>>;
}

/// Cursor over the catalog order: the next candidate after the last one
/// picked, wrapping around.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<CandidateId>,
}

impl SelectionPolicy for RoundRobin {
    fn select<'a>(&mut self, available: &'a [Arc<Candidate>]) -> Option<&'a Arc<Candidate>> {
        let picked = match &self.last {
            Some(last) => available
                .iter()
                .find(|c| c.id > *last)
                .or_else(|| available.first()),
            None => available.first(),
        }?;
        self.last = Some(picked.id.clone());
        Some(picked)
    }
}

/// Uniform random choice.
#[derive(Debug, Default)]
pub struct UniformRandom;

impl SelectionPolicy for UniformRandom {
    fn select<'a>(&mut self, available: &'a [Arc<Candidate>]) -> Option<&'a Arc<Candidate>> {
        if available.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..available.len());
        available.get(idx)
    }
}

/// Build the configured policy.
pub fn policy_for(mode: SelectionMode) -> Box<dyn SelectionPolicy> {
    match mode {
        SelectionMode::RoundRobin => Box::new(RoundRobin::default()),
        SelectionMode::Random => Box::new(UniformRandom),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn candidates(ids: &[&str]) -> Vec<Arc<Candidate>> {
        ids.iter()
            .map(|id| Arc::new(Candidate::new(*id, *id, PathBuf::from(format!("{id}.conf")))))
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_catalog_order() {
        let all = candidates(&["a", "b", "c"]);
        let mut rr = RoundRobin::default();
        let picks: Vec<_> = (0..4)
            .map(|_| rr.select(&all).unwrap().id.as_str().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a"]);
    }

    #[test]
    fn round_robin_skips_unavailable_without_starving() {
        let mut rr = RoundRobin::default();
        // Active candidate is excluded from each call, as the catalog does.
        let first = rr.select(&candidates(&["a", "b", "c", "d"])).unwrap().id.clone();
        assert_eq!(first.as_str(), "a");
        let second = rr.select(&candidates(&["b", "c", "d"])).unwrap().id.clone();
        assert_eq!(second.as_str(), "b");
        let third = rr.select(&candidates(&["a", "c", "d"])).unwrap().id.clone();
        assert_eq!(third.as_str(), "c");
        let fourth = rr.select(&candidates(&["a", "b", "d"])).unwrap().id.clone();
        assert_eq!(fourth.as_str(), "d");
    }

    #[test]
    fn round_robin_visits_every_candidate_within_n() {
        let all = candidates(&["a", "b", "c", "d", "e"]);
        let mut rr = RoundRobin::default();
        let seen: HashSet<_> = (0..all.len())
            .map(|_| rr.select(&all).unwrap().id.clone())
            .collect();
        assert_eq!(seen.len(), all.len());
    }

    #[test]
    fn random_picks_from_available() {
        let all = candidates(&["a", "b"]);
        let mut policy = UniformRandom;
        for _ in 0..20 {
            let picked = policy.select(&all).unwrap();
            assert!(all.contains(picked));
        }
        assert!(policy.select(&[]).is_none());
    }
}
