//! Candidate identity and profile discovery.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Stable identifier of a candidate, e.g. `mullvad_se`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One configured remote tunnel endpoint. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: CandidateId,
    /// Location code taken from the profile file name (e.g. `se`).
    pub location: String,
    /// Connection profile passed to the transport.
    pub profile: PathBuf,
    /// Shared credentials file, if the profiles need one.
    pub credentials: Option<PathBuf>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, location: impl Into<String>, profile: PathBuf) -> Self {
        Self {
            id: CandidateId::new(id),
            location: location.into(),
            profile,
            credentials: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Option<PathBuf>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Match `<prefix><location><suffix>` and build a candidate from it.
///
/// The id is the prefix without trailing separators, joined to the location
/// with `_` (`mullvad_` + `se` -> `mullvad_se`).
pub(crate) fn candidate_from_path(path: &Path, prefix: &str, suffix: &str) -> Option<Candidate> {
    let name = path.file_name()?.to_str()?;
    let location = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if location.is_empty() {
        return None;
    }
    let stem = prefix.trim_end_matches(['_', '-', '.']);
    let id = if stem.is_empty() {
        location.to_string()
    } else {
        format!("{stem}_{location}")
    };
    Some(Candidate::new(id, location, path.to_path_buf()))
}
