//! CVR version algebra.
//!
//! A CVR version is a `(stateVersion, minorVersion)` pair:
//! - `stateVersion`: a monotonically-increasing, lexicographically-sortable
//!   encoding of an upstream replication position.
//! - `minorVersion`: a fine-grained counter for config-only changes made at
//!   the same replication position. Absent is equivalent to `0`.
//!
//! Callers never compare versions across `stateVersion` bases except through
//! [`cmp_versions`], which is total-order consistent.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing a stored version string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    /// The minor-version component was not a valid integer.
    #[error("invalid minor version in {0:?}")]
    InvalidMinor(String),
    /// The version string was empty.
    #[error("empty version string")]
    Empty,
}

/// A CVR version: replication position plus config-only change counter.
///
/// Serializes to `{"stateVersion": "...", "minorVersion": n}` with the minor
/// component omitted when absent, matching the sync protocol's cookie shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvrVersion {
    /// Lexicographically-sortable upstream replication position.
    pub state_version: String,
    /// Config-only change counter at this replication position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<u64>,
}

impl CvrVersion {
    /// A version at the given state version with no minor component.
    pub fn new(state_version: impl Into<String>) -> Self {
        Self {
            state_version: state_version.into(),
            minor_version: None,
        }
    }

    /// The initial version of a freshly created CVR.
    pub fn initial() -> Self {
        Self::new("00")
    }

    /// The minor component, treating absent as `0`.
    #[must_use]
    pub fn minor(&self) -> u64 {
        self.minor_version.unwrap_or(0)
    }
}

impl PartialOrd for CvrVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CvrVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.state_version
            .cmp(&other.state_version)
            .then(self.minor().cmp(&other.minor()))
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor_version {
            Some(minor) => write!(f, "{}.{:02}", self.state_version, minor),
            None => f.write_str(&self.state_version),
        }
    }
}

impl FromStr for CvrVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VersionError::Empty);
        }
        match s.split_once('.') {
            None => Ok(Self::new(s)),
            Some((state, minor)) => {
                let minor: u64 = minor
                    .parse()
                    .map_err(|_| VersionError::InvalidMinor(s.to_string()))?;
                Ok(Self {
                    state_version: state.to_string(),
                    minor_version: Some(minor),
                })
            }
        }
    }
}

/// Compare two versions: `stateVersion` lexicographically first, then the
/// minor component with absent treated as `0`.
#[must_use]
pub fn cmp_versions(a: &CvrVersion, b: &CvrVersion) -> Ordering {
    a.cmp(b)
}

/// The smallest version strictly greater than `v` with the same
/// `stateVersion`. Used for config-only version bumps.
#[must_use]
pub fn one_after(v: &CvrVersion) -> CvrVersion {
    CvrVersion {
        state_version: v.state_version.clone(),
        minor_version: Some(v.minor().saturating_add(1)),
    }
}

/// The greater of two versions per [`cmp_versions`].
#[must_use]
pub fn max_version(a: &CvrVersion, b: &CvrVersion) -> CvrVersion {
    if cmp_versions(a, b) == Ordering::Less {
        b.clone()
    } else {
        a.clone()
    }
}
