//! Sub-protocol capabilities.
//!
//! A [`Capability`] names one sub-protocol by `(name, version)`. Both ends of a
//! connection sort their capability lists with the same total order before
//! advertising them, so each side can compute the negotiated set on its own.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A sub-protocol identity: a short name (often three letters) and a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    /// Official protocol name.
    pub name: String,
    /// Protocol version.
    pub version: u32,
}

impl Capability {
    /// Create a new capability.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl Ord for Capability {
    /// Name first (byte order), then version (numeric). Never change this:
    /// negotiation on both peers depends on it.
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .as_bytes()
            .cmp(other.name.as_bytes())
            .then(self.version.cmp(&other.version))
    }
}

impl PartialOrd for Capability {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Error returned when a `name/version` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCapabilityError {
    #[error("missing '/' separator in capability '{0}'")]
    MissingSeparator(String),
    #[error("empty protocol name in capability '{0}'")]
    EmptyName(String),
    #[error("invalid version in capability '{0}'")]
    InvalidVersion(String),
}

impl FromStr for Capability {
    type Err = ParseCapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The version never contains '/', so split on the last one.
        let (name, version) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseCapabilityError::MissingSeparator(s.to_string()))?;
        if name.is_empty() {
            return Err(ParseCapabilityError::EmptyName(s.to_string()));
        }
        let version = version
            .parse::<u32>()
            .map_err(|_| ParseCapabilityError::InvalidVersion(s.to_string()))?;
        Ok(Self::new(name, version))
    }
}

/// Sort a capability list into its canonical (advertised) form.
///
/// Exact duplicates carry no information and are dropped.
pub fn canonicalize(mut caps: Vec<Capability>) -> Vec<Capability> {
    caps.sort();
    caps.dedup();
    caps
}
