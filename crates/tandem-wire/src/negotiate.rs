//! Capability matching and message-code offset assignment.
//!
//! Both peers run [`match_protocols`] on their own registry and the other
//! side's advertised capabilities. Because the remote list is canonicalized
//! first and offsets are handed out in that order, both ends arrive at the
//! same table without exchanging it.

use crate::protocol::Protocol;
use std::ops::Range;
use std::sync::Arc;
use tandem_types::{canonicalize, Capability};

/// Codes `0..BASE_PROTOCOL_LENGTH` are reserved for the base protocol.
pub const BASE_PROTOCOL_LENGTH: u64 = 16;

/// A local protocol matched against the remote, with its assigned offset.
#[derive(Debug, Clone)]
pub struct MatchedProtocol {
    pub protocol: Arc<Protocol>,
    pub offset: u64,
}

impl MatchedProtocol {
    pub fn cap(&self) -> Capability {
        self.protocol.cap()
    }

    /// Global codes owned by this protocol on the connection.
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset.saturating_add(self.protocol.length)
    }
}

/// Match local protocols against the remote's capabilities.
///
/// The result is in canonical order with contiguous, disjoint code ranges
/// starting at [`BASE_PROTOCOL_LENGTH`]. When several versions of one name are
/// shared, only the highest runs. Assignment stops at the first protocol that
/// no longer fits in the `u64` code space.
pub fn match_protocols(local: &[Arc<Protocol>], remote: &[Capability]) -> Vec<MatchedProtocol> {
    let remote = canonicalize(remote.to_vec());
    let mut offset = BASE_PROTOCOL_LENGTH;
    let mut matched: Vec<MatchedProtocol> = Vec::new();

    for cap in &remote {
        let Some(proto) = local
            .iter()
            .find(|p| p.name == cap.name && p.version == cap.version)
        else {
            continue;
        };
        // Same-name caps are adjacent in canonical order, so an older version
        // of this name can only be the last entry.
        let replaces = matched.last().is_some_and(|last| last.protocol.name == proto.name);
        let start = match matched.last() {
            Some(last) if replaces => last.offset,
            _ => offset,
        };
        let Some(end) = start.checked_add(proto.length) else {
            break;
        };
        if replaces {
            matched.pop();
        }
        matched.push(MatchedProtocol {
            protocol: Arc::clone(proto),
            offset: start,
        });
        offset = end;
    }

    matched
}

/// Immutable routing table for one connection.
#[derive(Debug, Clone)]
pub struct OffsetTable {
    entries: Vec<MatchedProtocol>,
}

impl OffsetTable {
    pub fn new(entries: Vec<MatchedProtocol>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[MatchedProtocol] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the session owning a global code: `(index, code relative to its offset)`.
    pub fn route(&self, code: u64) -> Option<(usize, u64)> {
        if code < BASE_PROTOCOL_LENGTH {
            return None;
        }
        let idx = self
            .entries
            .partition_point(|m| m.range().end <= code);
        let entry = self.entries.get(idx)?;
        entry
            .range()
            .contains(&code)
            .then(|| (idx, code - entry.offset))
    }
}
