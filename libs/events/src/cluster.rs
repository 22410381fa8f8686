//! Token space and cluster membership records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::EventError;

/// Default number of tokens in the partition space.
pub const DEFAULT_TOKEN_SPACE: u32 = 100;

/// The fixed, contiguous token space `[0, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSpace {
    size: u32,
}

impl TokenSpace {
    /// Creates a token space. A size of zero is bumped to one so that every
    /// routing key still maps to a token.
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn full_range(&self) -> TokenRange {
        TokenRange {
            start: 0,
            end: self.size,
        }
    }

    pub fn contains(&self, token: u32) -> bool {
        token < self.size
    }

    /// Maps a routing key onto a token.
    ///
    /// Uses the first eight bytes of the key's SHA-256 digest so the mapping is
    /// identical on every node and across releases.
    pub fn token_for(&self, routing_key: &str) -> u32 {
        let digest = Sha256::digest(routing_key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % u64::from(self.size)) as u32
    }

    /// Splits the space into contiguous ranges, one per node, in sorted
    /// node-id order. The first `size % n` nodes get one extra token.
    ///
    /// Returns an empty assignment when there are no nodes; with more nodes
    /// than tokens the surplus nodes are left without a range.
    pub fn assign_even(&self, node_ids: &[String]) -> Vec<(String, TokenRange)> {
        let mut ids: Vec<&String> = node_ids.iter().collect();
        ids.sort();
        ids.dedup();

        let count = ids.len().min(self.size as usize) as u32;
        if count == 0 {
            return Vec::new();
        }

        let base = self.size / count;
        let extra = self.size % count;
        let mut start = 0;
        ids.into_iter()
            .take(count as usize)
            .enumerate()
            .map(|(i, id)| {
                let len = base + u32::from((i as u32) < extra);
                let range = TokenRange {
                    start,
                    end: start + len,
                };
                start += len;
                (id.clone(), range)
            })
            .collect()
    }
}

impl Default for TokenSpace {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_SPACE)
    }
}

/// Half-open interval `[start, end)` of tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: u32,
    pub end: u32,
}

impl TokenRange {
    pub fn new(start: u32, end: u32) -> Result<Self, EventError> {
        if start >= end {
            return Err(EventError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, token: u32) -> bool {
        self.start <= token && token < self.end
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &TokenRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for TokenRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A gateway node and the token range it currently owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    /// Base URL other nodes use to reach this node.
    pub url: String,
    pub range: TokenRange,
}
