//! Token partitioning of the event space across gateway nodes.
//!
//! Every event carries a token in `[0, N)`. The membership view says which
//! node owns which contiguous range of tokens; the owner is the only node
//! that executes an event's action. Views are published as immutable
//! snapshots and swapped atomically, so a dispatch attempt reads one
//! consistent view for its whole duration.

mod refresher;
mod source;

pub use refresher::MembershipRefresher;
pub use source::{HttpMembershipSource, MembershipSource, StaticMembership};

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use sgw_events::{ClusterNode, TokenRange, TokenSpace};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PartitionError {
    /// No node in the current view owns the token.
    #[error("no node owns token {token}")]
    UnknownNode { token: u32 },

    #[error("token {token} is outside the token space of size {size}")]
    TokenOutOfRange { token: u32, size: u32 },

    #[error("node {0} is not part of the membership view")]
    NodeNotFound(String),

    /// The view breaks a membership invariant and was not applied.
    #[error("invalid membership view: {0}")]
    InvalidView(String),

    /// The membership source could not be reached or returned garbage.
    #[error("membership source failed: {0}")]
    Source(String),
}

/// The node that owns a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub node_id: String,
    pub url: String,
    pub is_local: bool,
}

/// A versioned assignment of token ranges to nodes.
///
/// Nodes are kept sorted by range start. Ranges never overlap and always fit
/// the token space; gaps are allowed while membership is converging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipView {
    pub version: u64,
    pub space: TokenSpace,
    nodes: Vec<ClusterNode>,
}

impl MembershipView {
    pub fn new(
        version: u64,
        space: TokenSpace,
        mut nodes: Vec<ClusterNode>,
    ) -> Result<Self, PartitionError> {
        nodes.sort_by_key(|n| n.range.start);

        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(PartitionError::InvalidView(format!(
                    "node {} appears more than once",
                    node.node_id
                )));
            }
            if node.range.is_empty() || node.range.end > space.size() {
                return Err(PartitionError::InvalidView(format!(
                    "range {} of node {} does not fit token space {}",
                    node.range,
                    node.node_id,
                    space.size()
                )));
            }
        }
        for pair in nodes.windows(2) {
            if pair[0].range.overlaps(&pair[1].range) {
                return Err(PartitionError::InvalidView(format!(
                    "ranges of {} and {} overlap",
                    pair[0].node_id, pair[1].node_id
                )));
            }
        }

        Ok(Self { version, space, nodes })
    }

    /// A view with no owners at all. Every lookup fails until a real view
    /// is applied.
    pub fn empty(space: TokenSpace) -> Self {
        Self {
            version: 0,
            space,
            nodes: Vec::new(),
        }
    }

    /// A view where one node owns the whole space.
    pub fn single_node(version: u64, space: TokenSpace, node_id: &str, url: &str) -> Self {
        Self {
            version,
            space,
            nodes: vec![ClusterNode {
                node_id: node_id.to_string(),
                url: url.to_string(),
                range: space.full_range(),
            }],
        }
    }

    /// Splits the space evenly over `members` (`(node_id, url)` pairs).
    pub fn even(
        version: u64,
        space: TokenSpace,
        members: &[(String, String)],
    ) -> Result<Self, PartitionError> {
        let ids: Vec<String> = members.iter().map(|(id, _)| id.clone()).collect();
        let nodes = space
            .assign_even(&ids)
            .into_iter()
            .map(|(node_id, range)| {
                let url = members
                    .iter()
                    .find(|(id, _)| *id == node_id)
                    .map(|(_, url)| url.clone())
                    .unwrap_or_default();
                ClusterNode { node_id, url, range }
            })
            .collect();
        Self::new(version, space, nodes)
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn node(&self, node_id: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Looks up the owner of `token` by binary search over range starts.
    pub fn owner_of(&self, token: u32) -> Result<&ClusterNode, PartitionError> {
        if !self.space.contains(token) {
            return Err(PartitionError::TokenOutOfRange {
                token,
                size: self.space.size(),
            });
        }
        let idx = self.nodes.partition_point(|n| n.range.start <= token);
        idx.checked_sub(1)
            .map(|i| &self.nodes[i])
            .filter(|n| n.range.contains(token))
            .ok_or(PartitionError::UnknownNode { token })
    }

    /// Token ranges nobody owns.
    pub fn gaps(&self) -> Vec<TokenRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for node in &self.nodes {
            if node.range.start > cursor {
                gaps.push(TokenRange {
                    start: cursor,
                    end: node.range.start,
                });
            }
            cursor = node.range.end;
        }
        if cursor < self.space.size() {
            gaps.push(TokenRange {
                start: cursor,
                end: self.space.size(),
            });
        }
        gaps
    }

    pub fn is_complete(&self) -> bool {
        self.gaps().is_empty()
    }
}

/// Answers "who owns this token" for the local node.
pub struct TokenPartitioner {
    local_node_id: String,
    view: ArcSwap<MembershipView>,
}

impl TokenPartitioner {
    pub fn new(local_node_id: impl Into<String>, initial: MembershipView) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            view: ArcSwap::from_pointee(initial),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// The current view. Callers hold it for the duration of one operation.
    pub fn view(&self) -> Arc<MembershipView> {
        self.view.load_full()
    }

    pub fn space(&self) -> TokenSpace {
        self.view.load().space
    }

    /// Publishes a newer view. Views that are not newer than the current one
    /// are ignored and reported as `false`.
    pub fn apply(&self, next: MembershipView) -> Result<bool, PartitionError> {
        let current = self.view.load();
        if next.space != current.space {
            return Err(PartitionError::InvalidView(format!(
                "token space changed from {} to {}",
                current.space.size(),
                next.space.size()
            )));
        }
        if next.version <= current.version {
            return Ok(false);
        }

        let gaps = next.gaps();
        if !gaps.is_empty() {
            warn!(version = next.version, gaps = ?gaps, "Membership view leaves tokens unowned");
        }
        let local_range = next.node(&self.local_node_id).map(|n| n.range);
        info!(
            version = next.version,
            nodes = next.nodes.len(),
            local_range = ?local_range,
            "Applied membership view"
        );

        self.view.store(Arc::new(next));
        Ok(true)
    }

    pub fn owner_of(&self, token: u32) -> Result<Owner, PartitionError> {
        let view = self.view.load();
        let node = view.owner_of(token)?;
        Ok(Owner {
            node_id: node.node_id.clone(),
            url: node.url.clone(),
            is_local: node.node_id == self.local_node_id,
        })
    }

    pub fn owns(&self, token: u32) -> bool {
        self.owner_of(token).is_ok_and(|owner| owner.is_local)
    }

    pub fn local_range(&self) -> Option<TokenRange> {
        self.view.load().node(&self.local_node_id).map(|n| n.range)
    }

    pub fn resolve_url(&self, node_id: &str) -> Result<String, PartitionError> {
        self.view
            .load()
            .node(node_id)
            .map(|n| n.url.clone())
            .ok_or_else(|| PartitionError::NodeNotFound(node_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn node(id: &str, start: u32, end: u32) -> ClusterNode {
        ClusterNode {
            node_id: id.to_string(),
            url: format!("http://{id}:4122"),
            range: TokenRange { start, end },
        }
    }

    fn space() -> TokenSpace {
        TokenSpace::new(100)
    }

    #[rstest]
    #[case(0, "a")]
    #[case(49, "a")]
    #[case(50, "b")]
    #[case(99, "b")]
    fn owner_lookup(#[case] token: u32, #[case] expected: &str) {
        let view =
            MembershipView::new(1, space(), vec![node("b", 50, 100), node("a", 0, 50)]).unwrap();
        assert_eq!(view.owner_of(token).unwrap().node_id, expected);
    }

    #[test]
    fn gap_resolves_to_unknown_node() {
        let view =
            MembershipView::new(1, space(), vec![node("a", 0, 40), node("b", 60, 100)]).unwrap();
        assert!(matches!(view.owner_of(50), Err(PartitionError::UnknownNode { token: 50 })));
        assert_eq!(view.gaps(), vec![TokenRange { start: 40, end: 60 }]);
        assert!(!view.is_complete());
    }

    #[test]
    fn out_of_range_token_is_rejected() {
        let view = MembershipView::single_node(1, space(), "a", "http://a");
        assert!(matches!(
            view.owner_of(100),
            Err(PartitionError::TokenOutOfRange { token: 100, size: 100 })
        ));
    }

    #[rstest]
    #[case(vec![node("a", 0, 60), node("b", 50, 100)])]
    #[case(vec![node("a", 0, 50), node("a", 50, 100)])]
    #[case(vec![node("a", 0, 101)])]
    fn invalid_views_are_rejected(#[case] nodes: Vec<ClusterNode>) {
        assert!(matches!(
            MembershipView::new(1, space(), nodes),
            Err(PartitionError::InvalidView(_))
        ));
    }

    #[test]
    fn apply_ignores_stale_versions() {
        let view = MembershipView::single_node(2, space(), "a", "http://a");
        let partitioner = TokenPartitioner::new("a", view);
        assert!(partitioner.owns(10));

        let stale = MembershipView::single_node(1, space(), "b", "http://b");
        assert!(!partitioner.apply(stale).unwrap());
        assert!(partitioner.owns(10));

        let newer =
            MembershipView::new(3, space(), vec![node("a", 0, 50), node("b", 50, 100)]).unwrap();
        assert!(partitioner.apply(newer).unwrap());
        assert!(partitioner.owns(10));
        assert!(!partitioner.owns(75));
        assert_eq!(partitioner.local_range(), Some(TokenRange { start: 0, end: 50 }));
        assert_eq!(partitioner.resolve_url("b").unwrap(), "http://b:4122");
        assert!(matches!(
            partitioner.resolve_url("zz"),
            Err(PartitionError::NodeNotFound(_))
        ));
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let view = MembershipView::single_node(1, space(), "a", "http://a");
        let partitioner = TokenPartitioner::new("a", view);
        let held = partitioner.view();
        partitioner
            .apply(MembershipView::single_node(2, space(), "b", "http://b"))
            .unwrap();
        assert_eq!(held.owner_of(5).unwrap().node_id, "a");
        assert_eq!(partitioner.owner_of(5).unwrap().node_id, "b");
    }

    #[test]
    fn even_view_covers_space() {
        let members = vec![
            ("b".to_string(), "http://b".to_string()),
            ("a".to_string(), "http://a".to_string()),
            ("c".to_string(), "http://c".to_string()),
        ];
        let view = MembershipView::even(1, space(), &members).unwrap();
        assert!(view.is_complete());
        assert_eq!(view.nodes()[0].node_id, "a");
        assert_eq!(view.node("c").unwrap().url, "http://c");
    }

    #[test]
    fn changing_token_space_is_refused() {
        let partitioner = TokenPartitioner::new("a", MembershipView::empty(space()));
        let other = MembershipView::single_node(5, TokenSpace::new(10), "a", "http://a");
        assert!(partitioner.apply(other).is_err());
    }
}
