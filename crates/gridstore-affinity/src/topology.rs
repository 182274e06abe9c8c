//! Cluster membership view consumed by the router

use gridstore_common::{NodeId, TopologyEpoch};
use serde::{Deserialize, Serialize};

/// Ordered list of live nodes plus the epoch it was observed at
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyView {
    /// Version number (incremented on every membership change)
    pub epoch: TopologyEpoch,
    /// Live nodes, sorted by id
    nodes: Vec<NodeId>,
}

impl TopologyView {
    /// Create a view; nodes are sorted and deduplicated so every node
    /// derives the same ordering from the same membership.
    #[must_use]
    pub fn new(epoch: TopologyEpoch, mut nodes: Vec<NodeId>) -> Self {
        nodes.sort();
        nodes.dedup();
        Self { epoch, nodes }
    }

    /// Live nodes in canonical order
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of live nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check membership
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    /// View with a node joined (epoch bumped)
    #[must_use]
    pub fn with_node(&self, node: NodeId) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.push(node);
        Self::new(self.epoch + 1, nodes)
    }

    /// View with a node left (epoch bumped)
    #[must_use]
    pub fn without_node(&self, node: NodeId) -> Self {
        let nodes = self.nodes.iter().copied().filter(|n| *n != node).collect();
        Self::new(self.epoch + 1, nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_is_canonical() {
        let a = NodeId::new();
        let b = NodeId::new();
        let v1 = TopologyView::new(1, vec![a, b]);
        let v2 = TopologyView::new(1, vec![b, a, b]);
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 2);
    }

    #[test]
    fn test_join_and_leave_bump_epoch() {
        let a = NodeId::new();
        let b = NodeId::new();
        let view = TopologyView::new(5, vec![a]);

        let joined = view.with_node(b);
        assert_eq!(joined.epoch, 6);
        assert!(joined.contains(b));

        let left = joined.without_node(a);
        assert_eq!(left.epoch, 7);
        assert!(!left.contains(a));
        assert_eq!(left.nodes(), &[b]);
    }
}
