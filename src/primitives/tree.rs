//! Region-tree navigation.
//!
//! The region tree alternates region nodes and partition nodes: a region is
//! split by any number of partitions, and each partition has one subregion
//! per color. Partitions are either disjoint (subregions never alias) or
//! aliased. The analysis only needs navigation queries, expressed by the
//! [`RegionTree`] trait; [`RegionForest`] is an in-memory implementation.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::Error;
use crate::error::Result;
use crate::primitives::id::Color;
use crate::primitives::id::NodeId;
use crate::primitives::mask::FieldMask;

/// Nodes on the path from an upper bound down to a target, inclusive.
pub type NodePath = SmallVec<[NodeId; 8]>;

/// Whether a node is a region or a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Region,
    Partition { disjoint: bool },
}

/// Navigation queries over the region tree.
pub trait RegionTree: Send + Sync {
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn child(&self, node: NodeId, color: Color) -> Option<NodeId>;

    /// Every child of `node` with its color, in color order.
    fn children(&self, node: NodeId) -> Vec<(Color, NodeId)>;

    /// Color of `node` under its parent. Roots have color 0.
    fn color(&self, node: NodeId) -> Color;

    /// Distance from the root of the node's tree.
    fn depth(&self, node: NodeId) -> u32;

    fn kind(&self, node: NodeId) -> NodeKind;

    /// True if the children of `node` with colors `a` and `b` never alias.
    fn are_children_disjoint(&self, node: NodeId, a: Color, b: Color) -> bool {
        if a == b {
            return false;
        }
        return self.is_disjoint_partition(node);
    }

    fn is_disjoint_partition(&self, node: NodeId) -> bool {
        return matches!(self.kind(node), NodeKind::Partition { disjoint: true });
    }

    fn is_partition(&self, node: NodeId) -> bool {
        return matches!(self.kind(node), NodeKind::Partition { .. });
    }

    /// Nodes from `upper` down to `target`, both included.
    fn path(&self, upper: NodeId, target: NodeId) -> Result<NodePath> {
        let mut path = NodePath::new();
        let mut node = target;
        loop {
            path.push(node);
            if node == upper {
                break;
            }
            match self.parent(node) {
                Some(parent) => node = parent,
                None => return Err(Error::InvalidPath { upper, target }),
            }
        }
        path.reverse();
        return Ok(path);
    }
}

#[derive(Clone, Debug)]
struct NodeInfo {
    parent: Option<NodeId>,
    color: Color,
    depth: u32,
    kind: NodeKind,
    children: BTreeMap<Color, NodeId>,
}

/// An in-memory region forest. Nodes may be added concurrently with
/// analysis; existing nodes never change.
#[derive(Debug, Default)]
pub struct RegionForest {
    nodes: RwLock<Vec<NodeInfo>>,
}

impl RegionForest {
    pub fn new() -> RegionForest {
        return RegionForest { nodes: RwLock::new(Vec::new()) };
    }

    /// Create the root region of a new tree.
    pub fn create_region(&self) -> NodeId {
        return self.push(None, 0, NodeKind::Region);
    }

    /// Create a partition of `region` under `color`.
    pub fn create_partition(&self, region: NodeId, color: Color, disjoint: bool) -> NodeId {
        debug_assert_eq!(self.kind(region), NodeKind::Region);
        return self.push(Some(region), color, NodeKind::Partition { disjoint });
    }

    /// Create the subregion of `partition` with `color`.
    pub fn create_subregion(&self, partition: NodeId, color: Color) -> NodeId {
        debug_assert!(self.is_partition(partition));
        return self.push(Some(partition), color, NodeKind::Region);
    }

    /// Create a partition of `region` with subregions colored `0..count`.
    pub fn create_partition_with(&self, region: NodeId, color: Color, disjoint: bool, count: u32) -> (NodeId, Vec<NodeId>) {
        let partition = self.create_partition(region, color, disjoint);
        let subregions = (0..count).map(|c| self.create_subregion(partition, c)).collect();
        return (partition, subregions);
    }

    pub fn len(&self) -> usize {
        return self.nodes.read().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    fn push(&self, parent: Option<NodeId>, color: Color, kind: NodeKind) -> NodeId {
        let mut nodes = self.nodes.write();
        let id = NodeId(nodes.len() as u32);
        let depth = match parent {
            Some(p) => {
                let info = &mut nodes[p.0 as usize];
                let previous = info.children.insert(color, id);
                debug_assert!(previous.is_none(), "color {color} reused under {p:?}");
                info.depth + 1
            }
            None => 0,
        };
        nodes.push(NodeInfo { parent, color, depth, kind, children: BTreeMap::new() });
        return id;
    }

    fn with_node<T>(&self, node: NodeId, f: impl FnOnce(&NodeInfo) -> T) -> T {
        let nodes = self.nodes.read();
        return f(&nodes[node.0 as usize]);
    }
}

impl RegionTree for RegionForest {
    fn parent(&self, node: NodeId) -> Option<NodeId> {
        return self.with_node(node, |n| n.parent);
    }

    fn child(&self, node: NodeId, color: Color) -> Option<NodeId> {
        return self.with_node(node, |n| n.children.get(&color).copied());
    }

    fn children(&self, node: NodeId) -> Vec<(Color, NodeId)> {
        return self.with_node(node, |n| n.children.iter().map(|(c, id)| (*c, *id)).collect());
    }

    fn color(&self, node: NodeId) -> Color {
        return self.with_node(node, |n| n.color);
    }

    fn depth(&self, node: NodeId) -> u32 {
        return self.with_node(node, |n| n.depth);
    }

    fn kind(&self, node: NodeId) -> NodeKind {
        return self.with_node(node, |n| n.kind);
    }
}

/// Per-depth child colors of a path through the region tree, plus fields for
/// which the path interferes with aliased siblings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionTreePath {
    min_depth: u32,
    path: Vec<Option<Color>>,
    interfering: BTreeMap<u32, FieldMask>,
}

impl RegionTreePath {
    pub fn new() -> RegionTreePath {
        return RegionTreePath::default();
    }

    /// Reset to cover depths `min..=max` with no children registered.
    pub fn initialize(&mut self, min_depth: u32, max_depth: u32) {
        debug_assert!(min_depth <= max_depth);
        self.min_depth = min_depth;
        self.path = vec![None; (max_depth - min_depth + 1) as usize];
        self.interfering.clear();
    }

    /// Build the path covering `nodes`, which must run parent to child.
    pub fn from_nodes(tree: &dyn RegionTree, nodes: &[NodeId]) -> RegionTreePath {
        let mut path = RegionTreePath::new();
        let Some(first) = nodes.first() else {
            return path;
        };
        let min = tree.depth(*first);
        path.initialize(min, min + nodes.len() as u32 - 1);
        for window in nodes.windows(2) {
            path.register_child(tree.depth(window[0]), tree.color(window[1]));
        }
        return path;
    }

    pub fn register_child(&mut self, depth: u32, color: Color) {
        let slot = self.slot(depth);
        self.path[slot] = Some(color);
    }

    pub fn record_aliased_children(&mut self, depth: u32, mask: FieldMask) {
        *self.interfering.entry(depth).or_default() |= mask;
    }

    pub fn clear(&mut self) {
        self.path.clear();
        self.interfering.clear();
    }

    pub fn has_child(&self, depth: u32) -> bool {
        return self.get_child(depth).is_some();
    }

    pub fn get_child(&self, depth: u32) -> Option<Color> {
        if depth < self.min_depth {
            return None;
        }
        return self.path.get((depth - self.min_depth) as usize).copied().flatten();
    }

    pub fn get_aliased_children(&self, depth: u32) -> Option<FieldMask> {
        return self.interfering.get(&depth).copied();
    }

    pub fn min_depth(&self) -> u32 {
        return self.min_depth;
    }

    pub fn max_depth(&self) -> u32 {
        return self.min_depth + self.path.len().saturating_sub(1) as u32;
    }

    pub fn path_length(&self) -> usize {
        return self.path.len();
    }

    fn slot(&self, depth: u32) -> usize {
        debug_assert!(depth >= self.min_depth && depth <= self.max_depth());
        return (depth - self.min_depth) as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (RegionForest, NodeId, NodeId, Vec<NodeId>) {
        let forest = RegionForest::new();
        let root = forest.create_region();
        let (part, subs) = forest.create_partition_with(root, 0, true, 4);
        return (forest, root, part, subs);
    }

    #[test]
    fn navigation() {
        let (forest, root, part, subs) = sample();
        assert_eq!(forest.parent(part), Some(root));
        assert_eq!(forest.child(part, 2), Some(subs[2]));
        assert_eq!(forest.depth(subs[3]), 2);
        assert_eq!(forest.color(subs[3]), 3);
        assert!(forest.is_disjoint_partition(part));
        assert!(forest.are_children_disjoint(part, 0, 1));
        assert!(!forest.are_children_disjoint(part, 1, 1));
        assert_eq!(forest.children(part).len(), 4);
    }

    #[test]
    fn aliased_partition_children_may_overlap() {
        let forest = RegionForest::new();
        let root = forest.create_region();
        let (part, _) = forest.create_partition_with(root, 0, false, 2);
        assert!(!forest.are_children_disjoint(part, 0, 1));
    }

    #[test]
    fn path_runs_top_down() {
        let (forest, root, part, subs) = sample();
        let path = forest.path(root, subs[1]).unwrap();
        assert_eq!(path.as_slice(), &[root, part, subs[1]]);
        assert_eq!(forest.path(subs[1], subs[1]).unwrap().as_slice(), &[subs[1]]);
        assert!(matches!(forest.path(subs[0], subs[1]), Err(Error::InvalidPath { .. })));
    }

    #[test]
    fn tree_path_colors() {
        let (forest, root, part, subs) = sample();
        let nodes = [root, part, subs[2]];
        let mut path = RegionTreePath::from_nodes(&forest, &nodes);
        assert_eq!(path.min_depth(), 0);
        assert_eq!(path.max_depth(), 2);
        assert_eq!(path.get_child(0), Some(0));
        assert_eq!(path.get_child(1), Some(2));
        assert!(!path.has_child(2));

        path.record_aliased_children(1, FieldMask::single(3));
        assert_eq!(path.get_aliased_children(1), Some(FieldMask::single(3)));
    }
}
