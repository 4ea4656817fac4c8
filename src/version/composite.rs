//! Composite views: snapshots of a subtree's version states.
//!
//! When a close cannot materialize data eagerly it captures the version
//! states below the closed node instead. The root is captured at once;
//! children are pulled from the captured states' open children only when a
//! consumer asks for them.

use std::collections::BTreeMap;

use crate::logical::closer::CompositeViewSummary;
use crate::primitives::Color;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::version::arena::StateRef;
use crate::version::info::FieldVersions;
use crate::version::info::VersionTracker;
use crate::version::set::VersioningSet;
use crate::version::state::StateContents;

#[derive(Clone, Debug)]
pub struct CompositeNode {
    pub node: NodeId,
    pub mask: FieldMask,
    pub contents: StateContents,
    pub versions: FieldVersions,
    states: VersioningSet,
}

impl CompositeNode {
    pub fn new(node: NodeId) -> CompositeNode {
        return CompositeNode {
            node,
            mask: FieldMask::EMPTY,
            contents: StateContents::default(),
            versions: FieldVersions::new(),
            states: VersioningSet::new(),
        };
    }

    fn absorb(&mut self, state: &StateRef, mask: FieldMask) {
        debug_assert_eq!(state.node, self.node);
        self.mask |= mask;
        self.contents.merge(&state.contents(mask), mask);
        *self.versions.entry(state.version).or_default() |= mask;
        self.states.insert(state.clone(), mask);
    }

    pub fn states(&self) -> &VersioningSet {
        return &self.states;
    }

    /// Capture the children opened below this node, per color.
    pub fn children(&self) -> BTreeMap<Color, CompositeNode> {
        let mut out: BTreeMap<Color, CompositeNode> = BTreeMap::new();
        for (state, mask) in self.states.iter() {
            for (color, children) in state.children(mask) {
                for (child, held) in children {
                    out.entry(color).or_insert_with(|| CompositeNode::new(child.node)).absorb(&child, held);
                }
            }
        }
        return out;
    }

    pub fn child(&self, color: Color) -> Option<CompositeNode> {
        return self.children().remove(&color);
    }
}

#[derive(Clone, Debug)]
pub struct CompositeView {
    pub root: CompositeNode,
    pub summary: CompositeViewSummary,
    depth: u32,
}

impl CompositeView {
    /// Capture the `mask` portion of `states`, all versions of `node` at
    /// `depth`.
    pub fn from_states(
        node: NodeId,
        depth: u32,
        states: &VersioningSet,
        mask: FieldMask,
        summary: CompositeViewSummary,
    ) -> CompositeView {
        let mut root = CompositeNode::new(node);
        for (state, held) in states.entries_for(mask) {
            state.capture(&mut root, held);
        }
        return CompositeView { root, summary, depth };
    }

    pub fn depth(&self) -> u32 {
        return self.depth;
    }

    /// Nodes captured `depth` levels below the root's tree depth.
    pub fn nodes_at(&self, depth: u32) -> Vec<CompositeNode> {
        if depth < self.depth {
            return Vec::new();
        }
        let mut level = vec![self.root.clone()];
        for _ in self.depth..depth {
            level = level.iter().flat_map(|node| node.children().into_values()).collect();
        }
        return level;
    }
}

impl StateRef {
    /// Start a composite view rooted at this state.
    pub fn capture_root(&self, mask: FieldMask, depth: u32, summary: CompositeViewSummary) -> CompositeView {
        let mut root = CompositeNode::new(self.node);
        self.capture(&mut root, mask);
        return CompositeView { root, summary, depth };
    }

    /// Add this state's `mask` portion to a composite node.
    pub fn capture(&self, target: &mut CompositeNode, mask: FieldMask) {
        target.absorb(self, mask);
    }
}

impl VersionTracker for CompositeView {
    fn is_upper_bound_node(&self, node: NodeId) -> bool {
        return self.root.node == node;
    }

    fn get_field_versions(&self, depth: u32, _split_prev: bool, needed: FieldMask, out: &mut FieldVersions) {
        for node in self.nodes_at(depth) {
            for (version, mask) in &node.versions {
                let overlap = *mask & needed;
                if !overlap.is_empty() {
                    *out.entry(*version).or_default() |= overlap;
                }
            }
        }
    }

    fn get_advance_versions(&self, _depth: u32, _needed: FieldMask, _out: &mut FieldVersions) {}

    fn get_split_mask(&self, _depth: u32, _needed: FieldMask) -> FieldMask {
        return FieldMask::EMPTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::AddressSpace;
    use crate::primitives::ViewId;
    use crate::version::arena::VersionStateArena;

    fn mask(fields: &[u32]) -> FieldMask {
        return FieldMask::from_fields(fields);
    }

    #[test]
    fn children_are_pulled_lazily() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let root = arena.create(2, NodeId(0));
        let left = arena.create(1, NodeId(1));
        let right = arena.create(3, NodeId(2));
        let mut contents = StateContents { dirty_mask: mask(&[0]), ..StateContents::default() };
        contents.valid_views.insert(ViewId(4), mask(&[0]));
        left.merge_physical_state(&contents, mask(&[0]));

        let mut opened = VersioningSet::new();
        opened.insert(left.clone(), mask(&[0, 1]));
        root.reduce_open_children(0, mask(&[0, 1]), &opened);
        let mut opened = VersioningSet::new();
        opened.insert(right.clone(), mask(&[1]));
        root.reduce_open_children(1, mask(&[1]), &opened);

        let view = root.capture_root(mask(&[0]), 0, CompositeViewSummary::default());
        assert!(view.is_upper_bound_node(NodeId(0)));
        let children = view.root.children();
        assert_eq!(children.len(), 1);
        let left_node = &children[&0];
        assert_eq!(left_node.node, NodeId(1));
        assert_eq!(left_node.contents.dirty_mask, mask(&[0]));

        let mut versions = FieldVersions::new();
        view.get_field_versions(1, false, FieldMask::ALL, &mut versions);
        assert_eq!(versions.get(&1), Some(&mask(&[0])));
        assert!(view.get_split_mask(0, FieldMask::ALL).is_empty());
    }

    #[test]
    fn from_states_merges_versions() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let a = arena.create(1, NodeId(5));
        let b = arena.create(2, NodeId(5));
        let mut set = VersioningSet::new();
        set.insert(a.clone(), mask(&[0]));
        set.insert(b.clone(), mask(&[1]));
        let view = CompositeView::from_states(NodeId(5), 2, &set, mask(&[0, 1]), CompositeViewSummary::default());
        assert_eq!(view.root.mask, mask(&[0, 1]));
        assert_eq!(view.root.versions.len(), 2);
        assert!(view.nodes_at(1).is_empty());
        assert_eq!(view.nodes_at(2).len(), 1);
    }
}
