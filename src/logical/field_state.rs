//! Field states: how the children of a node are currently open.
//!
//! Each logical state keeps a list of field states. A field state says, for
//! some fields, in which mode (read-only, read-write, reduce, or one of the
//! projection modes) which children are open. Incoming accesses compare
//! against every overlapping field state to decide which children must be
//! closed before the access can proceed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::logical::projection::ProjectionSummary;
use crate::logical::projection::ProjectionTree;
use crate::primitives::Color;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::ReductionOpId;
use crate::primitives::RegionTree;
use crate::primitives::RegionUsage;

/// Mode in which children are open for a set of fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpenState {
    NotOpen,
    ReadOnly,
    ReadWrite,
    /// One child open for a reduction.
    SingleReduce,
    /// Several children open for the same reduction.
    MultiReduce,
    ReadOnlyProj,
    ReadWriteProj,
    /// Write projection whose points only touch disjoint children one level
    /// down.
    ReadWriteProjDisjointShallow,
    ReduceProj,
    /// Reduce projection over data that also has pending writes.
    ReduceProjDirty,
}

impl OpenState {
    pub fn is_projection(self) -> bool {
        return matches!(
            self,
            OpenState::ReadOnlyProj
                | OpenState::ReadWriteProj
                | OpenState::ReadWriteProjDisjointShallow
                | OpenState::ReduceProj
                | OpenState::ReduceProjDirty
        );
    }

    pub fn is_reduce(self) -> bool {
        return matches!(
            self,
            OpenState::SingleReduce | OpenState::MultiReduce | OpenState::ReduceProj | OpenState::ReduceProjDirty
        );
    }

    pub fn is_read_only(self) -> bool {
        return matches!(self, OpenState::ReadOnly | OpenState::ReadOnlyProj);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldState {
    pub valid_fields: FieldMask,
    pub open_state: OpenState,
    pub redop: ReductionOpId,
    pub open_children: BTreeMap<Color, FieldMask>,
    pub projections: BTreeSet<ProjectionSummary>,
    pub rebuild_timeout: u32,
    pub disjoint_shallow: bool,
}

impl FieldState {
    /// State for `child` opened by an access with `usage`.
    pub fn new_child(usage: &RegionUsage, mask: FieldMask, child: Color, rebuild_timeout: u32) -> FieldState {
        let open_state = if usage.is_read_only() {
            OpenState::ReadOnly
        } else if usage.is_reduce() {
            OpenState::SingleReduce
        } else {
            OpenState::ReadWrite
        };
        return FieldState {
            valid_fields: mask,
            open_state,
            redop: if usage.is_reduce() { usage.redop } else { 0 },
            open_children: BTreeMap::from([(child, mask)]),
            projections: BTreeSet::new(),
            rebuild_timeout,
            disjoint_shallow: false,
        };
    }

    /// State opened by a projection access with `summary`.
    pub fn new_projection(
        usage: &RegionUsage,
        mask: FieldMask,
        summary: ProjectionSummary,
        disjoint_shallow: bool,
        dirty_reduction: bool,
        rebuild_timeout: u32,
    ) -> FieldState {
        let open_state = if usage.is_read_only() {
            OpenState::ReadOnlyProj
        } else if usage.is_reduce() {
            if dirty_reduction { OpenState::ReduceProjDirty } else { OpenState::ReduceProj }
        } else if disjoint_shallow {
            OpenState::ReadWriteProjDisjointShallow
        } else {
            OpenState::ReadWriteProj
        };
        return FieldState {
            valid_fields: mask,
            open_state,
            redop: if usage.is_reduce() { usage.redop } else { 0 },
            open_children: BTreeMap::new(),
            projections: BTreeSet::from([summary]),
            rebuild_timeout,
            disjoint_shallow,
        };
    }

    pub fn is_projection_state(&self) -> bool {
        return self.open_state.is_projection();
    }

    /// True if `rhs` can be folded into `self`.
    pub fn overlaps(&self, rhs: &FieldState) -> bool {
        if self.redop != rhs.redop {
            return false;
        }
        if self.is_projection_state() || rhs.is_projection_state() {
            return self.open_state == rhs.open_state && self.projections_match(rhs);
        }
        if self.redop != 0 {
            debug_assert!(self.open_state.is_reduce() && rhs.open_state.is_reduce());
            return true;
        }
        return self.open_state == rhs.open_state;
    }

    pub fn projections_match(&self, rhs: &FieldState) -> bool {
        return self.projections == rhs.projections;
    }

    /// Fold `rhs` into `self`. Callers check [`FieldState::overlaps`] first.
    pub fn merge(&mut self, rhs: FieldState) {
        debug_assert!(self.overlaps(&rhs));
        self.valid_fields |= rhs.valid_fields;
        for (color, mask) in rhs.open_children {
            *self.open_children.entry(color).or_default() |= mask;
        }
        self.projections.extend(rhs.projections);
        self.disjoint_shallow &= rhs.disjoint_shallow;
        if self.open_state == OpenState::SingleReduce
            && (rhs.open_state == OpenState::MultiReduce || self.open_children.len() > 1)
        {
            self.open_state = OpenState::MultiReduce;
        }
    }

    /// Remove `mask` from the state and its children.
    pub fn filter(&mut self, mask: FieldMask) {
        self.valid_fields -= mask;
        self.open_children.retain(|_, fields| {
            *fields -= mask;
            return !fields.is_empty();
        });
    }

    /// Remove `mask` from one child; the state keeps only fields some child
    /// still has open.
    pub fn filter_child(&mut self, color: Color, mask: FieldMask) {
        if let Some(fields) = self.open_children.get_mut(&color) {
            *fields -= mask;
            if fields.is_empty() {
                self.open_children.remove(&color);
            }
        }
        if !self.is_projection_state() {
            self.valid_fields = self.open_children.values().fold(FieldMask::EMPTY, |acc, m| acc | *m);
        }
    }

    pub fn record_projection_summary(&mut self, summary: ProjectionSummary) {
        self.projections.insert(summary);
    }

    /// True if an incoming projection access with `summary` needs no close
    /// of this projection state.
    pub fn can_elide_close_operation(
        &self,
        summary: &ProjectionSummary,
        usage: &RegionUsage,
        node: NodeId,
        tree: &dyn RegionTree,
    ) -> bool {
        if !self.is_projection_state() {
            return false;
        }
        if usage.is_reduce() {
            return self.open_state == OpenState::ReduceProj && self.redop == usage.redop;
        }
        if self.open_state.is_reduce() {
            return false;
        }
        return self
            .projections
            .iter()
            .all(|prior| FieldState::expensive_elide_test(prior, summary, node, tree));
    }

    /// Compare one prior projection with the incoming one by building the
    /// projection trees of both.
    pub fn expensive_elide_test(
        prior: &ProjectionSummary,
        incoming: &ProjectionSummary,
        node: NodeId,
        tree: &dyn RegionTree,
    ) -> bool {
        if prior == incoming {
            return true;
        }
        if !tree.is_disjoint_partition(node) {
            return false;
        }
        let prior_tree = ProjectionTree::build(prior, node, tree);
        let incoming_tree = ProjectionTree::build(incoming, node, tree);
        if prior_tree.disjoint(&incoming_tree) {
            return true;
        }
        return prior_tree.dominates(&incoming_tree) && prior_tree.same_shard_owners(&incoming_tree);
    }
}
