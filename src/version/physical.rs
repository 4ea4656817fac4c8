//! Physical state: the view of one node an operation maps against.
//!
//! Merges every version state registered for the node into a single
//! current view, buffers the operation's writes, and folds them into the
//! advance states once the operation is done.

use std::collections::BTreeMap;

use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::ViewId;
use crate::version::arena::StateRef;
use crate::version::set::VersioningSet;
use crate::version::state::StateContents;

#[derive(Clone, Debug)]
pub struct PhysicalState {
    pub node: NodeId,
    pub path_only: bool,
    pub dirty_mask: FieldMask,
    pub reduction_mask: FieldMask,
    pub valid_views: BTreeMap<ViewId, FieldMask>,
    pub reduction_views: BTreeMap<ViewId, FieldMask>,
    written: FieldMask,
    version_states: VersioningSet,
    advance_states: VersioningSet,
    captured: bool,
}

impl PhysicalState {
    pub fn new(node: NodeId, path_only: bool) -> PhysicalState {
        return PhysicalState {
            node,
            path_only,
            dirty_mask: FieldMask::EMPTY,
            reduction_mask: FieldMask::EMPTY,
            valid_views: BTreeMap::new(),
            reduction_views: BTreeMap::new(),
            written: FieldMask::EMPTY,
            version_states: VersioningSet::new(),
            advance_states: VersioningSet::new(),
            captured: false,
        };
    }

    pub fn add_version_state(&mut self, state: &StateRef, mask: FieldMask) {
        self.version_states.insert(state.clone(), mask);
        self.captured = false;
    }

    pub fn add_advance_state(&mut self, state: &StateRef, mask: FieldMask) {
        debug_assert!(!self.path_only);
        self.advance_states.insert(state.clone(), mask);
    }

    pub fn version_states(&self) -> &VersioningSet {
        return &self.version_states;
    }

    pub fn advance_states(&self) -> &VersioningSet {
        return &self.advance_states;
    }

    pub fn written(&self) -> FieldMask {
        return self.written;
    }

    pub fn is_captured(&self) -> bool {
        return self.captured;
    }

    /// Pull the contents of every registered version state. Path-only states
    /// contribute only their masks.
    pub fn capture_state(&mut self) {
        if self.captured {
            return;
        }
        let mut merged = StateContents::default();
        for (state, mask) in self.version_states.iter() {
            merged.merge(&state.contents(mask), mask);
        }
        self.dirty_mask |= merged.dirty_mask;
        self.reduction_mask |= merged.reduction_mask;
        if !self.path_only {
            for (view, mask) in merged.valid_views {
                *self.valid_views.entry(view).or_default() |= mask;
            }
            for (view, mask) in merged.reduction_views {
                *self.reduction_views.entry(view).or_default() |= mask;
            }
        }
        self.captured = true;
    }

    /// `view` now holds the only valid data for `mask`.
    pub fn record_write(&mut self, view: ViewId, mask: FieldMask) {
        for held in self.valid_views.values_mut() {
            *held -= mask;
        }
        self.valid_views.retain(|_, held| !held.is_empty());
        for held in self.reduction_views.values_mut() {
            *held -= mask;
        }
        self.reduction_views.retain(|_, held| !held.is_empty());
        *self.valid_views.entry(view).or_default() |= mask;
        self.dirty_mask |= mask;
        self.reduction_mask -= mask;
        self.written |= mask;
    }

    pub fn record_reduction(&mut self, view: ViewId, mask: FieldMask) {
        *self.reduction_views.entry(view).or_default() |= mask;
        self.reduction_mask |= mask;
        self.written |= mask;
    }

    pub fn contents(&self) -> StateContents {
        return StateContents {
            dirty_mask: self.dirty_mask,
            reduction_mask: self.reduction_mask,
            valid_views: self.valid_views.clone(),
            reduction_views: self.reduction_views.clone(),
        };
    }

    /// Fold the buffered updates into the advance states. With
    /// `copy_through`, every advanced field is forwarded, written or not.
    /// Returns the proxies that received their first contribution.
    pub fn apply_state(&self, copy_through: bool) -> Vec<StateRef> {
        let contents = self.contents();
        let fields = if copy_through { FieldMask::ALL } else { self.written };
        let mut notices = Vec::new();
        for (state, mask) in self.advance_states.iter() {
            let apply = mask & fields;
            if apply.is_empty() {
                continue;
            }
            if state.merge_physical_state(&contents, apply) {
                notices.push(state.clone());
            }
        }
        return notices;
    }

    /// Fields of `mask` that carry data worth capturing in a composite view.
    pub fn filter_composite_mask(&self, mask: FieldMask) -> FieldMask {
        return mask & (self.dirty_mask | self.reduction_mask);
    }

    /// A copy restricted to `mask`.
    pub fn filtered(&self, mask: FieldMask) -> PhysicalState {
        let mut out = PhysicalState::new(self.node, self.path_only);
        out.dirty_mask = self.dirty_mask & mask;
        out.reduction_mask = self.reduction_mask & mask;
        out.written = self.written & mask;
        let restrict = |views: &BTreeMap<ViewId, FieldMask>| -> BTreeMap<ViewId, FieldMask> {
            return views
                .iter()
                .map(|(view, held)| (*view, *held & mask))
                .filter(|(_, held)| !held.is_empty())
                .collect();
        };
        out.valid_views = restrict(&self.valid_views);
        out.reduction_views = restrict(&self.reduction_views);
        for (state, held) in self.version_states.entries_for(mask) {
            out.version_states.insert(state, held);
        }
        for (state, held) in self.advance_states.entries_for(mask) {
            out.advance_states.insert(state, held);
        }
        out.captured = self.captured;
        return out;
    }
}
