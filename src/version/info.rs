//! Version info: the versions one region requirement saw.
//!
//! One slot per region-tree depth from the requirement's upper-bound node
//! down to its target. Each slot holds the physical state of the node at
//! that depth, the version numbers read per field, and the split mask of
//! fields whose current versions come from the previous map because the
//! same logical context already advanced them.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::message::StateEntry;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::VersionId;
use crate::version::arena::StateRef;
use crate::version::arena::VersionStateArena;
use crate::version::physical::PhysicalState;
use crate::version::set::VersioningSet;
use crate::wire;

pub type FieldVersions = BTreeMap<VersionId, FieldMask>;

/// Read access to the versions some analysis result recorded.
pub trait VersionTracker {
    fn is_upper_bound_node(&self, node: NodeId) -> bool;

    /// Versions of `needed` read at `depth`. Split fields report the
    /// previous version when `split_prev`, otherwise the one that replaced it.
    fn get_field_versions(&self, depth: u32, split_prev: bool, needed: FieldMask, out: &mut FieldVersions);

    fn get_advance_versions(&self, depth: u32, needed: FieldMask, out: &mut FieldVersions);

    fn get_split_mask(&self, depth: u32, needed: FieldMask) -> FieldMask;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelPayload {
    pub node: Option<NodeId>,
    pub path_only: bool,
    pub split_mask: FieldMask,
    pub field_versions: Vec<(VersionId, FieldMask)>,
    pub current: Vec<StateEntry>,
    pub advance: Vec<StateEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfoPayload {
    pub upper_bound: Option<NodeId>,
    pub base_depth: u32,
    pub levels: Vec<LevelPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionNumbersPayload {
    pub upper_bound: Option<NodeId>,
    pub base_depth: u32,
    pub levels: Vec<(FieldMask, Vec<(VersionId, FieldMask)>)>,
}

fn describe(set: &VersioningSet) -> Vec<StateEntry> {
    return set.iter().map(|(state, mask)| StateEntry { state: state.descriptor(), mask }).collect();
}

#[derive(Clone, Debug, Default)]
pub struct VersionInfo {
    upper_bound: Option<NodeId>,
    base_depth: u32,
    physical_states: Vec<Option<PhysicalState>>,
    field_versions: Vec<FieldVersions>,
    split_masks: Vec<FieldMask>,
}

impl VersionInfo {
    pub fn new() -> VersionInfo {
        return VersionInfo::default();
    }

    pub fn set_upper_bound_node(&mut self, node: NodeId, depth: u32) {
        debug_assert!(self.physical_states.is_empty() || self.base_depth == depth);
        self.upper_bound = Some(node);
        self.base_depth = depth;
    }

    pub fn upper_bound_node(&self) -> Option<NodeId> {
        return self.upper_bound;
    }

    pub fn base_depth(&self) -> u32 {
        return self.base_depth;
    }

    /// Deepest depth with a slot, if any.
    pub fn max_depth(&self) -> Option<u32> {
        return self.physical_states.len().checked_sub(1).map(|d| self.base_depth + d as u32);
    }

    /// Make room for every depth up to `max_depth`.
    pub fn resize(&mut self, max_depth: u32) {
        debug_assert!(max_depth >= self.base_depth);
        let levels = (max_depth - self.base_depth + 1) as usize;
        if self.physical_states.len() < levels {
            self.physical_states.resize_with(levels, || None);
            self.field_versions.resize_with(levels, FieldVersions::new);
            self.split_masks.resize(levels, FieldMask::EMPTY);
        }
    }

    fn slot(&self, depth: u32) -> Option<usize> {
        let slot = depth.checked_sub(self.base_depth)? as usize;
        return (slot < self.physical_states.len()).then_some(slot);
    }

    fn slot_mut(&mut self, depth: u32) -> usize {
        self.resize(depth);
        return (depth - self.base_depth) as usize;
    }

    pub fn record_split_fields(&mut self, depth: u32, mask: FieldMask) {
        let slot = self.slot_mut(depth);
        self.split_masks[slot] |= mask;
    }

    pub fn split_mask(&self, depth: u32) -> FieldMask {
        return self.slot(depth).map_or(FieldMask::EMPTY, |slot| self.split_masks[slot]);
    }

    pub fn add_current_version(&mut self, node: NodeId, depth: u32, state: &StateRef, mask: FieldMask, path_only: bool) {
        let slot = self.slot_mut(depth);
        let phys = self.physical_states[slot].get_or_insert_with(|| PhysicalState::new(node, path_only));
        debug_assert_eq!(phys.node, node);
        phys.add_version_state(state, mask);
        *self.field_versions[slot].entry(state.version).or_default() |= mask;
    }

    pub fn add_advance_version(&mut self, node: NodeId, depth: u32, state: &StateRef, mask: FieldMask) {
        let slot = self.slot_mut(depth);
        let phys = self.physical_states[slot].get_or_insert_with(|| PhysicalState::new(node, false));
        phys.add_advance_state(state, mask);
    }

    pub fn physical_state(&self, depth: u32) -> Option<&PhysicalState> {
        return self.slot(depth).and_then(|slot| self.physical_states[slot].as_ref());
    }

    pub fn physical_state_mut(&mut self, depth: u32) -> Option<&mut PhysicalState> {
        let slot = self.slot(depth)?;
        return self.physical_states[slot].as_mut();
    }

    pub fn find_physical_state(&mut self, node: NodeId) -> Option<&mut PhysicalState> {
        return self.physical_states.iter_mut().flatten().find(|phys| phys.node == node);
    }

    pub fn field_versions(&self, depth: u32) -> FieldVersions {
        return self.slot(depth).map(|slot| self.field_versions[slot].clone()).unwrap_or_default();
    }

    /// Every version state the info reads, with the depth it sits at.
    pub fn version_states(&self) -> Vec<(u32, StateRef, FieldMask)> {
        let mut out = Vec::new();
        for (slot, phys) in self.physical_states.iter().enumerate() {
            let Some(phys) = phys else {
                continue;
            };
            for (state, mask) in phys.version_states().iter() {
                out.push((self.base_depth + slot as u32, state.clone(), mask));
            }
        }
        return out;
    }

    pub fn capture_physical_states(&mut self) {
        for phys in self.physical_states.iter_mut().flatten() {
            phys.capture_state();
        }
    }

    /// Fold every physical state's buffered updates into its advance states.
    /// Returns the proxies that received their first contribution.
    pub fn apply_mapping(&self, copy_through: bool) -> Vec<StateRef> {
        let mut notices = Vec::new();
        for phys in self.physical_states.iter().flatten() {
            if phys.path_only || phys.advance_states().is_empty() {
                continue;
            }
            notices.extend(phys.apply_state(copy_through));
        }
        return notices;
    }

    pub fn clear(&mut self) {
        *self = VersionInfo::default();
    }

    /// The logical part (upper bound, field versions, split masks) without
    /// any physical state.
    pub fn clone_logical(&self) -> VersionInfo {
        return VersionInfo {
            upper_bound: self.upper_bound,
            base_depth: self.base_depth,
            physical_states: vec![None; self.physical_states.len()],
            field_versions: self.field_versions.clone(),
            split_masks: self.split_masks.clone(),
        };
    }

    pub fn copy_to(&self, target: &mut VersionInfo) {
        *target = self.clone();
    }

    /// Copy depths up to `depth`, restricted to `mask`, into `target`.
    pub fn clone_to_depth(&self, depth: u32, mask: FieldMask, target: &mut VersionInfo) {
        target.clear();
        target.upper_bound = self.upper_bound;
        target.base_depth = self.base_depth;
        let Some(last) = depth.checked_sub(self.base_depth) else {
            return;
        };
        let levels = (last as usize + 1).min(self.physical_states.len());
        for slot in 0..levels {
            target.physical_states.push(self.physical_states[slot].as_ref().map(|phys| phys.filtered(mask)));
            let versions = self.field_versions[slot]
                .iter()
                .map(|(version, held)| (*version, *held & mask))
                .filter(|(_, held)| !held.is_empty())
                .collect();
            target.field_versions.push(versions);
            target.split_masks.push(self.split_masks[slot] & mask);
        }
    }

    /// Advance states at the upper-bound node.
    pub fn capture_base_advance_states(&self) -> VersioningSet {
        return self
            .physical_states
            .first()
            .and_then(Option::as_ref)
            .map(|phys| phys.advance_states().clone())
            .unwrap_or_default();
    }

    // ========================================================================
    // Packing
    // ========================================================================

    pub fn pack_version_info(&self) -> VersionInfoPayload {
        let mut levels = Vec::with_capacity(self.physical_states.len());
        for slot in 0..self.physical_states.len() {
            let phys = self.physical_states[slot].as_ref();
            levels.push(LevelPayload {
                node: phys.map(|p| p.node),
                path_only: phys.is_some_and(|p| p.path_only),
                split_mask: self.split_masks[slot],
                field_versions: self.field_versions[slot].iter().map(|(v, m)| (*v, *m)).collect(),
                current: phys.map(|p| describe(p.version_states())).unwrap_or_default(),
                advance: phys.map(|p| describe(p.advance_states())).unwrap_or_default(),
            });
        }
        return VersionInfoPayload { upper_bound: self.upper_bound, base_depth: self.base_depth, levels };
    }

    /// Rebuild an info from a payload, resolving states against `arena`.
    /// Returns the info and every resolved state owned elsewhere.
    pub fn unpack_version_info(
        payload: &VersionInfoPayload,
        arena: &VersionStateArena,
    ) -> Result<(VersionInfo, Vec<StateRef>)> {
        let mut info = VersionInfo::new();
        info.upper_bound = payload.upper_bound;
        info.base_depth = payload.base_depth;
        let mut remote = Vec::new();
        for (slot, level) in payload.levels.iter().enumerate() {
            let depth = payload.base_depth + slot as u32;
            info.resize(depth);
            info.split_masks[slot] = level.split_mask;
            info.field_versions[slot] = level.field_versions.iter().copied().collect();
            let Some(node) = level.node else {
                continue;
            };
            let mut phys = PhysicalState::new(node, level.path_only);
            for entry in &level.current {
                let (state, _) = arena.find_or_create_proxy(&entry.state)?;
                if !state.is_owner() {
                    remote.push(state.clone());
                }
                phys.add_version_state(&state, entry.mask);
            }
            for entry in &level.advance {
                let (state, _) = arena.find_or_create_proxy(&entry.state)?;
                if !state.is_owner() {
                    remote.push(state.clone());
                }
                phys.add_advance_state(&state, entry.mask);
            }
            info.physical_states[slot] = Some(phys);
        }
        return Ok((info, remote));
    }

    pub fn pack_version_numbers(&self) -> VersionNumbersPayload {
        let levels = self
            .split_masks
            .iter()
            .zip(&self.field_versions)
            .map(|(split, versions)| (*split, versions.iter().map(|(v, m)| (*v, *m)).collect()))
            .collect();
        return VersionNumbersPayload { upper_bound: self.upper_bound, base_depth: self.base_depth, levels };
    }

    pub fn unpack_version_numbers(payload: &VersionNumbersPayload) -> VersionInfo {
        let mut info = VersionInfo::new();
        info.upper_bound = payload.upper_bound;
        info.base_depth = payload.base_depth;
        for (split, versions) in &payload.levels {
            info.physical_states.push(None);
            info.split_masks.push(*split);
            info.field_versions.push(versions.iter().copied().collect());
        }
        return info;
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        return wire::pack(&self.pack_version_info());
    }

    pub fn unpack(bytes: &[u8], arena: &VersionStateArena) -> Result<(VersionInfo, Vec<StateRef>)> {
        let payload: VersionInfoPayload = wire::unpack(bytes)?;
        return VersionInfo::unpack_version_info(&payload, arena);
    }
}

impl VersionTracker for VersionInfo {
    fn is_upper_bound_node(&self, node: NodeId) -> bool {
        return self.upper_bound == Some(node);
    }

    fn get_field_versions(&self, depth: u32, split_prev: bool, needed: FieldMask, out: &mut FieldVersions) {
        let Some(slot) = self.slot(depth) else {
            return;
        };
        let split = self.split_masks[slot];
        for (version, held) in &self.field_versions[slot] {
            let overlap = *held & needed;
            if overlap.is_empty() {
                continue;
            }
            let shifted = if split_prev { FieldMask::EMPTY } else { overlap & split };
            if !shifted.is_empty() {
                *out.entry(version + 1).or_default() |= shifted;
            }
            let kept = overlap - shifted;
            if !kept.is_empty() {
                *out.entry(*version).or_default() |= kept;
            }
        }
    }

    fn get_advance_versions(&self, depth: u32, needed: FieldMask, out: &mut FieldVersions) {
        let Some(phys) = self.physical_state(depth) else {
            return;
        };
        for (state, held) in phys.advance_states().iter() {
            let overlap = held & needed;
            if !overlap.is_empty() {
                *out.entry(state.version).or_default() |= overlap;
            }
        }
    }

    fn get_split_mask(&self, depth: u32, needed: FieldMask) -> FieldMask {
        return self.split_mask(depth) & needed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::AddressSpace;

    fn mask(fields: &[u32]) -> FieldMask {
        return FieldMask::from_fields(fields);
    }

    fn sample(arena: &VersionStateArena) -> VersionInfo {
        let mut info = VersionInfo::new();
        info.set_upper_bound_node(NodeId(0), 1);
        let top = arena.create(3, NodeId(0));
        let below = arena.create(1, NodeId(4));
        let next = arena.create(2, NodeId(4));
        info.add_current_version(NodeId(0), 1, &top, mask(&[0, 1]), true);
        info.record_split_fields(2, mask(&[1]));
        info.add_current_version(NodeId(4), 2, &below, mask(&[1]), false);
        info.add_advance_version(NodeId(4), 2, &next, mask(&[1]));
        return info;
    }

    #[test]
    fn slots_follow_depths() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let info = sample(&arena);
        assert_eq!(info.base_depth(), 1);
        assert_eq!(info.max_depth(), Some(2));
        assert!(info.is_upper_bound_node(NodeId(0)));
        assert!(info.physical_state(0).is_none());
        assert!(info.physical_state(1).is_some_and(|p| p.path_only));
        assert_eq!(info.split_mask(2), mask(&[1]));
        assert_eq!(info.get_split_mask(2, mask(&[0])), FieldMask::EMPTY);
    }

    #[test]
    fn split_fields_report_either_version() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let info = sample(&arena);
        let mut prev = FieldVersions::new();
        info.get_field_versions(2, true, FieldMask::ALL, &mut prev);
        assert_eq!(prev, FieldVersions::from([(1, mask(&[1]))]));
        let mut curr = FieldVersions::new();
        info.get_field_versions(2, false, FieldMask::ALL, &mut curr);
        assert_eq!(curr, FieldVersions::from([(2, mask(&[1]))]));
        let mut advance = FieldVersions::new();
        info.get_advance_versions(2, FieldMask::ALL, &mut advance);
        assert_eq!(advance, FieldVersions::from([(2, mask(&[1]))]));
    }

    #[test]
    fn logical_clones_drop_physical_states() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let info = sample(&arena);
        let logical = info.clone_logical();
        assert!(logical.physical_state(2).is_none());
        assert_eq!(logical.field_versions(2), info.field_versions(2));

        let mut shallow = VersionInfo::new();
        info.clone_to_depth(1, mask(&[0]), &mut shallow);
        assert_eq!(shallow.max_depth(), Some(1));
        assert_eq!(shallow.field_versions(1), FieldVersions::from([(3, mask(&[0]))]));

        let mut copy = VersionInfo::new();
        info.copy_to(&mut copy);
        assert_eq!(copy.pack_version_info(), info.pack_version_info());
    }

    #[test]
    fn base_advance_states_come_from_the_upper_bound() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let mut info = VersionInfo::new();
        info.set_upper_bound_node(NodeId(2), 0);
        let next = arena.create(5, NodeId(2));
        info.add_advance_version(NodeId(2), 0, &next, mask(&[7]));
        assert_eq!(info.capture_base_advance_states().dids(), vec![(next.did, mask(&[7]))]);
    }

    #[test]
    fn version_numbers_survive_packing() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let info = sample(&arena);
        let unpacked = VersionInfo::unpack_version_numbers(&info.pack_version_numbers());
        for depth in 1..=2 {
            assert_eq!(unpacked.field_versions(depth), info.field_versions(depth));
            assert_eq!(unpacked.split_mask(depth), info.split_mask(depth));
        }
    }
}
