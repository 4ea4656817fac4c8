//! Sets of version states with per-state field masks.
//!
//! Most sets hold exactly one state, so the set keeps that case inline and
//! only allocates a map once a second state arrives. Iteration is the same
//! whichever representation backs the set.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;

use crate::primitives::DistributedId;
use crate::primitives::FieldMask;
use crate::primitives::VersionId;
use crate::version::arena::StateRef;

#[derive(Clone, Default)]
pub enum VersioningSet {
    #[default]
    Empty,
    Single(StateRef, FieldMask),
    Many(BTreeMap<DistributedId, (StateRef, FieldMask)>),
}

impl VersioningSet {
    pub fn new() -> VersioningSet {
        return VersioningSet::Empty;
    }

    pub fn is_empty(&self) -> bool {
        return matches!(self, VersioningSet::Empty);
    }

    pub fn len(&self) -> usize {
        match self {
            VersioningSet::Empty => return 0,
            VersioningSet::Single(..) => return 1,
            VersioningSet::Many(map) => return map.len(),
        }
    }

    /// Union of the masks of every state in the set.
    pub fn valid_mask(&self) -> FieldMask {
        return self.iter().fold(FieldMask::EMPTY, |acc, (_, mask)| acc | mask);
    }

    pub fn get(&self, did: DistributedId) -> Option<FieldMask> {
        match self {
            VersioningSet::Empty => return None,
            VersioningSet::Single(state, mask) => return (state.did == did).then_some(*mask),
            VersioningSet::Many(map) => return map.get(&did).map(|(_, mask)| *mask),
        }
    }

    pub fn contains(&self, did: DistributedId) -> bool {
        return self.get(did).is_some();
    }

    /// Add `state` for `mask`, unioning with its existing mask. Returns true
    /// if the state was not in the set before.
    pub fn insert(&mut self, state: StateRef, mask: FieldMask) -> bool {
        if mask.is_empty() {
            return false;
        }
        match self {
            VersioningSet::Empty => {
                *self = VersioningSet::Single(state, mask);
                return true;
            }
            VersioningSet::Single(existing, existing_mask) => {
                if existing.did == state.did {
                    *existing_mask |= mask;
                    return false;
                }
                let mut map = BTreeMap::new();
                map.insert(existing.did, (existing.clone(), *existing_mask));
                map.insert(state.did, (state, mask));
                *self = VersioningSet::Many(map);
                return true;
            }
            VersioningSet::Many(map) => match map.entry(state.did) {
                btree_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().1 |= mask;
                    return false;
                }
                btree_map::Entry::Vacant(entry) => {
                    entry.insert((state, mask));
                    return true;
                }
            },
        }
    }

    /// Remove a state entirely, returning the mask it held.
    pub fn erase(&mut self, did: DistributedId) -> Option<FieldMask> {
        let removed = match self {
            VersioningSet::Empty => None,
            VersioningSet::Single(state, mask) => {
                if state.did != did {
                    return None;
                }
                let mask = *mask;
                *self = VersioningSet::Empty;
                Some(mask)
            }
            VersioningSet::Many(map) => map.remove(&did).map(|(_, mask)| mask),
        };
        self.normalize();
        return removed;
    }

    pub fn clear(&mut self) {
        *self = VersioningSet::Empty;
    }

    /// Remove `mask` from every entry, dropping entries left empty.
    pub fn filter(&mut self, mask: FieldMask) {
        match self {
            VersioningSet::Empty => {}
            VersioningSet::Single(_, held) => {
                *held -= mask;
                if held.is_empty() {
                    *self = VersioningSet::Empty;
                }
            }
            VersioningSet::Many(map) => {
                map.retain(|_, (_, held)| {
                    *held -= mask;
                    return !held.is_empty();
                });
                self.normalize();
            }
        }
    }

    /// Move the `mask` portion of every entry into a new set.
    pub fn take_fields(&mut self, mask: FieldMask) -> VersioningSet {
        let mut taken = VersioningSet::new();
        for (state, held) in self.iter() {
            let overlap = held & mask;
            if !overlap.is_empty() {
                taken.insert(state.clone(), overlap);
            }
        }
        self.filter(mask);
        return taken;
    }

    /// Union another set into this one.
    pub fn absorb(&mut self, other: VersioningSet) {
        for (state, mask) in other.into_entries() {
            self.insert(state, mask);
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        match self {
            VersioningSet::Empty => return Iter::Empty,
            VersioningSet::Single(state, mask) => return Iter::Single(Some((state, *mask))),
            VersioningSet::Many(map) => return Iter::Many(map.values()),
        }
    }

    pub fn into_entries(self) -> Vec<(StateRef, FieldMask)> {
        match self {
            VersioningSet::Empty => return Vec::new(),
            VersioningSet::Single(state, mask) => return vec![(state, mask)],
            VersioningSet::Many(map) => return map.into_values().collect(),
        }
    }

    /// Entries restricted to `mask`, as owned references.
    pub fn entries_for(&self, mask: FieldMask) -> Vec<(StateRef, FieldMask)> {
        let mut out = Vec::new();
        for (state, held) in self.iter() {
            let overlap = held & mask;
            if !overlap.is_empty() {
                out.push((state.clone(), overlap));
            }
        }
        return out;
    }

    pub fn dids(&self) -> Vec<(DistributedId, FieldMask)> {
        return self.iter().map(|(state, mask)| (state.did, mask)).collect();
    }

    /// Fields held per version number.
    pub fn versions(&self) -> BTreeMap<VersionId, FieldMask> {
        let mut out: BTreeMap<VersionId, FieldMask> = BTreeMap::new();
        for (state, mask) in self.iter() {
            *out.entry(state.version).or_default() |= mask;
        }
        return out;
    }

    fn normalize(&mut self) {
        let VersioningSet::Many(map) = self else {
            return;
        };
        match map.len() {
            0 => *self = VersioningSet::Empty,
            1 => {
                if let Some((_, (state, mask))) = map.pop_first() {
                    *self = VersioningSet::Single(state, mask);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Debug for VersioningSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f.debug_map().entries(self.iter().map(|(state, mask)| (state.did, mask))).finish();
    }
}

pub enum Iter<'a> {
    Empty,
    Single(Option<(&'a StateRef, FieldMask)>),
    Many(btree_map::Values<'a, DistributedId, (StateRef, FieldMask)>),
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a StateRef, FieldMask);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Iter::Empty => return None,
            Iter::Single(item) => return item.take(),
            Iter::Many(values) => return values.next().map(|(state, mask)| (state, *mask)),
        }
    }
}

impl<'a> IntoIterator for &'a VersioningSet {
    type Item = (&'a StateRef, FieldMask);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        return self.iter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::AddressSpace;
    use crate::primitives::NodeId;
    use crate::version::arena::VersionStateArena;

    fn mask(fields: &[u32]) -> FieldMask {
        return FieldMask::from_fields(fields);
    }

    #[test]
    fn single_then_many_then_back() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let a = arena.create(1, NodeId(0));
        let b = arena.create(1, NodeId(0));

        let mut set = VersioningSet::new();
        assert!(set.insert(a.clone(), mask(&[0])));
        assert!(!set.insert(a.clone(), mask(&[1])));
        assert!(matches!(set, VersioningSet::Single(..)));
        assert_eq!(set.get(a.did), Some(mask(&[0, 1])));

        assert!(set.insert(b.clone(), mask(&[2])));
        assert!(matches!(set, VersioningSet::Many(..)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.valid_mask(), mask(&[0, 1, 2]));

        set.filter(mask(&[2]));
        assert!(matches!(set, VersioningSet::Single(..)));
        assert!(!set.contains(b.did));

        assert_eq!(set.erase(a.did), Some(mask(&[0, 1])));
        assert!(set.is_empty());
    }

    #[test]
    fn take_fields_splits_masks() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let a = arena.create(3, NodeId(0));
        let b = arena.create(3, NodeId(0));
        let mut set = VersioningSet::new();
        set.insert(a.clone(), mask(&[0, 1]));
        set.insert(b.clone(), mask(&[2]));

        let taken = set.take_fields(mask(&[1, 2]));
        assert_eq!(taken.dids(), vec![(a.did, mask(&[1])), (b.did, mask(&[2]))]);
        assert_eq!(set.dids(), vec![(a.did, mask(&[0]))]);
        assert_eq!(taken.versions().get(&3), Some(&mask(&[1, 2])));
    }

    #[test]
    fn iteration_agrees_across_representations() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let a = arena.create(1, NodeId(0));
        let mut set = VersioningSet::new();
        assert_eq!(set.iter().count(), 0);
        set.insert(a.clone(), mask(&[4]));
        let seen: Vec<_> = set.iter().map(|(s, m)| (s.did, m)).collect();
        assert_eq!(seen, vec![(a.did, mask(&[4]))]);
        set.insert(arena.create(1, NodeId(0)), mask(&[5]));
        assert_eq!((&set).into_iter().count(), 2);
    }

    #[test]
    fn empty_masks_are_ignored() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let mut set = VersioningSet::new();
        assert!(!set.insert(arena.create(1, NodeId(0)), FieldMask::EMPTY));
        assert!(set.is_empty());
    }
}
