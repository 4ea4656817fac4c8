//! Per-address-space storage of version states.
//!
//! Version states are shared between version managers, parent states (as
//! open children) and version infos. Every such holder owns a [`StateRef`];
//! cloning or dropping the token adds or removes a local reference. A state
//! whose last local reference goes away is queued for the next
//! [`VersionStateArena::collect`], which reclaims it or returns its remote
//! references to the owner.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::error::Result;
use crate::message::Message;
use crate::message::Outbound;
use crate::message::StateDescriptor;
use crate::primitives::AddressSpace;
use crate::primitives::DistributedId;
use crate::primitives::NodeId;
use crate::primitives::VersionId;
use crate::version::state::VersionState;

#[derive(Default)]
struct Collector {
    pending: Mutex<Vec<DistributedId>>,
}

impl Collector {
    fn defer(&self, did: DistributedId) {
        self.pending.lock().push(did);
    }

    fn drain(&self) -> Vec<DistributedId> {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        pending.sort();
        pending.dedup();
        return pending;
    }
}

/// A counted reference to a version state.
pub struct StateRef {
    state: Arc<VersionState>,
    collector: Arc<Collector>,
}

impl StateRef {
    fn new(state: Arc<VersionState>, collector: Arc<Collector>) -> StateRef {
        state.add_local_ref();
        return StateRef { state, collector };
    }

    pub fn state(&self) -> &Arc<VersionState> {
        return &self.state;
    }
}

impl Clone for StateRef {
    fn clone(&self) -> StateRef {
        return StateRef::new(self.state.clone(), self.collector.clone());
    }
}

impl Drop for StateRef {
    fn drop(&mut self) {
        if self.state.remove_local_ref() {
            self.collector.defer(self.state.did);
        }
    }
}

impl Deref for StateRef {
    type Target = VersionState;

    fn deref(&self) -> &VersionState {
        return &self.state;
    }
}

impl PartialEq for StateRef {
    fn eq(&self, other: &StateRef) -> bool {
        return self.state.did == other.state.did;
    }
}

impl Eq for StateRef {}

impl fmt::Debug for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "StateRef({:?} v{})", self.state.did, self.state.version);
    }
}

pub struct VersionStateArena {
    space: AddressSpace,
    states: RwLock<FxHashMap<DistributedId, Arc<VersionState>>>,
    collector: Arc<Collector>,
    next: AtomicU64,
}

impl VersionStateArena {
    pub fn new(space: AddressSpace) -> VersionStateArena {
        return VersionStateArena {
            space,
            states: RwLock::new(FxHashMap::default()),
            collector: Arc::new(Collector::default()),
            next: AtomicU64::new(1),
        };
    }

    pub fn space(&self) -> AddressSpace {
        return self.space;
    }

    /// Create a state owned by this space.
    pub fn create(&self, version: VersionId, node: NodeId) -> StateRef {
        let did = DistributedId::new(self.space, self.next.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(VersionState::new(did, version, node, self.space));
        self.states.write().insert(did, state.clone());
        tracing::trace!(did = ?did, version, node = ?node, "created version state");
        return StateRef::new(state, self.collector.clone());
    }

    /// Resolve a descriptor received from another space. Returns the state
    /// and whether a proxy had to be created for it.
    pub fn find_or_create_proxy(&self, descriptor: &StateDescriptor) -> Result<(StateRef, bool)> {
        if let Some(found) = self.get(descriptor.did) {
            return Ok((found, false));
        }
        if descriptor.owner() == self.space {
            return Err(Error::UnknownVersionState(descriptor.did));
        }
        let mut states = self.states.write();
        if let Some(raced) = states.get(&descriptor.did) {
            return Ok((StateRef::new(raced.clone(), self.collector.clone()), false));
        }
        let proxy = Arc::new(VersionState::new(descriptor.did, descriptor.version, descriptor.node, self.space));
        states.insert(descriptor.did, proxy.clone());
        tracing::trace!(did = ?descriptor.did, "created proxy");
        return Ok((StateRef::new(proxy, self.collector.clone()), true));
    }

    /// A new reference to a state in the arena.
    pub fn get(&self, did: DistributedId) -> Option<StateRef> {
        let states = self.states.read();
        return states.get(&did).map(|state| StateRef::new(state.clone(), self.collector.clone()));
    }

    pub fn contains(&self, did: DistributedId) -> bool {
        return self.states.read().contains_key(&did);
    }

    pub fn len(&self) -> usize {
        return self.states.read().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Queue a state for re-examination at the next collection.
    pub fn defer(&self, did: DistributedId) {
        self.collector.defer(did);
    }

    /// The owner no longer needs the contribution this proxy carries.
    pub fn release_pin(&self, did: DistributedId) {
        let Some(state) = self.states.read().get(&did).cloned() else {
            return;
        };
        state.clear_pin();
        if state.local_refs() == 0 {
            self.collector.defer(did);
        }
    }

    /// Reclaim unreferenced states. Returns the messages releasing their
    /// remote copies.
    pub fn collect(&self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        let mut reclaimed = 0usize;
        // Reclaiming a state drops its children, which may queue more.
        loop {
            let batch = self.collector.drain();
            if batch.is_empty() {
                break;
            }
            for did in batch {
                self.collect_one(did, &mut outbound, &mut reclaimed);
            }
        }
        if reclaimed > 0 || !outbound.is_empty() {
            tracing::debug!(space = ?self.space, reclaimed, released = outbound.len(), "collected version states");
        }
        return outbound;
    }

    fn collect_one(&self, did: DistributedId, outbound: &mut Vec<Outbound>, reclaimed: &mut usize) {
        let mut states = self.states.write();
        let Some(state) = states.get(&did).cloned() else {
            return;
        };
        if state.local_refs() > 0 {
            return;
        }
        if state.is_owner() {
            if state.has_holders() {
                return;
            }
            states.remove(&did);
            drop(states);
            *reclaimed += 1;
            for space in state.valid_instances() {
                outbound.push(Outbound::new(space, Message::RemoveReference { did, count: 0 }));
            }
            return;
        }
        let count = state.take_received();
        if count > 0 {
            outbound.push(Outbound::new(state.owner(), Message::RemoveReference { did, count }));
        }
        if !state.is_pinned() {
            states.remove(&did);
            *reclaimed += 1;
        }
    }
}

impl fmt::Debug for VersionStateArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f.debug_struct("VersionStateArena").field("space", &self.space).field("states", &self.len()).finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_follow_clone_and_drop() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let a = arena.create(1, NodeId(0));
        assert_eq!(a.local_refs(), 1);
        let b = a.clone();
        assert_eq!(a.local_refs(), 2);
        drop(b);
        assert_eq!(a.local_refs(), 1);
        assert!(arena.collect().is_empty());
        assert!(arena.contains(a.did));
    }

    #[test]
    fn unreferenced_owned_states_are_reclaimed() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let a = arena.create(1, NodeId(0));
        let did = a.did;
        drop(a);
        assert!(arena.collect().is_empty());
        assert!(!arena.contains(did));
    }

    #[test]
    fn held_states_wait_for_their_holders() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let a = arena.create(1, NodeId(0));
        a.add_holder(AddressSpace(1), 1);
        let did = a.did;
        drop(a);
        arena.collect();
        assert!(arena.contains(did));

        let state = arena.get(did).map(|s| s.state().clone());
        assert!(state.as_ref().is_some_and(|s| s.remove_holder(AddressSpace(1), 1)));
        arena.defer(did);
        arena.collect();
        assert!(!arena.contains(did));
    }

    #[test]
    fn reclaiming_releases_contributors() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let a = arena.create(1, NodeId(0));
        a.add_valid_instance(AddressSpace(4));
        let did = a.did;
        drop(a);
        let out = arena.collect();
        assert_eq!(out, vec![Outbound::new(AddressSpace(4), Message::RemoveReference { did, count: 0 })]);
    }

    #[test]
    fn proxies_return_received_references() {
        let arena = VersionStateArena::new(AddressSpace(2));
        let descriptor = StateDescriptor { did: DistributedId::new(AddressSpace(0), 7), version: 3, node: NodeId(5) };
        let (proxy, created) = arena.find_or_create_proxy(&descriptor).unwrap_or_else(|e| panic!("{e}"));
        assert!(created);
        proxy.record_received(2);
        let (again, created) = arena.find_or_create_proxy(&descriptor).unwrap_or_else(|e| panic!("{e}"));
        assert!(!created);
        again.record_received(1);
        drop(proxy);
        drop(again);
        let out = arena.collect();
        assert_eq!(out, vec![Outbound::new(AddressSpace(0), Message::RemoveReference { did: descriptor.did, count: 3 })]);
        assert!(!arena.contains(descriptor.did));
    }

    #[test]
    fn pinned_proxies_survive_until_released() {
        let arena = VersionStateArena::new(AddressSpace(2));
        let descriptor = StateDescriptor { did: DistributedId::new(AddressSpace(0), 1), version: 1, node: NodeId(0) };
        let (proxy, _) = arena.find_or_create_proxy(&descriptor).unwrap_or_else(|e| panic!("{e}"));
        proxy.record_received(1);
        assert!(proxy.merge_physical_state(&Default::default(), crate::primitives::FieldMask::ALL));
        drop(proxy);
        assert_eq!(arena.collect().len(), 1);
        assert!(arena.contains(descriptor.did));
        arena.release_pin(descriptor.did);
        assert!(arena.collect().is_empty());
        assert!(!arena.contains(descriptor.did));
    }

    #[test]
    fn unknown_owned_descriptors_are_errors() {
        let arena = VersionStateArena::new(AddressSpace(0));
        let descriptor = StateDescriptor { did: DistributedId::new(AddressSpace(0), 99), version: 1, node: NodeId(0) };
        assert!(matches!(arena.find_or_create_proxy(&descriptor), Err(Error::UnknownVersionState(_))));
    }
}
