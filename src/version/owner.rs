//! Lazy ownership of version managers.
//!
//! The first address space to touch a (node, context) pair becomes the owner
//! of its version manager. Every space consults the same directory, so the
//! claim is a compare-and-set on a shared slot. Ownership is released only
//! when the context is invalidated.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::pool::StateKey;
use crate::primitives::AddressSpace;
use crate::primitives::ContextId;
use crate::primitives::NodeId;

const UNOWNED: u32 = u32::MAX;

#[derive(Default)]
pub struct OwnerDirectory {
    slots: RwLock<FxHashMap<StateKey, Arc<AtomicU32>>>,
}

impl OwnerDirectory {
    pub fn new() -> OwnerDirectory {
        return OwnerDirectory::default();
    }

    fn slot(&self, node: NodeId, ctx: ContextId) -> Arc<AtomicU32> {
        if let Some(slot) = self.slots.read().get(&(node, ctx)) {
            return slot.clone();
        }
        let mut slots = self.slots.write();
        return slots.entry((node, ctx)).or_insert_with(|| Arc::new(AtomicU32::new(UNOWNED))).clone();
    }

    /// Claim ownership for `space` unless another space already holds it.
    /// Returns the owner after the attempt.
    pub fn claim(&self, node: NodeId, ctx: ContextId, space: AddressSpace) -> AddressSpace {
        let slot = self.slot(node, ctx);
        match slot.compare_exchange(UNOWNED, space.0, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                tracing::debug!(node = ?node, ctx = ?ctx, owner = ?space, "claimed version manager");
                return space;
            }
            Err(existing) => return AddressSpace(existing),
        }
    }

    pub fn owner(&self, node: NodeId, ctx: ContextId) -> Option<AddressSpace> {
        let value = self.slots.read().get(&(node, ctx)).map(|slot| slot.load(Ordering::Acquire))?;
        return (value != UNOWNED).then_some(AddressSpace(value));
    }

    /// Give up ownership held by `space`. Returns false if `space` was not the
    /// owner.
    pub fn release(&self, node: NodeId, ctx: ContextId, space: AddressSpace) -> bool {
        let slot = self.slot(node, ctx);
        return slot.compare_exchange(space.0, UNOWNED, Ordering::AcqRel, Ordering::Acquire).is_ok();
    }
}
