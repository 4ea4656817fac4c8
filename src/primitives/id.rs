//! Identifier types.
//!
//! # Identifier Hierarchy
//!
//! - `NodeId`: a node of the region tree (region or partition)
//! - `ContextId`: a parent task context; analysis state is keyed by (node, context)
//! - `AddressSpace`: one participant of the distributed runtime
//! - `OpRef`: an operation plus its generation, so recycled operation
//!   objects are never confused with their previous incarnation
//! - `DistributedId`: a version state, globally unique, naming its owner
//! - `RequestId`: an outstanding remote request, naming its issuer
//!
//! All identifiers are small `Copy` newtypes that order and hash
//! deterministically, so they can key `BTreeMap`s and travel on the wire.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Version number of a field's data at one (node, context).
pub type VersionId = u64;

/// Identifier of a projection epoch.
pub type ProjectionEpochId = u64;

/// Position of a child under its parent node.
pub type Color = u32;

/// Identifier of a reduction operator. Zero means "no reduction".
pub type ReductionOpId = u32;

/// Identifier of a shard in a control-replicated context.
pub type ShardId = u32;

/// A node of the region tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// A parent task context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u32);

/// Unique id of a logical context, stable across the address spaces that
/// analyze operations of the same parent task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId(pub u64);

/// One participant of the distributed runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressSpace(pub u32);

/// Identifier of an operation object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u64);

/// An operation reference: the operation and the generation it was
/// registered under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpRef {
    pub op: OpId,
    pub generation: u32,
}

impl OpRef {
    pub fn new(op: u64, generation: u32) -> OpRef {
        return OpRef { op: OpId(op), generation };
    }
}

/// Opaque handle of a physical view. Views are produced and consumed by the
/// physical layer; this crate only tracks which fields each view holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId(pub u64);

const SPACE_SHIFT: u32 = 40;
const SEQUENCE_MASK: u64 = (1u64 << SPACE_SHIFT) - 1;

/// Globally unique id of a version state.
///
/// The high bits name the address space that created (and owns) the state,
/// the low bits a per-space sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DistributedId(u64);

impl DistributedId {
    pub fn new(owner: AddressSpace, sequence: u64) -> DistributedId {
        debug_assert!(sequence <= SEQUENCE_MASK);
        return DistributedId(((owner.0 as u64) << SPACE_SHIFT) | (sequence & SEQUENCE_MASK));
    }

    /// The address space that owns the state.
    pub fn owner(self) -> AddressSpace {
        return AddressSpace((self.0 >> SPACE_SHIFT) as u32);
    }

    pub fn sequence(self) -> u64 {
        return self.0 & SEQUENCE_MASK;
    }
}

impl fmt::Debug for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "did({}:{})", self.owner().0, self.sequence());
    }
}

/// Id of an outstanding remote request, unique per issuing space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(issuer: AddressSpace, sequence: u64) -> RequestId {
        return RequestId(((issuer.0 as u64) << SPACE_SHIFT) | (sequence & SEQUENCE_MASK));
    }

    pub fn issuer(self) -> AddressSpace {
        return AddressSpace((self.0 >> SPACE_SHIFT) as u32);
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "req({}:{})", self.issuer().0, self.0 & SEQUENCE_MASK);
    }
}
