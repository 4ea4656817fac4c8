//! Logical users and the dependences recorded between them.

use crate::primitives::DependenceType;
use crate::primitives::FieldMask;
use crate::primitives::OpRef;
use crate::primitives::RegionUsage;

/// One operation's use of some fields of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalUser {
    pub op: OpRef,
    /// Index of the region requirement within the operation.
    pub index: u32,
    pub usage: RegionUsage,
    pub mask: FieldMask,
    /// Traversals left before the user is tested against the commit set.
    pub timeout: u32,
}

impl LogicalUser {
    pub fn new(op: OpRef, index: u32, usage: RegionUsage, mask: FieldMask, timeout: u32) -> LogicalUser {
        return LogicalUser { op, index, usage, mask, timeout };
    }

    /// The same user restricted to `mask`.
    pub fn with_mask(&self, mask: FieldMask) -> LogicalUser {
        return LogicalUser { mask, ..self.clone() };
    }
}

/// An ordering edge: `next` must wait for `prev` on `mask`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dependence {
    pub prev: OpRef,
    pub prev_index: u32,
    pub next: OpRef,
    pub next_index: u32,
    pub kind: DependenceType,
    pub mask: FieldMask,
}

impl Dependence {
    pub fn between(prev: &LogicalUser, next: &LogicalUser, kind: DependenceType, mask: FieldMask) -> Dependence {
        return Dependence {
            prev: prev.op,
            prev_index: prev.index,
            next: next.op,
            next_index: next.index,
            kind,
            mask,
        };
    }
}
