//! Region usage and dependence classification.

use serde::Deserialize;
use serde::Serialize;

use crate::primitives::id::ReductionOpId;

/// Access privilege of a region requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    NoAccess,
    ReadOnly,
    ReadWrite,
    /// Write without reading: prior contents of the fields are discarded.
    WriteDiscard,
    Reduce,
}

/// Coherence mode of a region requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coherence {
    Exclusive,
    Atomic,
    Simultaneous,
    Relaxed,
}

/// How an operation uses the fields of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionUsage {
    pub privilege: Privilege,
    pub coherence: Coherence,
    /// Reduction operator, only meaningful for [`Privilege::Reduce`].
    pub redop: ReductionOpId,
}

impl RegionUsage {
    pub fn new(privilege: Privilege, coherence: Coherence, redop: ReductionOpId) -> RegionUsage {
        return RegionUsage { privilege, coherence, redop };
    }

    pub fn read_only() -> RegionUsage {
        return RegionUsage::new(Privilege::ReadOnly, Coherence::Exclusive, 0);
    }

    pub fn read_write() -> RegionUsage {
        return RegionUsage::new(Privilege::ReadWrite, Coherence::Exclusive, 0);
    }

    pub fn write_discard() -> RegionUsage {
        return RegionUsage::new(Privilege::WriteDiscard, Coherence::Exclusive, 0);
    }

    pub fn reduce(redop: ReductionOpId) -> RegionUsage {
        debug_assert!(redop != 0);
        return RegionUsage::new(Privilege::Reduce, Coherence::Exclusive, redop);
    }

    pub fn is_read_only(&self) -> bool {
        return self.privilege == Privilege::ReadOnly;
    }

    /// Read-write or write-discard.
    pub fn is_write(&self) -> bool {
        return matches!(self.privilege, Privilege::ReadWrite | Privilege::WriteDiscard);
    }

    pub fn is_write_discard(&self) -> bool {
        return self.privilege == Privilege::WriteDiscard;
    }

    pub fn is_reduce(&self) -> bool {
        return self.privilege == Privilege::Reduce;
    }

    /// True if the usage produces a new version of the data.
    pub fn modifies(&self) -> bool {
        return self.is_write() || self.is_reduce();
    }

    fn is_simultaneous(&self) -> bool {
        return matches!(self.coherence, Coherence::Simultaneous | Coherence::Relaxed);
    }
}

/// Kind of ordering an operation must respect with respect to an earlier one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependenceType {
    None,
    /// Read after write (or anything after write).
    True,
    /// Write after read.
    Anti,
    Atomic,
    Simultaneous,
}

/// Classify the dependence of `next` on an earlier `prev` touching the same
/// fields.
pub fn check_dependence_type(prev: &RegionUsage, next: &RegionUsage) -> DependenceType {
    if prev.privilege == Privilege::NoAccess || next.privilege == Privilege::NoAccess {
        return DependenceType::None;
    }
    if prev.is_read_only() && next.is_read_only() {
        return DependenceType::None;
    }
    if prev.is_reduce() && next.is_reduce() && prev.redop == next.redop {
        return DependenceType::None;
    }
    if prev.is_simultaneous() && next.is_simultaneous() {
        return DependenceType::Simultaneous;
    }
    if prev.coherence == Coherence::Atomic && next.coherence == Coherence::Atomic {
        return DependenceType::Atomic;
    }
    if prev.is_read_only() {
        return DependenceType::Anti;
    }
    return DependenceType::True;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_do_not_conflict() {
        let r = RegionUsage::read_only();
        assert_eq!(check_dependence_type(&r, &r), DependenceType::None);
    }

    #[test]
    fn write_after_read_is_anti() {
        let r = RegionUsage::read_only();
        let w = RegionUsage::read_write();
        assert_eq!(check_dependence_type(&r, &w), DependenceType::Anti);
        assert_eq!(check_dependence_type(&w, &r), DependenceType::True);
        assert_eq!(check_dependence_type(&w, &w), DependenceType::True);
    }

    #[test]
    fn same_reduction_commutes() {
        let sum = RegionUsage::reduce(1);
        let max = RegionUsage::reduce(2);
        assert_eq!(check_dependence_type(&sum, &sum), DependenceType::None);
        assert_eq!(check_dependence_type(&sum, &max), DependenceType::True);
        assert_eq!(check_dependence_type(&sum, &RegionUsage::read_only()), DependenceType::True);
    }

    #[test]
    fn coherence_modes() {
        let atomic = RegionUsage::new(Privilege::ReadWrite, Coherence::Atomic, 0);
        let simul = RegionUsage::new(Privilege::ReadWrite, Coherence::Simultaneous, 0);
        assert_eq!(check_dependence_type(&atomic, &atomic), DependenceType::Atomic);
        assert_eq!(check_dependence_type(&simul, &simul), DependenceType::Simultaneous);
        assert_eq!(check_dependence_type(&atomic, &simul), DependenceType::True);
    }
}
