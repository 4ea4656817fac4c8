//! Field masks.
//!
//! A [`FieldMask`] is a set of field identifiers drawn from a fixed universe
//! of [`MAX_FIELDS`] entries. Every piece of per-field bookkeeping in the
//! crate (users, field states, version maps, physical states) is keyed by a
//! mask rather than by individual fields, so the set algebra here sits on
//! every hot path.
//!
//! # Representation
//!
//! A single `u64`. All operations are branch-free word operations; iterating
//! set bits walks `trailing_zeros`.

use std::fmt;
use std::ops::BitAnd;
use std::ops::BitAndAssign;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::ops::Not;
use std::ops::Sub;
use std::ops::SubAssign;

use serde::Deserialize;
use serde::Serialize;

/// Identifier of one field of a field space.
pub type FieldId = u32;

/// Size of the field universe.
pub const MAX_FIELDS: usize = 64;

/// A set of fields.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldMask(u64);

impl FieldMask {
    /// The empty mask.
    pub const EMPTY: FieldMask = FieldMask(0);
    /// Every field in the universe.
    pub const ALL: FieldMask = FieldMask(u64::MAX);

    /// Build a mask directly from its bit representation.
    pub const fn from_bits(bits: u64) -> FieldMask {
        return FieldMask(bits);
    }

    /// The raw bits.
    pub const fn bits(self) -> u64 {
        return self.0;
    }

    /// A mask holding exactly one field.
    pub fn single(field: FieldId) -> FieldMask {
        assert!((field as usize) < MAX_FIELDS, "field {field} out of range");
        return FieldMask(1u64 << field);
    }

    /// A mask holding every listed field.
    pub fn from_fields(fields: &[FieldId]) -> FieldMask {
        return fields.iter().copied().collect();
    }

    pub fn insert(&mut self, field: FieldId) {
        *self |= FieldMask::single(field);
    }

    pub fn remove(&mut self, field: FieldId) {
        *self -= FieldMask::single(field);
    }

    pub fn contains(self, field: FieldId) -> bool {
        return (field as usize) < MAX_FIELDS && self.0 & (1u64 << field) != 0;
    }

    pub const fn is_empty(self) -> bool {
        return self.0 == 0;
    }

    /// Number of fields in the mask.
    pub const fn count(self) -> u32 {
        return self.0.count_ones();
    }

    /// True if every field of `self` is also in `other`.
    pub const fn is_subset_of(self, other: FieldMask) -> bool {
        return self.0 & !other.0 == 0;
    }

    /// True if the masks share no field.
    pub const fn is_disjoint(self, other: FieldMask) -> bool {
        return self.0 & other.0 == 0;
    }

    pub const fn intersects(self, other: FieldMask) -> bool {
        return !self.is_disjoint(other);
    }

    /// Lowest field in the mask.
    pub fn first(self) -> Option<FieldId> {
        if self.0 == 0 {
            return None;
        }
        return Some(self.0.trailing_zeros());
    }

    /// Iterate the fields in ascending order.
    pub fn iter(self) -> FieldIter {
        return FieldIter { bits: self.0 };
    }
}

/// Iterator over the fields of a [`FieldMask`].
#[derive(Clone, Debug)]
pub struct FieldIter {
    bits: u64,
}

impl Iterator for FieldIter {
    type Item = FieldId;

    fn next(&mut self) -> Option<FieldId> {
        if self.bits == 0 {
            return None;
        }
        let field = self.bits.trailing_zeros();
        self.bits &= self.bits - 1;
        return Some(field);
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.bits.count_ones() as usize;
        return (n, Some(n));
    }
}

impl IntoIterator for FieldMask {
    type Item = FieldId;
    type IntoIter = FieldIter;

    fn into_iter(self) -> FieldIter {
        return self.iter();
    }
}

impl FromIterator<FieldId> for FieldMask {
    fn from_iter<I: IntoIterator<Item = FieldId>>(iter: I) -> FieldMask {
        let mut mask = FieldMask::EMPTY;
        for field in iter {
            mask.insert(field);
        }
        return mask;
    }
}

impl BitAnd for FieldMask {
    type Output = FieldMask;

    fn bitand(self, rhs: FieldMask) -> FieldMask {
        return FieldMask(self.0 & rhs.0);
    }
}

impl BitAndAssign for FieldMask {
    fn bitand_assign(&mut self, rhs: FieldMask) {
        self.0 &= rhs.0;
    }
}

impl BitOr for FieldMask {
    type Output = FieldMask;

    fn bitor(self, rhs: FieldMask) -> FieldMask {
        return FieldMask(self.0 | rhs.0);
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: FieldMask) {
        self.0 |= rhs.0;
    }
}

impl Sub for FieldMask {
    type Output = FieldMask;

    fn sub(self, rhs: FieldMask) -> FieldMask {
        return FieldMask(self.0 & !rhs.0);
    }
}

impl SubAssign for FieldMask {
    fn sub_assign(&mut self, rhs: FieldMask) {
        self.0 &= !rhs.0;
    }
}

impl Not for FieldMask {
    type Output = FieldMask;

    fn not(self) -> FieldMask {
        return FieldMask(!self.0);
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldMask")?;
        return f.debug_set().entries(self.iter()).finish();
    }
}
