//! Projection bookkeeping.
//!
//! A projection access is one requirement issued for every point of a launch
//! domain: the projection function maps each point to a child color of a
//! partition. The structures here summarize such accesses so that the
//! closer can prove two successive launches non-interfering, and so that
//! control-replicated shards can find which peers own the projected leaves.
//!
//! # Epochs
//!
//! Projection epochs number the stretches of projection accesses between
//! closes of a partition's fields. Two point operations of the same launch
//! capture the same epoch id, which is what lets version advances for them
//! deduplicate.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::logical::closer::LogicalCloser;
use crate::primitives::Color;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::ProjectionEpochId;
use crate::primitives::RegionTree;
use crate::primitives::ShardId;

/// Id of the first projection epoch of every field.
pub const FIRST_EPOCH: ProjectionEpochId = 1;

/// An inclusive one-dimensional launch domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Domain {
    pub lo: i64,
    pub hi: i64,
}

impl Domain {
    pub fn new(lo: i64, hi: i64) -> Domain {
        return Domain { lo, hi };
    }

    pub fn is_empty(&self) -> bool {
        return self.lo > self.hi;
    }

    /// Number of points, saturating at `u64::MAX` for the full `i64` range.
    pub fn volume(&self) -> u64 {
        return u64::try_from(self.span()).unwrap_or(u64::MAX);
    }

    /// Exact number of points.
    pub fn span(&self) -> u128 {
        if self.is_empty() {
            return 0;
        }
        return u128::from(self.hi.abs_diff(self.lo)) + 1;
    }

    pub fn contains(&self, point: i64) -> bool {
        return self.lo <= point && point <= self.hi;
    }

    /// True if every point of `other` is in `self`.
    pub fn dominates(&self, other: &Domain) -> bool {
        return other.is_empty() || (self.lo <= other.lo && other.hi <= self.hi);
    }

    pub fn intersects(&self, other: &Domain) -> bool {
        return !self.is_empty() && !other.is_empty() && self.lo <= other.hi && other.lo <= self.hi;
    }
}

/// The launch points `first`, `first + stride`, ... (`count` of them) that
/// project to one color.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointRun {
    pub first: i64,
    pub stride: u64,
    pub count: u128,
}

impl PointRun {
    fn single(point: i64) -> PointRun {
        return PointRun { first: point, stride: 1, count: 1 };
    }

    pub fn nth(&self, step: u128) -> i64 {
        debug_assert!(step < self.count);
        return (i128::from(self.first) + step as i128 * i128::from(self.stride)) as i64;
    }

    pub fn last(&self) -> i64 {
        return self.nth(self.count - 1);
    }

    /// First point of the run at or after `at`.
    pub fn first_from(&self, at: i64) -> Option<i64> {
        if at <= self.first {
            return Some(self.first);
        }
        let gap = at.abs_diff(self.first);
        let steps = u128::from(gap).div_ceil(u128::from(self.stride));
        if steps >= self.count {
            return None;
        }
        return Some(self.nth(steps));
    }
}

/// Maps launch points to child colors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProjectionFunction {
    Identity,
    Offset(i64),
    Modulo(u32),
    Constant(Color),
}

impl ProjectionFunction {
    /// Child color accessed by `point`, if it names one.
    pub fn project(&self, point: i64) -> Option<Color> {
        match *self {
            ProjectionFunction::Identity => return Color::try_from(point).ok(),
            ProjectionFunction::Offset(k) => return Color::try_from(point.checked_add(k)?).ok(),
            ProjectionFunction::Modulo(0) => return None,
            ProjectionFunction::Modulo(m) => return Some(point.rem_euclid(m as i64) as Color),
            ProjectionFunction::Constant(c) => return Some(c),
        }
    }

    /// The points of `domain` that project to `color`, if any.
    pub fn run_reaching(&self, color: Color, domain: &Domain) -> Option<PointRun> {
        if domain.is_empty() {
            return None;
        }
        let single = |point: i64| {
            if domain.contains(point) {
                return Some(PointRun::single(point));
            }
            return None;
        };
        match *self {
            ProjectionFunction::Identity => return single(i64::from(color)),
            ProjectionFunction::Offset(k) => return single(i64::from(color).checked_sub(k)?),
            ProjectionFunction::Modulo(0) => return None,
            ProjectionFunction::Modulo(m) => {
                if color >= m {
                    return None;
                }
                let m = i64::from(m);
                let first = i128::from(domain.lo) + i128::from((i64::from(color) - domain.lo.rem_euclid(m)).rem_euclid(m));
                if first > i128::from(domain.hi) {
                    return None;
                }
                let count = (i128::from(domain.hi) - first) as u128 / m as u128 + 1;
                return Some(PointRun { first: first as i64, stride: m as u64, count });
            }
            ProjectionFunction::Constant(c) => {
                if c != color {
                    return None;
                }
                return Some(PointRun { first: domain.lo, stride: 1, count: domain.span() });
            }
        }
    }

    /// True if distinct points always reach distinct colors.
    pub fn is_injective(&self) -> bool {
        return matches!(self, ProjectionFunction::Identity | ProjectionFunction::Offset(_));
    }
}

/// Assigns launch points to shards of a control-replicated context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardingFunction {
    /// Contiguous blocks of points per shard.
    Blocked { shards: u32 },
    /// Points dealt round-robin.
    Cyclic { shards: u32 },
}

impl ShardingFunction {
    pub fn shard(&self, point: i64, domain: &Domain) -> ShardId {
        debug_assert!(domain.contains(point));
        let offset = point.abs_diff(domain.lo);
        match *self {
            ShardingFunction::Cyclic { shards } => return (offset % u64::from(shards.max(1))) as ShardId,
            ShardingFunction::Blocked { shards } => {
                let per = Self::block_size(shards, domain);
                return (offset / per).min(u64::from(shards.max(1)) - 1) as ShardId;
            }
        }
    }

    fn block_size(shards: u32, domain: &Domain) -> u64 {
        let per = domain.span().div_ceil(u128::from(shards.max(1))).max(1);
        return u64::try_from(per).unwrap_or(u64::MAX);
    }

    /// Shards owning at least one point of `run`.
    pub fn shards_of(&self, run: &PointRun, domain: &Domain) -> BTreeSet<ShardId> {
        let mut out = BTreeSet::new();
        match *self {
            ShardingFunction::Cyclic { shards } => {
                // Shards repeat after at most `shards` points.
                let steps = run.count.min(u128::from(shards.max(1)));
                for step in 0..steps {
                    out.insert(self.shard(run.nth(step), domain));
                }
            }
            ShardingFunction::Blocked { shards } => {
                let per = i128::from(Self::block_size(shards, domain));
                let first = self.shard(run.first, domain);
                let last = self.shard(run.last(), domain);
                for shard in first..=last {
                    let lo = i128::from(domain.lo) + i128::from(shard) * per;
                    let hi = if shard == shards.max(1) - 1 {
                        i128::from(domain.hi)
                    } else {
                        (lo + per - 1).min(i128::from(domain.hi))
                    };
                    let reached = run.first_from(lo as i64).is_some_and(|point| i128::from(point) <= hi);
                    if reached {
                        out.insert(shard);
                    }
                }
            }
        }
        return out;
    }
}

/// Everything needed to recompute which children a projection access
/// touched and which shard touched each of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectionSummary {
    pub domain: Domain,
    pub projection: ProjectionFunction,
    pub sharding: Option<ShardingFunction>,
}

impl ProjectionSummary {
    pub fn new(domain: Domain, projection: ProjectionFunction) -> ProjectionSummary {
        return ProjectionSummary { domain, projection, sharding: None };
    }
}

/// A projection summary pinned to the partition it was applied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardingSummary {
    pub summary: ProjectionSummary,
    pub node: NodeId,
}

impl ShardingSummary {
    /// Shards whose points touched some child of the partition.
    pub fn interfering_shards(&self, tree: &dyn RegionTree) -> BTreeSet<ShardId> {
        return ProjectionTree::build(&self.summary, self.node, tree).shards();
    }
}

/// Projection metadata attached to a region requirement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionInfo {
    pub projection: ProjectionFunction,
    pub domain: Domain,
    pub sharding: Option<ShardingFunction>,
    epochs: BTreeMap<ProjectionEpochId, FieldMask>,
    dirty_reduction: bool,
}

impl ProjectionInfo {
    pub fn new(projection: ProjectionFunction, domain: Domain) -> ProjectionInfo {
        return ProjectionInfo {
            projection,
            domain,
            sharding: None,
            epochs: BTreeMap::new(),
            dirty_reduction: false,
        };
    }

    pub fn with_sharding(mut self, sharding: ShardingFunction) -> ProjectionInfo {
        self.sharding = Some(sharding);
        return self;
    }

    pub fn summary(&self) -> ProjectionSummary {
        return ProjectionSummary { domain: self.domain, projection: self.projection, sharding: self.sharding };
    }

    pub fn record_projection_epoch(&mut self, epoch: ProjectionEpochId, mask: FieldMask) {
        *self.epochs.entry(epoch).or_default() |= mask;
    }

    /// Epochs captured during the logical analysis, with the fields of each.
    pub fn projection_epochs(&self) -> &BTreeMap<ProjectionEpochId, FieldMask> {
        return &self.epochs;
    }

    pub fn clear_epochs(&mut self) {
        self.epochs.clear();
    }

    pub fn is_dirty_reduction(&self) -> bool {
        return self.dirty_reduction;
    }

    pub fn set_dirty_reduction(&mut self, dirty: bool) {
        self.dirty_reduction = dirty;
    }
}

/// The children of a partition reached by a projection, with the shards
/// that reached each of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectionTree {
    pub node: NodeId,
    leaves: BTreeMap<Color, BTreeSet<ShardId>>,
}

impl ProjectionTree {
    /// Walks the children of `node`, not the points of the domain.
    pub fn build(summary: &ProjectionSummary, node: NodeId, tree: &dyn RegionTree) -> ProjectionTree {
        let mut leaves: BTreeMap<Color, BTreeSet<ShardId>> = BTreeMap::new();
        for (color, _) in tree.children(node) {
            let Some(run) = summary.projection.run_reaching(color, &summary.domain) else {
                continue;
            };
            let shards = match &summary.sharding {
                Some(sharding) => sharding.shards_of(&run, &summary.domain),
                None => BTreeSet::from([0]),
            };
            leaves.insert(color, shards);
        }
        return ProjectionTree { node, leaves };
    }

    /// True if every leaf of `other` is also a leaf of `self`.
    pub fn dominates(&self, other: &ProjectionTree) -> bool {
        return other.leaves.keys().all(|c| self.leaves.contains_key(c));
    }

    /// True if the trees share no leaf.
    pub fn disjoint(&self, other: &ProjectionTree) -> bool {
        return other.leaves.keys().all(|c| !self.leaves.contains_key(c));
    }

    /// True if every leaf is reached only by `shard`.
    pub fn all_same_shard(&self, shard: ShardId) -> bool {
        return self.leaves.values().all(|s| s.len() == 1 && s.contains(&shard));
    }

    /// True if each leaf shared with `other` is reached by one shard, the
    /// same one in both trees.
    pub fn same_shard_owners(&self, other: &ProjectionTree) -> bool {
        for (color, shards) in &other.leaves {
            if let Some(mine) = self.leaves.get(color) {
                if mine.len() != 1 || mine != shards {
                    return false;
                }
            }
        }
        return true;
    }

    pub fn shards(&self) -> BTreeSet<ShardId> {
        return self.leaves.values().flatten().copied().collect();
    }

    pub fn colors(&self) -> impl Iterator<Item = Color> + '_ {
        return self.leaves.keys().copied();
    }

    pub fn len(&self) -> usize {
        return self.leaves.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.leaves.is_empty();
    }
}

/// One epoch of projection accesses on some fields of a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectionEpoch {
    pub epoch_id: ProjectionEpochId,
    pub valid_fields: FieldMask,
    pub write_projections: BTreeSet<ProjectionSummary>,
    pub reduce_projections: BTreeSet<ProjectionSummary>,
}

impl ProjectionEpoch {
    pub fn new(epoch_id: ProjectionEpochId, valid_fields: FieldMask) -> ProjectionEpoch {
        return ProjectionEpoch {
            epoch_id,
            valid_fields,
            write_projections: BTreeSet::new(),
            reduce_projections: BTreeSet::new(),
        };
    }

    pub fn insert_write(&mut self, summary: ProjectionSummary) {
        self.write_projections.insert(summary);
    }

    pub fn insert_reduce(&mut self, summary: ProjectionSummary) {
        self.reduce_projections.insert(summary);
    }

    /// Report this epoch's projections to a closer closing `closing_mask`.
    pub fn record_closed_projections(&self, closer: &mut LogicalCloser, node: NodeId, closing_mask: FieldMask) {
        let overlap = self.valid_fields & closing_mask;
        if overlap.is_empty() {
            return;
        }
        for summary in &self.write_projections {
            closer.record_write_projection(ShardingSummary { summary: *summary, node }, overlap);
        }
        for summary in &self.reduce_projections {
            closer.record_reduce_projection(ShardingSummary { summary: *summary, node }, overlap);
        }
    }
}
