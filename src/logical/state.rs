//! Per-(node, context) logical state.
//!
//! A [`LogicalState`] records who used the node (split into current and
//! previous epochs), how its children are open, which fields were written
//! at or below it, and the projection epochs of its fields. The analysis
//! methods here are called by the path driver in `logical::mod` with the
//! state's lock held.
//!
//! # Epochs of users
//!
//! A new user is tested against the current epoch. Fields on which every
//! overlapping current user received a dependence are *dominated*: the
//! current users of those fields move to the previous epoch (whose old
//! users for those fields are discarded), since anything later that depends
//! on the new user transitively depends on them. Non-dominated fields are
//! also tested against the previous epoch.

use std::collections::BTreeMap;

use crate::logical::AnalysisEnv;
use crate::logical::closer::CloseKind;
use crate::logical::closer::LogicalCloser;
use crate::logical::field_state::FieldState;
use crate::logical::field_state::OpenState;
use crate::logical::projection::FIRST_EPOCH;
use crate::logical::projection::ProjectionEpoch;
use crate::logical::projection::ProjectionInfo;
use crate::logical::user::Dependence;
use crate::logical::user::LogicalUser;
use crate::primitives::Color;
use crate::primitives::DependenceType;
use crate::primitives::FieldId;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::ReductionOpId;
use crate::primitives::check_dependence_type;
use crate::runtime::CommitSet;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalState {
    pub node: NodeId,
    pub field_states: Vec<FieldState>,
    pub curr_epoch_users: Vec<LogicalUser>,
    pub prev_epoch_users: Vec<LogicalUser>,
    /// Fields written somewhere below this node.
    pub dirty_below: FieldMask,
    /// Fields written by users registered at this node.
    pub write_fields: FieldMask,
    /// Fields written below this node by projections.
    pub partial_writes: FieldMask,
    pub reduction_fields: FieldMask,
    pub outstanding_reductions: BTreeMap<ReductionOpId, FieldMask>,
    pub projection_epochs: Vec<ProjectionEpoch>,
}

/// Outcome of siphoning the field states for an incoming access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Siphon {
    /// Fields whose projection state absorbed the incoming projection, so
    /// no new field state is needed for them.
    pub elided: FieldMask,
}

impl LogicalState {
    pub fn new(node: NodeId) -> LogicalState {
        return LogicalState {
            node,
            field_states: Vec::new(),
            curr_epoch_users: Vec::new(),
            prev_epoch_users: Vec::new(),
            dirty_below: FieldMask::EMPTY,
            write_fields: FieldMask::EMPTY,
            partial_writes: FieldMask::EMPTY,
            reduction_fields: FieldMask::EMPTY,
            outstanding_reductions: BTreeMap::new(),
            projection_epochs: Vec::new(),
        };
    }

    /// True if nothing has been recorded at the node.
    pub fn is_clean(&self) -> bool {
        return self.field_states.is_empty()
            && self.curr_epoch_users.is_empty()
            && self.prev_epoch_users.is_empty()
            && self.dirty_below.is_empty()
            && self.write_fields.is_empty()
            && self.partial_writes.is_empty()
            && self.reduction_fields.is_empty()
            && self.outstanding_reductions.is_empty()
            && self.projection_epochs.is_empty();
    }

    /// Forget everything; used when the context is reclaimed.
    pub fn reset(&mut self) {
        let node = self.node;
        *self = LogicalState::new(node);
    }

    pub fn clear_logical_users(&mut self) {
        self.curr_epoch_users.clear();
        self.prev_epoch_users.clear();
    }

    /// Forget the fields of `mask`; used when fields are deleted.
    pub fn clear_deleted_state(&mut self, mask: FieldMask) {
        self.clear_fields(mask);
        self.projection_epochs.retain_mut(|epoch| {
            epoch.valid_fields -= mask;
            return !epoch.valid_fields.is_empty();
        });
    }

    /// Remove every trace of `mask` except projection epochs, which must
    /// keep counting so that later epoch ids never repeat.
    pub fn clear_fields(&mut self, mask: FieldMask) {
        for users in [&mut self.curr_epoch_users, &mut self.prev_epoch_users] {
            users.retain_mut(|user| {
                user.mask -= mask;
                return !user.mask.is_empty();
            });
        }
        self.field_states.retain_mut(|state| {
            state.filter(mask);
            return !state.valid_fields.is_empty();
        });
        let projected = self.projection_fields() & mask;
        if !projected.is_empty() {
            self.advance_projection_epochs(projected);
        }
        self.dirty_below -= mask;
        self.write_fields -= mask;
        self.partial_writes -= mask;
        self.reduction_fields -= mask;
        self.outstanding_reductions.retain(|_, fields| {
            *fields -= mask;
            return !fields.is_empty();
        });
    }

    /// Fields with some open field state.
    pub fn open_fields(&self) -> FieldMask {
        return self.field_states.iter().fold(FieldMask::EMPTY, |acc, s| acc | s.valid_fields);
    }

    /// Open state of `field`, if any child is open for it.
    pub fn open_state_of(&self, field: FieldId) -> Option<OpenState> {
        return self
            .field_states
            .iter()
            .find(|s| s.valid_fields.contains(field))
            .map(|s| s.open_state);
    }

    fn projection_fields(&self) -> FieldMask {
        return self
            .field_states
            .iter()
            .filter(|s| s.is_projection_state())
            .fold(FieldMask::EMPTY, |acc, s| acc | s.valid_fields);
    }

    // ===================================================================
    // Users
    // ===================================================================

    /// Register `user` at the node after its dependence analysis.
    pub fn record_user(&mut self, user: LogicalUser) {
        if user.usage.is_write() {
            self.write_fields |= user.mask;
        }
        if user.usage.is_reduce() {
            self.reduction_fields |= user.mask;
            *self.outstanding_reductions.entry(user.usage.redop).or_default() |= user.mask;
        }
        self.curr_epoch_users.push(user);
    }

    /// Move the current users of `mask` to the previous epoch.
    pub fn filter_curr_epoch_users(&mut self, mask: FieldMask) {
        let mut index = 0;
        while index < self.curr_epoch_users.len() {
            let overlap = self.curr_epoch_users[index].mask & mask;
            if overlap.is_empty() {
                index += 1;
                continue;
            }
            self.prev_epoch_users.push(self.curr_epoch_users[index].with_mask(overlap));
            self.curr_epoch_users[index].mask -= overlap;
            if self.curr_epoch_users[index].mask.is_empty() {
                self.curr_epoch_users.remove(index);
            } else {
                index += 1;
            }
        }
    }

    /// Drop the previous-epoch users of `mask`.
    pub fn filter_prev_epoch_users(&mut self, mask: FieldMask) {
        self.prev_epoch_users.retain_mut(|user| {
            user.mask -= mask;
            return !user.mask.is_empty();
        });
    }

    /// Record the dependences of `user` on the users of this node.
    ///
    /// When `arrived` is set the node is the user's target and dominated
    /// fields retire their current users to the previous epoch.
    pub fn perform_dependence_analysis(
        &mut self,
        user: &LogicalUser,
        arrived: bool,
        commits: &CommitSet,
        timeout: u32,
        out: &mut Vec<Dependence>,
    ) {
        let dominator = perform_dependence_checks(&mut self.curr_epoch_users, user, user.mask, commits, timeout, out);
        let non_dominated = user.mask - dominator;
        if !non_dominated.is_empty() {
            perform_dependence_checks(&mut self.prev_epoch_users, user, non_dominated, commits, timeout, out);
        }
        if arrived && !dominator.is_empty() {
            self.filter_prev_epoch_users(dominator);
            self.filter_curr_epoch_users(dominator);
        }
    }

    // ===================================================================
    // Field states
    // ===================================================================

    /// Add a newly opened field state, folding it into a compatible one.
    /// Every fold counts down the target's rebuild timeout; at zero the
    /// whole list is coalesced.
    pub fn merge_new_field_state(&mut self, new_state: FieldState, rebuild_timeout: u32) {
        if new_state.valid_fields.is_empty() {
            return;
        }
        let mut rebuild = false;
        match self.field_states.iter_mut().find(|s| s.overlaps(&new_state)) {
            Some(existing) => {
                existing.merge(new_state);
                existing.rebuild_timeout = existing.rebuild_timeout.saturating_sub(1);
                rebuild = existing.rebuild_timeout == 0;
            }
            None => self.field_states.push(new_state),
        }
        if rebuild {
            self.rebuild_field_states(rebuild_timeout);
        }
    }

    /// Coalesce compatible field states and reset their timeouts.
    pub fn rebuild_field_states(&mut self, rebuild_timeout: u32) {
        let states = std::mem::take(&mut self.field_states);
        let mut rebuilt: Vec<FieldState> = Vec::with_capacity(states.len());
        for state in states {
            match rebuilt.iter_mut().find(|s| s.overlaps(&state)) {
                Some(existing) => existing.merge(state),
                None => rebuilt.push(state),
            }
        }
        for state in &mut rebuilt {
            state.rebuild_timeout = rebuild_timeout;
        }
        tracing::trace!(node = ?self.node, states = rebuilt.len(), "rebuilt field states");
        self.field_states = rebuilt;
    }

    /// Decide, for every field state overlapping `user`, whether its open
    /// children can stay open, and hand the ones that cannot to `closer`.
    ///
    /// `next_child` is the color the traversal continues into, or `None`
    /// at the target. `projection` is set when the target is reached by a
    /// projection access.
    pub fn siphon_logical_children(
        &mut self,
        env: &AnalysisEnv<'_>,
        closer: &mut LogicalCloser,
        user: &LogicalUser,
        next_child: Option<Color>,
        projection: Option<&ProjectionInfo>,
    ) -> Siphon {
        let mut siphon = Siphon::default();
        let node = self.node;
        let disjoint_partition = env.tree.is_disjoint_partition(node);
        let usage = user.usage;
        let states = std::mem::take(&mut self.field_states);
        let mut kept: Vec<FieldState> = Vec::with_capacity(states.len());

        for mut state in states {
            let overlap = state.valid_fields & user.mask;
            if overlap.is_empty() {
                kept.push(state);
                continue;
            }
            match state.open_state {
                OpenState::NotOpen => {}
                OpenState::ReadOnly => {
                    if !usage.is_read_only() {
                        let children: Vec<(Color, FieldMask)> =
                            state.open_children.iter().map(|(c, m)| (*c, *m & overlap)).collect();
                        for (color, fields) in children {
                            if fields.is_empty() {
                                continue;
                            }
                            if Some(color) != next_child {
                                if usage.is_write_discard() {
                                    closer.record_overwriting_close(fields);
                                }
                                closer.close_child(env, CloseKind::ReadOnly, color, fields);
                            }
                            // The path child is upgraded by reopening it in
                            // the incoming mode.
                            state.filter_child(color, fields);
                        }
                    }
                }
                OpenState::ReadWrite => {
                    let children: Vec<(Color, FieldMask)> =
                        state.open_children.iter().map(|(c, m)| (*c, *m & overlap)).collect();
                    for (color, fields) in children {
                        if fields.is_empty() {
                            continue;
                        }
                        let keep = match next_child {
                            Some(next) => next == color || env.tree.are_children_disjoint(node, next, color),
                            None => projection.is_some() && disjoint_partition && usage.is_read_only(),
                        };
                        if keep {
                            continue;
                        }
                        let kind = if next_child.is_none() && projection.is_some() && disjoint_partition {
                            CloseKind::Disjoint
                        } else {
                            CloseKind::Normal
                        };
                        closer.close_child(env, kind, color, fields);
                        state.filter_child(color, fields);
                    }
                }
                OpenState::SingleReduce | OpenState::MultiReduce => {
                    let same_reduction = usage.is_reduce() && usage.redop == state.redop;
                    if !same_reduction {
                        let children: Vec<(Color, FieldMask)> =
                            state.open_children.iter().map(|(c, m)| (*c, *m & overlap)).collect();
                        let upgrade = state.open_state == OpenState::SingleReduce && next_child.is_some();
                        for (color, fields) in children {
                            if fields.is_empty() {
                                continue;
                            }
                            if !(upgrade && Some(color) == next_child) {
                                closer.close_child(env, CloseKind::Normal, color, fields);
                            }
                            state.filter_child(color, fields);
                        }
                    }
                }
                OpenState::ReadOnlyProj => {
                    if !usage.is_read_only() {
                        if usage.is_write_discard() {
                            closer.record_overwriting_close(overlap);
                        }
                        closer.record_projection_close(CloseKind::ReadOnly, overlap);
                        closer.close_all_children(env, CloseKind::ReadOnly, overlap);
                        state.filter(overlap);
                    }
                }
                OpenState::ReadWriteProj
                | OpenState::ReadWriteProjDisjointShallow
                | OpenState::ReduceProj
                | OpenState::ReduceProjDirty => {
                    let keep_reduction =
                        state.open_state.is_reduce() && usage.is_reduce() && usage.redop == state.redop && next_child.is_some();
                    let elide = match projection {
                        Some(info) if next_child.is_none() && env.config.enable_close_elision => {
                            state.can_elide_close_operation(&info.summary(), &usage, node, env.tree)
                        }
                        _ => false,
                    };
                    if elide {
                        if !usage.is_read_only() {
                            if let Some(info) = projection {
                                state.record_projection_summary(info.summary());
                            }
                        }
                        siphon.elided |= overlap;
                        tracing::trace!(node = ?node, mask = ?overlap, "elided projection close");
                    } else if !keep_reduction {
                        let kind = if disjoint_partition && (next_child.is_some() || projection.is_some()) {
                            CloseKind::Disjoint
                        } else {
                            CloseKind::Normal
                        };
                        self.record_closed_projections(closer, overlap);
                        closer.record_projection_close(kind, overlap);
                        closer.close_all_children(env, kind, overlap);
                        state.filter(overlap);
                    }
                }
            }
            if !state.valid_fields.is_empty() {
                kept.push(state);
            }
        }
        self.field_states = kept;
        return siphon;
    }

    /// Pending reductions at this node that `user` does not share must be
    /// flushed before it proceeds.
    pub fn flush_outstanding_reductions(&mut self, closer: &mut LogicalCloser, user: &LogicalUser) {
        let mut flush = FieldMask::EMPTY;
        self.outstanding_reductions.retain(|redop, fields| {
            if user.usage.is_reduce() && user.usage.redop == *redop {
                return true;
            }
            let overlap = *fields & user.mask;
            flush |= overlap;
            *fields -= overlap;
            return !fields.is_empty();
        });
        if !flush.is_empty() {
            self.reduction_fields -= flush;
            closer.record_flush_only_close(flush);
        }
    }

    // ===================================================================
    // Projection epochs
    // ===================================================================

    /// Record in `info` the epoch of every field of `mask`, opening the
    /// first epoch for fields that have none.
    pub fn capture_projection_epochs(&mut self, mask: FieldMask, info: &mut ProjectionInfo) {
        let mut remaining = mask;
        for epoch in &self.projection_epochs {
            let overlap = epoch.valid_fields & remaining;
            if overlap.is_empty() {
                continue;
            }
            info.record_projection_epoch(epoch.epoch_id, overlap);
            remaining -= overlap;
        }
        if !remaining.is_empty() {
            self.projection_epochs.push(ProjectionEpoch::new(FIRST_EPOCH, remaining));
            info.record_projection_epoch(FIRST_EPOCH, remaining);
        }
    }

    /// Start the next epoch for the fields of `mask`.
    pub fn advance_projection_epochs(&mut self, mask: FieldMask) {
        let mut advanced = Vec::new();
        self.projection_epochs.retain_mut(|epoch| {
            let overlap = epoch.valid_fields & mask;
            if overlap.is_empty() {
                return true;
            }
            advanced.push(ProjectionEpoch::new(epoch.epoch_id + 1, overlap));
            epoch.valid_fields -= overlap;
            return !epoch.valid_fields.is_empty();
        });
        for epoch in advanced {
            match self.projection_epochs.iter_mut().find(|e| {
                e.epoch_id == epoch.epoch_id && e.write_projections.is_empty() && e.reduce_projections.is_empty()
            }) {
                Some(existing) => existing.valid_fields |= epoch.valid_fields,
                None => self.projection_epochs.push(epoch),
            }
        }
    }

    pub fn update_projection_epochs(&mut self, mask: FieldMask, info: &ProjectionInfo, reduce: bool) {
        let summary = info.summary();
        for epoch in &mut self.projection_epochs {
            if !epoch.valid_fields.intersects(mask) {
                continue;
            }
            if reduce {
                epoch.insert_reduce(summary);
            } else {
                epoch.insert_write(summary);
            }
        }
    }

    /// Fields of `mask` written by a projection in their current epoch.
    pub fn find_projection_writes(&self, mask: FieldMask) -> FieldMask {
        return self
            .projection_epochs
            .iter()
            .filter(|e| !e.write_projections.is_empty())
            .fold(FieldMask::EMPTY, |acc, e| acc | (e.valid_fields & mask));
    }

    pub fn record_closed_projections(&self, closer: &mut LogicalCloser, mask: FieldMask) {
        for epoch in &self.projection_epochs {
            epoch.record_closed_projections(closer, self.node, mask);
        }
    }
}

/// Test `user` against `users` for the fields of `check_mask`, returning the
/// fields it dominates.
fn perform_dependence_checks(
    users: &mut Vec<LogicalUser>,
    user: &LogicalUser,
    check_mask: FieldMask,
    commits: &CommitSet,
    timeout: u32,
    out: &mut Vec<Dependence>,
) -> FieldMask {
    let mut dominator = check_mask;
    let mut observed = FieldMask::EMPTY;
    users.retain_mut(|prev| {
        let overlap = prev.mask & check_mask;
        if overlap.is_empty() {
            if prev.timeout == 0 {
                if commits.is_committed(prev.op) {
                    tracing::trace!(op = ?prev.op, "pruned committed user");
                    return false;
                }
                prev.timeout = timeout;
            } else {
                prev.timeout -= 1;
            }
            return true;
        }
        if prev.op == user.op {
            return true;
        }
        observed |= overlap;
        let dtype = check_dependence_type(&prev.usage, &user.usage);
        if dtype == DependenceType::None {
            dominator -= overlap;
            return true;
        }
        if commits.is_committed(prev.op) {
            tracing::trace!(op = ?prev.op, "pruned committed user");
            return false;
        }
        tracing::trace!(prev = ?prev.op, next = ?user.op, kind = ?dtype, mask = ?overlap, "dependence");
        out.push(Dependence::between(prev, user, dtype, overlap));
        return true;
    });
    return dominator & observed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::OpRef;
    use crate::primitives::RegionUsage;

    fn f(fields: &[u32]) -> FieldMask {
        return FieldMask::from_fields(fields);
    }

    fn user(op: u64, usage: RegionUsage, mask: FieldMask) -> LogicalUser {
        return LogicalUser::new(OpRef::new(op, 0), 0, usage, mask, 4);
    }

    #[test]
    fn dominated_fields_retire_users() {
        let commits = CommitSet::new();
        let mut state = LogicalState::new(NodeId(0));
        let mut deps = Vec::new();

        let w = user(1, RegionUsage::read_write(), f(&[0, 1]));
        state.perform_dependence_analysis(&w, true, &commits, 4, &mut deps);
        state.record_user(w);
        assert!(deps.is_empty());

        let r = user(2, RegionUsage::read_only(), f(&[0]));
        state.perform_dependence_analysis(&r, true, &commits, 4, &mut deps);
        state.record_user(r);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].mask, f(&[0]));
        assert_eq!(state.prev_epoch_users.len(), 1);
        assert_eq!(state.prev_epoch_users[0].mask, f(&[0]));
        assert_eq!(state.curr_epoch_users.len(), 2);
    }

    #[test]
    fn readers_do_not_dominate() {
        let commits = CommitSet::new();
        let mut state = LogicalState::new(NodeId(0));
        let mut deps = Vec::new();
        state.record_user(user(1, RegionUsage::read_only(), f(&[0])));
        let r = user(2, RegionUsage::read_only(), f(&[0]));
        state.perform_dependence_analysis(&r, true, &commits, 4, &mut deps);
        assert!(deps.is_empty());
        assert!(state.prev_epoch_users.is_empty());
    }

    #[test]
    fn expired_users_are_tested_against_commits() {
        let commits = CommitSet::new();
        let mut state = LogicalState::new(NodeId(0));
        let mut deps = Vec::new();
        state.record_user(LogicalUser::new(OpRef::new(1, 0), 0, RegionUsage::read_write(), f(&[0]), 1));
        state.record_user(LogicalUser::new(OpRef::new(2, 0), 0, RegionUsage::read_write(), f(&[1]), 1));
        commits.commit(OpRef::new(1, 0));

        let bystander = user(3, RegionUsage::read_only(), f(&[5]));
        state.perform_dependence_analysis(&bystander, false, &commits, 7, &mut deps);
        assert_eq!(state.curr_epoch_users.len(), 2);
        state.perform_dependence_analysis(&bystander, false, &commits, 7, &mut deps);
        assert_eq!(state.curr_epoch_users.len(), 1);
        assert_eq!(state.curr_epoch_users[0].op, OpRef::new(2, 0));
        assert_eq!(state.curr_epoch_users[0].timeout, 7);
        assert!(deps.is_empty());
    }

    #[test]
    fn committed_predecessors_are_pruned_without_dependence() {
        let commits = CommitSet::new();
        let mut state = LogicalState::new(NodeId(0));
        let mut deps = Vec::new();
        state.record_user(user(1, RegionUsage::read_write(), f(&[0])));
        commits.commit(OpRef::new(1, 0));
        let w = user(2, RegionUsage::read_write(), f(&[0]));
        state.perform_dependence_analysis(&w, true, &commits, 4, &mut deps);
        assert!(deps.is_empty());
        assert!(state.curr_epoch_users.is_empty());
    }

    #[test]
    fn rebuild_coalesces_states() {
        let mut state = LogicalState::new(NodeId(0));
        let usage = RegionUsage::read_only();
        state.field_states.push(FieldState::new_child(&usage, f(&[0]), 0, 1));
        state.field_states.push(FieldState::new_child(&usage, f(&[1]), 1, 1));
        assert_eq!(state.field_states.len(), 2);
        state.merge_new_field_state(FieldState::new_child(&usage, f(&[2]), 2, 1), 3);
        assert_eq!(state.field_states.len(), 1);
        assert_eq!(state.field_states[0].valid_fields, f(&[0, 1, 2]));
        assert_eq!(state.field_states[0].rebuild_timeout, 3);
    }

    #[test]
    fn projection_epochs_advance_per_field() {
        let mut state = LogicalState::new(NodeId(0));
        let mut info = ProjectionInfo::new(
            crate::logical::projection::ProjectionFunction::Identity,
            crate::logical::projection::Domain::new(0, 3),
        );
        state.capture_projection_epochs(f(&[0, 1]), &mut info);
        assert_eq!(info.projection_epochs().get(&FIRST_EPOCH), Some(&f(&[0, 1])));

        state.update_projection_epochs(f(&[0, 1]), &info, false);
        assert_eq!(state.find_projection_writes(f(&[0, 1, 2])), f(&[0, 1]));

        state.advance_projection_epochs(f(&[1]));
        let mut next = info.clone();
        next.clear_epochs();
        state.capture_projection_epochs(f(&[0, 1]), &mut next);
        assert_eq!(next.projection_epochs().get(&FIRST_EPOCH), Some(&f(&[0])));
        assert_eq!(next.projection_epochs().get(&(FIRST_EPOCH + 1)), Some(&f(&[1])));
        assert_eq!(state.find_projection_writes(f(&[1])), FieldMask::EMPTY);
    }

    #[test]
    fn deleted_fields_vanish() {
        let mut state = LogicalState::new(NodeId(0));
        state.record_user(user(1, RegionUsage::reduce(2), f(&[0, 1])));
        state.dirty_below = f(&[0, 1]);
        state.clear_deleted_state(f(&[0]));
        assert_eq!(state.curr_epoch_users[0].mask, f(&[1]));
        assert_eq!(state.outstanding_reductions.get(&2), Some(&f(&[1])));
        assert_eq!(state.dirty_below, f(&[1]));
        state.clear_deleted_state(f(&[1]));
        assert!(state.is_clean());
    }
}
