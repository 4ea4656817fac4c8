//! Close-operation synthesis.
//!
//! While an access walks down its path, each node it visits may have open
//! children that conflict with it. The [`LogicalCloser`] for that node
//! collects the fields to close in four categories and, once the node's
//! field states have been siphoned, synthesizes at most one [`CloseOp`] per
//! category, however many children were involved.
//!
//! | category | trigger | data movement |
//! |---|---|---|
//! | normal | read-write or reduce children conflict | children folded into the node |
//! | read-only | read-only children meet a writer | none, ordering only |
//! | flush-only | pending reductions at the node meet another usage | reductions applied |
//! | disjoint | a projection over a disjoint partition meets open children | only the disjoint children |
//!
//! Closing a child walks its whole subtree: every user below is captured as
//! a predecessor of the close, and the subtree's logical state for the
//! closed fields is cleared. A [`CompositeViewSummary`] of what the closed
//! children had written is attached to the close so that a composite view
//! can be reconstructed later without rereading the tree.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::logical::AnalysisEnv;
use crate::logical::projection::ShardingSummary;
use crate::logical::state::LogicalState;
use crate::logical::traverse::NodeVisitor;
use crate::logical::traverse::traverse_node;
use crate::logical::user::Dependence;
use crate::logical::user::LogicalUser;
use crate::pool::StateTable;
use crate::primitives::Color;
use crate::primitives::ContextId;
use crate::primitives::DependenceType;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::OpRef;
use crate::primitives::RegionTree;
use crate::primitives::RegionUsage;
use crate::primitives::ShardId;
use crate::primitives::check_dependence_type;

use parking_lot::Mutex;

/// Category of a synthesized close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CloseKind {
    Normal,
    ReadOnly,
    FlushOnly,
    Disjoint,
}

impl CloseKind {
    pub const ALL: [CloseKind; 4] = [CloseKind::Normal, CloseKind::ReadOnly, CloseKind::FlushOnly, CloseKind::Disjoint];

    fn index(self) -> usize {
        match self {
            CloseKind::Normal => return 0,
            CloseKind::ReadOnly => return 1,
            CloseKind::FlushOnly => return 2,
            CloseKind::Disjoint => return 3,
        }
    }

    /// Usage the close registers with at the closed node.
    pub fn usage(self) -> RegionUsage {
        match self {
            CloseKind::ReadOnly => return RegionUsage::read_only(),
            _ => return RegionUsage::read_write(),
        }
    }
}

/// Nodes of a subtree with the fields written at each.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteSet {
    writes: BTreeMap<NodeId, FieldMask>,
}

impl WriteSet {
    pub fn insert(&mut self, node: NodeId, mask: FieldMask) {
        if !mask.is_empty() {
            *self.writes.entry(node).or_default() |= mask;
        }
    }

    pub fn get(&self, node: NodeId) -> FieldMask {
        return self.writes.get(&node).copied().unwrap_or_default();
    }

    pub fn valid_mask(&self) -> FieldMask {
        return self.writes.values().fold(FieldMask::EMPTY, |acc, m| acc | *m);
    }

    pub fn is_empty(&self) -> bool {
        return self.writes.is_empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, FieldMask)> + '_ {
        return self.writes.iter().map(|(n, m)| (*n, *m));
    }

    /// Entries restricted to `mask`.
    pub fn filtered(&self, mask: FieldMask) -> WriteSet {
        let mut out = WriteSet::default();
        for (node, fields) in self.iter() {
            out.insert(node, fields & mask);
        }
        return out;
    }

    pub fn merge(&mut self, other: &WriteSet) {
        for (node, fields) in other.iter() {
            self.insert(node, fields);
        }
    }
}

/// What the closed children had written, per field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompositeViewSummary {
    /// Fields written at the root of some closed child.
    pub complete_writes: FieldMask,
    /// Fields written somewhere below the root of a closed child.
    pub partial_writes: WriteSet,
    pub write_projections: Vec<(ShardingSummary, FieldMask)>,
    pub reduce_projections: Vec<(ShardingSummary, FieldMask)>,
}

impl CompositeViewSummary {
    pub fn is_empty(&self) -> bool {
        return self.complete_writes.is_empty()
            && self.partial_writes.is_empty()
            && self.write_projections.is_empty()
            && self.reduce_projections.is_empty();
    }

    /// Every field the summary says was written.
    pub fn written_fields(&self) -> FieldMask {
        let mut mask = self.complete_writes | self.partial_writes.valid_mask();
        for (_, fields) in self.write_projections.iter().chain(self.reduce_projections.iter()) {
            mask |= *fields;
        }
        return mask;
    }

    fn filtered(&self, mask: FieldMask) -> CompositeViewSummary {
        let keep = |list: &Vec<(ShardingSummary, FieldMask)>| -> Vec<(ShardingSummary, FieldMask)> {
            return list
                .iter()
                .filter(|(_, m)| m.intersects(mask))
                .map(|(s, m)| (*s, *m & mask))
                .collect();
        };
        return CompositeViewSummary {
            complete_writes: self.complete_writes & mask,
            partial_writes: self.partial_writes.filtered(mask),
            write_projections: keep(&self.write_projections),
            reduce_projections: keep(&self.reduce_projections),
        };
    }
}

/// A close synthesized by the logical analysis.
#[derive(Clone, Debug)]
pub struct CloseOp {
    pub op: OpRef,
    pub kind: CloseKind,
    pub node: NodeId,
    pub mask: FieldMask,
    /// The operation whose access triggered the close.
    pub creator: OpRef,
    pub creator_index: u32,
    pub closed_children: BTreeMap<Color, FieldMask>,
    /// Read-only fields being closed because the creator discards them.
    pub overwriting: FieldMask,
    /// Fields that closed a projection at the node.
    pub closed_projections: FieldMask,
    pub summary: CompositeViewSummary,
    /// Predecessors of the close.
    pub dependences: Vec<Dependence>,
    /// Shards of a replicated context whose projections the close covers.
    pub interfering_shards: BTreeSet<ShardId>,
}

impl CloseOp {
    /// The user the close registers at its node.
    pub fn user(&self, timeout: u32) -> LogicalUser {
        return LogicalUser::new(self.op, 0, self.kind.usage(), self.mask, timeout);
    }
}

#[derive(Debug, Default)]
struct Category {
    mask: FieldMask,
    children: BTreeMap<Color, FieldMask>,
    closed_users: Vec<LogicalUser>,
    summary: CompositeViewSummary,
}

/// Accumulates the closes required at one node of a traversal.
#[derive(Debug)]
pub struct LogicalCloser {
    pub node: NodeId,
    creator: OpRef,
    creator_index: u32,
    replicated: bool,
    categories: [Category; 4],
    overwriting: FieldMask,
    closed_projections: FieldMask,
    write_projections: Vec<(ShardingSummary, FieldMask)>,
    reduce_projections: Vec<(ShardingSummary, FieldMask)>,
}

impl LogicalCloser {
    pub fn new(node: NodeId, user: &LogicalUser, replicated: bool) -> LogicalCloser {
        return LogicalCloser {
            node,
            creator: user.op,
            creator_index: user.index,
            replicated,
            categories: Default::default(),
            overwriting: FieldMask::EMPTY,
            closed_projections: FieldMask::EMPTY,
            write_projections: Vec::new(),
            reduce_projections: Vec::new(),
        };
    }

    pub fn has_close_operations(&self) -> bool {
        return self.categories.iter().any(|c| !c.mask.is_empty());
    }

    pub fn close_mask(&self, kind: CloseKind) -> FieldMask {
        return self.categories[kind.index()].mask;
    }

    pub fn closed_projections(&self) -> FieldMask {
        return self.closed_projections;
    }

    pub fn record_close_operation(&mut self, kind: CloseKind, mask: FieldMask) {
        self.categories[kind.index()].mask |= mask;
    }

    /// A read-only close made necessary by a write-discard access.
    pub fn record_overwriting_close(&mut self, mask: FieldMask) {
        self.record_close_operation(CloseKind::ReadOnly, mask);
        self.overwriting |= mask;
    }

    pub fn record_flush_only_close(&mut self, mask: FieldMask) {
        self.record_close_operation(CloseKind::FlushOnly, mask);
    }

    /// Fields closing a projection open at this node.
    pub fn record_projection_close(&mut self, kind: CloseKind, mask: FieldMask) {
        self.record_close_operation(kind, mask);
        if kind != CloseKind::ReadOnly {
            self.closed_projections |= mask;
        }
    }

    pub fn record_closed_user(&mut self, kind: CloseKind, user: LogicalUser) {
        self.categories[kind.index()].closed_users.push(user);
    }

    pub fn record_write_projection(&mut self, summary: ShardingSummary, mask: FieldMask) {
        if self.replicated {
            self.write_projections.push((summary, mask));
        }
    }

    pub fn record_reduce_projection(&mut self, summary: ShardingSummary, mask: FieldMask) {
        if self.replicated {
            self.reduce_projections.push((summary, mask));
        }
    }

    /// Close `mask` of the child with `color`: capture every user of its
    /// subtree and clear the subtree's state for those fields.
    pub fn close_child(&mut self, env: &AnalysisEnv<'_>, kind: CloseKind, color: Color, mask: FieldMask) {
        if mask.is_empty() {
            return;
        }
        self.record_close_operation(kind, mask);
        let category = &mut self.categories[kind.index()];
        *category.children.entry(color).or_default() |= mask;
        let Some(child) = env.tree.child(self.node, color) else {
            return;
        };
        let mut subtree = SubtreeCloser {
            tree: env.tree,
            states: env.states,
            ctx: env.ctx,
            root: child,
            mask,
            users: &mut category.closed_users,
            summary: &mut category.summary,
        };
        traverse_node(env.tree, child, &mut subtree);
    }

    /// Close `mask` on every child that has logical state. Used for
    /// projection states, which do not track their children individually.
    pub fn close_all_children(&mut self, env: &AnalysisEnv<'_>, kind: CloseKind, mask: FieldMask) {
        for (color, child) in env.tree.children(self.node) {
            if env.states.contains(child, env.ctx) {
                self.close_child(env, kind, color, mask);
            }
        }
    }

    /// Synthesize the closes, computing each one's predecessors from the
    /// captured users and the users registered at the node itself.
    pub fn initialize_close_operations(&mut self, env: &AnalysisEnv<'_>, state: &LogicalState) -> Vec<CloseOp> {
        let mut closes = Vec::new();
        for kind in CloseKind::ALL {
            let category = &mut self.categories[kind.index()];
            if category.mask.is_empty() {
                continue;
            }
            let op = env.ids.next_close_op();
            let usage = kind.usage();
            let close_user = LogicalUser::new(op, 0, usage, category.mask, env.config.logical_user_timeout);

            let mut dependences = Vec::new();
            for user in category.closed_users.drain(..) {
                let overlap = user.mask & category.mask;
                if !overlap.is_empty() {
                    dependences.push(Dependence::between(&user, &close_user, DependenceType::True, overlap));
                }
            }
            for user in state.curr_epoch_users.iter().chain(state.prev_epoch_users.iter()) {
                let overlap = user.mask & category.mask;
                if overlap.is_empty() || user.op == self.creator {
                    continue;
                }
                let dtype = check_dependence_type(&user.usage, &usage);
                if dtype != DependenceType::None {
                    dependences.push(Dependence::between(user, &close_user, dtype, overlap));
                }
            }

            let mut summary = std::mem::take(&mut category.summary);
            if matches!(kind, CloseKind::Normal | CloseKind::Disjoint) {
                for (sharding, fields) in &self.write_projections {
                    let overlap = *fields & category.mask;
                    if !overlap.is_empty() {
                        summary.write_projections.push((*sharding, overlap));
                    }
                }
                for (sharding, fields) in &self.reduce_projections {
                    let overlap = *fields & category.mask;
                    if !overlap.is_empty() {
                        summary.reduce_projections.push((*sharding, overlap));
                    }
                }
            }
            let summary = summary.filtered(category.mask);
            let interfering_shards = summary
                .write_projections
                .iter()
                .chain(summary.reduce_projections.iter())
                .flat_map(|(s, _)| s.interfering_shards(env.tree))
                .collect();

            tracing::debug!(
                node = ?self.node,
                ctx = ?env.ctx,
                kind = ?kind,
                mask = ?category.mask,
                predecessors = dependences.len(),
                "synthesized close"
            );
            closes.push(CloseOp {
                op,
                kind,
                node: self.node,
                mask: category.mask,
                creator: self.creator,
                creator_index: self.creator_index,
                closed_children: std::mem::take(&mut category.children),
                overwriting: if kind == CloseKind::ReadOnly { self.overwriting } else { FieldMask::EMPTY },
                closed_projections: if kind == CloseKind::ReadOnly {
                    FieldMask::EMPTY
                } else {
                    self.closed_projections & category.mask
                },
                summary,
                dependences,
                interfering_shards,
            });
        }
        return closes;
    }

    /// Update the node's state once the closes exist: closed projections
    /// start a new epoch and the closes become users of the node.
    pub fn update_state(&self, state: &mut LogicalState, closes: &[CloseOp], timeout: u32) {
        if !self.closed_projections.is_empty() {
            state.advance_projection_epochs(self.closed_projections);
        }
        for close in closes {
            if close.kind == CloseKind::Normal || close.kind == CloseKind::Disjoint {
                state.dirty_below -= close.mask;
            }
            state.curr_epoch_users.push(close.user(timeout));
        }
    }
}

/// Visitor that closes a subtree for some fields.
struct SubtreeCloser<'a> {
    tree: &'a dyn RegionTree,
    states: &'a StateTable<Mutex<LogicalState>>,
    ctx: ContextId,
    root: NodeId,
    mask: FieldMask,
    users: &'a mut Vec<LogicalUser>,
    summary: &'a mut CompositeViewSummary,
}

impl SubtreeCloser<'_> {
    fn close_node(&mut self, node: NodeId) -> bool {
        let Some(handle) = self.states.get(node, self.ctx) else {
            return false;
        };
        let mut state = handle.lock();
        for user in state.curr_epoch_users.iter().chain(state.prev_epoch_users.iter()) {
            let overlap = user.mask & self.mask;
            if !overlap.is_empty() {
                self.users.push(user.with_mask(overlap));
            }
        }
        let written = state.write_fields & self.mask;
        if node == self.root {
            self.summary.complete_writes |= written;
        } else {
            self.summary.partial_writes.insert(node, written);
        }
        state.clear_fields(self.mask);
        debug_assert!(self.tree.depth(node) > self.tree.depth(self.root) || node == self.root);
        return true;
    }
}

impl NodeVisitor for SubtreeCloser<'_> {
    fn visit_only_valid(&self) -> bool {
        return true;
    }

    fn is_valid(&self, node: NodeId) -> bool {
        return self.states.contains(node, self.ctx);
    }

    fn visit_region(&mut self, node: NodeId) -> bool {
        return self.close_node(node);
    }

    fn visit_partition(&mut self, node: NodeId) -> bool {
        return self.close_node(node);
    }
}
