//! Logical dependence analysis.
//!
//! An operation's region requirement walks from its context's upper-bound
//! node down to its target. At every node on the way the analysis:
//!
//! 1. siphons the node's field states, handing conflicting open children to
//!    a [`LogicalCloser`](closer::LogicalCloser);
//! 2. flushes pending reductions the access does not share;
//! 3. synthesizes at most one close per category and registers the closes
//!    as users of the node;
//! 4. records the requirement's dependences on the node's users;
//! 5. opens the next child on the path, or, at the target, registers the
//!    user (and projection bookkeeping for projection accesses).
//!
//! Nodes are locked one at a time, top-down; closing a subtree locks
//! descendants of the locked node, so lock order always follows the tree.

pub mod closer;
pub mod field_state;
pub mod projection;
pub mod state;
pub mod traverse;
pub mod user;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::logical::closer::CloseOp;
use crate::logical::closer::LogicalCloser;
use crate::logical::field_state::FieldState;
use crate::logical::projection::ProjectionInfo;
use crate::logical::state::LogicalState;
use crate::logical::user::Dependence;
use crate::logical::user::LogicalUser;
use crate::pool::StateTable;
use crate::primitives::ContextId;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::OpRef;
use crate::primitives::RegionTree;
use crate::primitives::RegionUsage;
use crate::runtime::CommitSet;
use crate::runtime::IdAllocator;

/// One region requirement of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionRequirement {
    /// Upper bound of the analysis: the region the parent context owns.
    pub parent: NodeId,
    /// Region accessed, or the partition a projection is applied to.
    pub target: NodeId,
    pub usage: RegionUsage,
    pub mask: FieldMask,
    pub projection: Option<ProjectionInfo>,
}

impl RegionRequirement {
    pub fn new(parent: NodeId, target: NodeId, usage: RegionUsage, mask: FieldMask) -> RegionRequirement {
        return RegionRequirement { parent, target, usage, mask, projection: None };
    }

    pub fn with_projection(mut self, info: ProjectionInfo) -> RegionRequirement {
        self.projection = Some(info);
        return self;
    }
}

/// Result of the logical analysis of one requirement.
#[derive(Clone, Debug, Default)]
pub struct LogicalOutcome {
    pub dependences: Vec<Dependence>,
    pub closes: Vec<CloseOp>,
}

impl LogicalOutcome {
    /// Predecessors of the analyzed operation, deduplicated.
    pub fn predecessors(&self) -> Vec<OpRef> {
        let mut ops: Vec<OpRef> = self.dependences.iter().map(|d| d.prev).collect();
        ops.sort();
        ops.dedup();
        return ops;
    }
}

/// Everything the logical analysis reads besides the requirement.
pub struct AnalysisEnv<'a> {
    pub tree: &'a dyn RegionTree,
    pub states: &'a StateTable<Mutex<LogicalState>>,
    pub ctx: ContextId,
    pub config: &'a Config,
    pub commits: &'a CommitSet,
    pub ids: &'a IdAllocator,
}

impl AnalysisEnv<'_> {
    pub fn state(&self, node: NodeId) -> Arc<Mutex<LogicalState>> {
        return self.states.get_or_create(node, self.ctx, || Mutex::new(LogicalState::new(node)));
    }
}

/// Run the logical analysis of requirement `index` of `op`. Projection
/// epochs captured at the target are recorded in the requirement's
/// projection info.
pub fn register_logical_user(
    env: &AnalysisEnv<'_>,
    op: OpRef,
    index: u32,
    req: &mut RegionRequirement,
) -> Result<LogicalOutcome> {
    let nodes = env.tree.path(req.parent, req.target)?;
    let timeout = env.config.logical_user_timeout;
    let rebuild = env.config.field_state_rebuild_timeout;
    let user = LogicalUser::new(op, index, req.usage, req.mask, timeout);
    let mut outcome = LogicalOutcome::default();
    if let Some(info) = req.projection.as_mut() {
        info.clear_epochs();
    }

    for (depth, &node) in nodes.iter().enumerate() {
        let arrived = depth + 1 == nodes.len();
        let next_child = if arrived { None } else { Some(env.tree.color(nodes[depth + 1])) };
        let projection = if arrived { req.projection.clone() } else { None };

        let handle = env.state(node);
        let mut state = handle.lock();
        let mut closer = LogicalCloser::new(node, &user, env.config.is_replicated());
        let siphon = state.siphon_logical_children(env, &mut closer, &user, next_child, projection.as_ref());
        state.flush_outstanding_reductions(&mut closer, &user);
        if closer.has_close_operations() {
            let closes = closer.initialize_close_operations(env, &state);
            closer.update_state(&mut state, &closes, timeout);
            outcome.closes.extend(closes);
        }
        state.perform_dependence_analysis(&user, arrived, env.commits, timeout, &mut outcome.dependences);

        match next_child {
            Some(color) => {
                state.merge_new_field_state(FieldState::new_child(&user.usage, user.mask, color, rebuild), rebuild);
                if user.usage.modifies() {
                    state.dirty_below |= user.mask;
                }
            }
            None => {
                if let Some(info) = req.projection.as_mut() {
                    state.capture_projection_epochs(user.mask, info);
                    if user.usage.modifies() {
                        state.update_projection_epochs(user.mask, info, user.usage.is_reduce());
                        state.partial_writes |= user.mask;
                        state.dirty_below |= user.mask;
                    }
                    let open = user.mask - siphon.elided;
                    if !open.is_empty() {
                        let disjoint_shallow = env.tree.is_disjoint_partition(node) && info.projection.is_injective();
                        let opened = FieldState::new_projection(
                            &user.usage,
                            open,
                            info.summary(),
                            disjoint_shallow,
                            info.is_dirty_reduction(),
                            rebuild,
                        );
                        state.merge_new_field_state(opened, rebuild);
                    }
                }
                state.record_user(user.clone());
            }
        }
    }

    tracing::debug!(
        op = ?op,
        ctx = ?env.ctx,
        target = ?req.target,
        dependences = outcome.dependences.len(),
        closes = outcome.closes.len(),
        "registered logical user"
    );
    return Ok(outcome);
}
