//! Tree traversals.
//!
//! A traversal strategy implements [`NodeVisitor`]; the drivers
//! [`traverse_path`] (down one path) and [`traverse_node`] (a whole subtree)
//! dispatch on the node kind and honor the visitor's early-stop signal.
//! Visiting returns whether to continue below the visited node.

use parking_lot::Mutex;

use crate::logical::state::LogicalState;
use crate::logical::user::Dependence;
use crate::logical::user::LogicalUser;
use crate::pool::StateTable;
use crate::primitives::ContextId;
use crate::primitives::DependenceType;
use crate::primitives::Event;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::NodeKind;
use crate::primitives::RegionTree;
use crate::primitives::RegionTreePath;
use crate::primitives::check_dependence_type;
use crate::runtime::Services;
use crate::version::manager::VersionManager;

pub trait NodeVisitor {
    /// Skip children for which [`NodeVisitor::is_valid`] is false.
    fn visit_only_valid(&self) -> bool {
        return false;
    }

    fn is_valid(&self, _node: NodeId) -> bool {
        return true;
    }

    /// Abort the whole traversal after the current visit.
    fn break_early(&self) -> bool {
        return false;
    }

    fn visit_region(&mut self, node: NodeId) -> bool;

    fn visit_partition(&mut self, node: NodeId) -> bool;
}

fn visit<V: NodeVisitor + ?Sized>(tree: &dyn RegionTree, node: NodeId, visitor: &mut V) -> bool {
    match tree.kind(node) {
        NodeKind::Region => return visitor.visit_region(node),
        NodeKind::Partition { .. } => return visitor.visit_partition(node),
    }
}

/// Visit `start` and every descendant in color order. Returns false if the
/// visitor stopped the traversal early.
pub fn traverse_node<V: NodeVisitor + ?Sized>(tree: &dyn RegionTree, start: NodeId, visitor: &mut V) -> bool {
    let descend = visit(tree, start, visitor);
    if visitor.break_early() {
        return false;
    }
    if !descend {
        return true;
    }
    for (_, child) in tree.children(start) {
        if visitor.visit_only_valid() && !visitor.is_valid(child) {
            continue;
        }
        if !traverse_node(tree, child, visitor) {
            return false;
        }
    }
    return true;
}

/// Visit the nodes of `path` starting at `start`, which must sit at the
/// path's minimum depth.
pub fn traverse_path<V: NodeVisitor + ?Sized>(
    tree: &dyn RegionTree,
    path: &RegionTreePath,
    start: NodeId,
    visitor: &mut V,
) -> bool {
    let mut node = start;
    let mut depth = tree.depth(start);
    debug_assert_eq!(depth, path.min_depth());
    loop {
        let descend = visit(tree, node, visitor);
        if visitor.break_early() {
            return false;
        }
        if !descend {
            return true;
        }
        let Some(color) = path.get_child(depth) else {
            return true;
        };
        let Some(child) = tree.child(node, color) else {
            return true;
        };
        node = child;
        depth += 1;
    }
}

fn record_dependences(state: &LogicalState, user: &LogicalUser, out: &mut Vec<Dependence>) {
    for prev in state.curr_epoch_users.iter().chain(state.prev_epoch_users.iter()) {
        let overlap = prev.mask & user.mask;
        if overlap.is_empty() || prev.op == user.op {
            continue;
        }
        let dtype = check_dependence_type(&prev.usage, &user.usage);
        if dtype != DependenceType::None {
            out.push(Dependence::between(prev, user, dtype, overlap));
        }
    }
}

/// Register `user` against every user of a subtree, optionally retiring
/// them (for operations such as deletions that dominate the subtree).
pub struct LogicalRegistrar<'a> {
    pub states: &'a StateTable<Mutex<LogicalState>>,
    pub ctx: ContextId,
    pub user: &'a LogicalUser,
    pub dominate: bool,
    pub dependences: Vec<Dependence>,
}

impl LogicalRegistrar<'_> {
    fn register(&mut self, node: NodeId) -> bool {
        let Some(handle) = self.states.get(node, self.ctx) else {
            return false;
        };
        let mut state = handle.lock();
        record_dependences(&state, self.user, &mut self.dependences);
        if self.dominate {
            state.filter_prev_epoch_users(self.user.mask);
            state.filter_curr_epoch_users(self.user.mask);
        }
        return true;
    }
}

impl NodeVisitor for LogicalRegistrar<'_> {
    fn visit_only_valid(&self) -> bool {
        return true;
    }

    fn is_valid(&self, node: NodeId) -> bool {
        return self.states.contains(node, self.ctx);
    }

    fn visit_region(&mut self, node: NodeId) -> bool {
        return self.register(node);
    }

    fn visit_partition(&mut self, node: NodeId) -> bool {
        return self.register(node);
    }
}

/// Register `user` against the users along a path, without retiring them.
pub struct LogicalPathRegistrar<'a> {
    pub states: &'a StateTable<Mutex<LogicalState>>,
    pub ctx: ContextId,
    pub user: &'a LogicalUser,
    pub dependences: Vec<Dependence>,
}

impl LogicalPathRegistrar<'_> {
    fn register(&mut self, node: NodeId) -> bool {
        if let Some(handle) = self.states.get(node, self.ctx) {
            record_dependences(&handle.lock(), self.user, &mut self.dependences);
        }
        return true;
    }
}

impl NodeVisitor for LogicalPathRegistrar<'_> {
    fn visit_region(&mut self, node: NodeId) -> bool {
        return self.register(node);
    }

    fn visit_partition(&mut self, node: NodeId) -> bool {
        return self.register(node);
    }
}

/// Make sure a context starts from clean logical state on a subtree.
pub struct CurrentInitializer<'a> {
    pub states: &'a StateTable<Mutex<LogicalState>>,
    pub ctx: ContextId,
}

impl CurrentInitializer<'_> {
    fn initialize(&mut self, node: NodeId) -> bool {
        let handle = self.states.get_or_create(node, self.ctx, || Mutex::new(LogicalState::new(node)));
        debug_assert!(handle.lock().is_clean(), "context {:?} reused at {node:?} without reset", self.ctx);
        return true;
    }
}

impl NodeVisitor for CurrentInitializer<'_> {
    fn visit_region(&mut self, node: NodeId) -> bool {
        return self.initialize(node);
    }

    fn visit_partition(&mut self, node: NodeId) -> bool {
        return self.initialize(node);
    }
}

/// Clear a context's logical state on a subtree, or only its users.
pub struct CurrentInvalidator<'a> {
    pub states: &'a StateTable<Mutex<LogicalState>>,
    pub ctx: ContextId,
    pub users_only: bool,
}

impl CurrentInvalidator<'_> {
    fn invalidate(&mut self, node: NodeId) -> bool {
        let Some(handle) = self.states.get(node, self.ctx) else {
            return false;
        };
        let mut state = handle.lock();
        if self.users_only {
            state.clear_logical_users();
        } else {
            state.reset();
        }
        return true;
    }
}

impl NodeVisitor for CurrentInvalidator<'_> {
    fn visit_only_valid(&self) -> bool {
        return true;
    }

    fn is_valid(&self, node: NodeId) -> bool {
        return self.states.contains(node, self.ctx);
    }

    fn visit_region(&mut self, node: NodeId) -> bool {
        return self.invalidate(node);
    }

    fn visit_partition(&mut self, node: NodeId) -> bool {
        return self.invalidate(node);
    }
}

/// Remove deleted fields from a context's logical state on a subtree.
pub struct DeletionInvalidator<'a> {
    pub states: &'a StateTable<Mutex<LogicalState>>,
    pub ctx: ContextId,
    pub mask: FieldMask,
}

impl DeletionInvalidator<'_> {
    fn invalidate(&mut self, node: NodeId) -> bool {
        let Some(handle) = self.states.get(node, self.ctx) else {
            return false;
        };
        handle.lock().clear_deleted_state(self.mask);
        return true;
    }
}

impl NodeVisitor for DeletionInvalidator<'_> {
    fn visit_only_valid(&self) -> bool {
        return true;
    }

    fn is_valid(&self, node: NodeId) -> bool {
        return self.states.contains(node, self.ctx);
    }

    fn visit_region(&mut self, node: NodeId) -> bool {
        return self.invalidate(node);
    }

    fn visit_partition(&mut self, node: NodeId) -> bool {
        return self.invalidate(node);
    }
}

/// Drop the version managers of a context on a subtree, releasing their
/// version states and ownership.
pub struct VersioningInvalidator<'a> {
    pub managers: &'a StateTable<VersionManager>,
    pub services: &'a Services,
    pub ctx: ContextId,
    pub reset: usize,
    /// One event per reset manager, complete once its remote copies are gone.
    pub invalidated: Vec<Event>,
}

impl VersioningInvalidator<'_> {
    fn invalidate(&mut self, node: NodeId) -> bool {
        let Some(manager) = self.managers.remove(node, self.ctx) else {
            return true;
        };
        self.invalidated.push(manager.reset(self.services));
        self.reset += 1;
        return true;
    }
}

impl NodeVisitor for VersioningInvalidator<'_> {
    fn visit_region(&mut self, node: NodeId) -> bool {
        return self.invalidate(node);
    }

    fn visit_partition(&mut self, node: NodeId) -> bool {
        return self.invalidate(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::RegionForest;

    struct Recorder {
        seen: Vec<NodeId>,
        stop_at: Option<NodeId>,
        prune: Option<NodeId>,
    }

    impl Recorder {
        fn visit(&mut self, node: NodeId) -> bool {
            self.seen.push(node);
            return self.prune != Some(node);
        }
    }

    impl NodeVisitor for Recorder {
        fn break_early(&self) -> bool {
            return self.stop_at.is_some() && self.seen.last() == self.stop_at.as_ref();
        }

        fn visit_region(&mut self, node: NodeId) -> bool {
            return self.visit(node);
        }

        fn visit_partition(&mut self, node: NodeId) -> bool {
            return self.visit(node);
        }
    }

    fn tree() -> (RegionForest, NodeId, NodeId, Vec<NodeId>) {
        let forest = RegionForest::new();
        let root = forest.create_region();
        let (part, subs) = forest.create_partition_with(root, 0, true, 3);
        return (forest, root, part, subs);
    }

    #[test]
    fn subtree_traversal_is_preorder() {
        let (forest, root, part, subs) = tree();
        let mut recorder = Recorder { seen: Vec::new(), stop_at: None, prune: None };
        assert!(traverse_node(&forest, root, &mut recorder));
        assert_eq!(recorder.seen, vec![root, part, subs[0], subs[1], subs[2]]);
    }

    #[test]
    fn pruning_and_early_stop() {
        let (forest, root, part, subs) = tree();
        let mut pruned = Recorder { seen: Vec::new(), stop_at: None, prune: Some(part) };
        assert!(traverse_node(&forest, root, &mut pruned));
        assert_eq!(pruned.seen, vec![root, part]);

        let mut stopped = Recorder { seen: Vec::new(), stop_at: Some(subs[1]), prune: None };
        assert!(!traverse_node(&forest, root, &mut stopped));
        assert_eq!(stopped.seen.last(), Some(&subs[1]));
    }

    #[test]
    fn path_traversal_follows_colors() {
        let (forest, root, part, subs) = tree();
        let path = RegionTreePath::from_nodes(&forest, &[root, part, subs[2]]);
        let mut recorder = Recorder { seen: Vec::new(), stop_at: None, prune: None };
        assert!(traverse_path(&forest, &path, root, &mut recorder));
        assert_eq!(recorder.seen, vec![root, part, subs[2]]);
    }
}
