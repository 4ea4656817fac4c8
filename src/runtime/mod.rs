//! The per-address-space driver.
//!
//! A [`Runtime`] owns the logical states and version managers its space
//! created, the version-state arena and the bookkeeping of outstanding
//! requests. It runs both analyses for the operations submitted to it and
//! handles every message other spaces send it.
//!
//! Messages are only ever sent with no state lock held, so a transport may
//! deliver on the sending thread and re-enter the runtime.
//!
//! Under [`DeliveryMode::Queued`](crate::transport::DeliveryMode::Queued)
//! nothing arrives until somebody pumps the network. Reads stay on one
//! thread: pump until [`Runtime::prefetch_versions`] returns a triggered
//! event, then analyze. Analyses of remote writes wait on the owner in the
//! middle of the analysis and need another thread pumping meanwhile.

pub mod services;

pub use services::CommitSet;
pub use services::IdAllocator;
pub use services::Pending;
pub use services::PendingRequest;
pub use services::RequestTable;
pub use services::Services;
pub use services::StateProgress;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::logical::AnalysisEnv;
use crate::logical::LogicalOutcome;
use crate::logical::RegionRequirement;
use crate::logical::closer::CompositeViewSummary;
use crate::logical::state::LogicalState;
use crate::logical::traverse::CurrentInitializer;
use crate::logical::traverse::CurrentInvalidator;
use crate::logical::traverse::DeletionInvalidator;
use crate::logical::traverse::LogicalPathRegistrar;
use crate::logical::traverse::LogicalRegistrar;
use crate::logical::traverse::VersioningInvalidator;
use crate::logical::traverse::traverse_node;
use crate::logical::traverse::traverse_path;
use crate::logical::user::Dependence;
use crate::logical::user::LogicalUser;
use crate::message::AdvanceRequest;
use crate::message::Message;
use crate::message::NoticeKind;
use crate::message::RequestKind;
use crate::message::StatePayload;
use crate::pool::StateTable;
use crate::primitives::AddressSpace;
use crate::primitives::Color;
use crate::primitives::ContextId;
use crate::primitives::DistributedId;
use crate::primitives::Event;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::OpRef;
use crate::primitives::ProjectionEpochId;
use crate::primitives::RegionTree;
use crate::primitives::RegionTreePath;
use crate::primitives::RequestId;
use crate::primitives::UniqueId;
use crate::primitives::ViewId;
use crate::transport::Transport;
use crate::version::arena::StateRef;
use crate::version::composite::CompositeView;
use crate::version::info::VersionInfo;
use crate::version::manager::AdvanceArgs;
use crate::version::manager::AdvanceOutcome;
use crate::version::manager::VersionManager;
use crate::version::owner::OwnerDirectory;
use crate::version::set::VersioningSet;

/// Outcome of [`Runtime::invalidate_version_context`].
#[derive(Debug)]
pub struct ContextReset {
    /// Number of managers reset.
    pub managers: usize,
    /// Completes once every remote copy the reset managers handed out was
    /// invalidated.
    pub invalidated: Event,
}

fn projection_epochs(req: &RegionRequirement) -> Vec<(ProjectionEpochId, FieldMask)> {
    let mut epochs = Vec::new();
    if let Some(projection) = &req.projection {
        for (epoch, mask) in projection.projection_epochs() {
            let overlap = *mask & req.mask;
            if !overlap.is_empty() {
                epochs.push((*epoch, overlap));
            }
        }
    }
    return epochs;
}

pub struct Runtime {
    services: Services,
    logical: StateTable<Mutex<LogicalState>>,
    managers: StateTable<VersionManager>,
}

impl Runtime {
    pub fn new(
        space: AddressSpace,
        config: Config,
        tree: Arc<dyn RegionTree>,
        transport: Arc<dyn Transport>,
        directory: Arc<OwnerDirectory>,
    ) -> Arc<Runtime> {
        return Arc::new(Runtime {
            services: Services::new(space, config, tree, transport, directory),
            logical: StateTable::new(),
            managers: StateTable::new(),
        });
    }

    pub fn space(&self) -> AddressSpace {
        return self.services.space;
    }

    pub fn services(&self) -> &Services {
        return &self.services;
    }

    pub fn config(&self) -> &Config {
        return &self.services.config;
    }

    fn env(&self, ctx: ContextId) -> AnalysisEnv<'_> {
        return AnalysisEnv {
            tree: &*self.services.tree,
            states: &self.logical,
            ctx,
            config: &self.services.config,
            commits: &self.services.commits,
            ids: &self.services.ids,
        };
    }

    /// The manager of (node, ctx) in this space, created on first use.
    pub fn manager(&self, node: NodeId, ctx: ContextId) -> Arc<VersionManager> {
        return self.managers.get_or_create(node, ctx, || VersionManager::new(node, ctx));
    }

    pub fn logical_state(&self, node: NodeId, ctx: ContextId) -> Option<Arc<Mutex<LogicalState>>> {
        return self.logical.get(node, ctx);
    }

    pub fn version_manager(&self, node: NodeId, ctx: ContextId) -> Option<Arc<VersionManager>> {
        return self.managers.get(node, ctx);
    }

    // ========================================================================
    // Logical analysis
    // ========================================================================

    /// Order requirement `index` of `op` after the earlier users it
    /// interferes with, synthesizing closes for conflicting open children.
    pub fn register_logical_user(
        &self,
        ctx: ContextId,
        op: OpRef,
        index: u32,
        req: &mut RegionRequirement,
    ) -> Result<LogicalOutcome> {
        return crate::logical::register_logical_user(&self.env(ctx), op, index, req);
    }

    /// Record dependences of `user` on every user in the subtree at `root`.
    /// A dominating user retires the users it depends on.
    pub fn register_subtree_dependences(
        &self,
        ctx: ContextId,
        root: NodeId,
        user: &LogicalUser,
        dominate: bool,
    ) -> Vec<Dependence> {
        let mut registrar =
            LogicalRegistrar { states: &self.logical, ctx, user, dominate, dependences: Vec::new() };
        traverse_node(&*self.services.tree, root, &mut registrar);
        return registrar.dependences;
    }

    /// Record dependences of `user` on the users along `path`.
    pub fn register_path_dependences(
        &self,
        ctx: ContextId,
        path: &RegionTreePath,
        start: NodeId,
        user: &LogicalUser,
    ) -> Vec<Dependence> {
        let mut registrar = LogicalPathRegistrar { states: &self.logical, ctx, user, dependences: Vec::new() };
        traverse_path(&*self.services.tree, path, start, &mut registrar);
        return registrar.dependences;
    }

    pub fn commit_operation(&self, op: OpRef) {
        if self.services.commits.commit(op) {
            self.retire_commits();
        }
    }

    /// Forget committed operations that no logical user refers to anymore.
    /// Returns how many were forgotten.
    pub fn retire_commits(&self) -> usize {
        let candidates = self.services.commits.snapshot();
        let mut live = FxHashSet::default();
        for state in self.logical.values() {
            let state = state.lock();
            live.extend(state.curr_epoch_users.iter().chain(&state.prev_epoch_users).map(|user| user.op));
        }
        let retired = self.services.commits.retire(candidates, &live);
        tracing::debug!(space = ?self.services.space, retired, kept = self.services.commits.len(), "retired commits");
        return retired;
    }

    /// Prepare clean logical state for a new context on the subtree at `root`.
    pub fn initialize_context(&self, ctx: ContextId, root: NodeId) {
        let mut initializer = CurrentInitializer { states: &self.logical, ctx };
        traverse_node(&*self.services.tree, root, &mut initializer);
    }

    /// Reset a context's logical state below `root`, or only drop its users.
    pub fn invalidate_logical_context(&self, ctx: ContextId, root: NodeId, users_only: bool) {
        let mut invalidator = CurrentInvalidator { states: &self.logical, ctx, users_only };
        traverse_node(&*self.services.tree, root, &mut invalidator);
    }

    /// Drop the context's version managers below `root`.
    pub fn invalidate_version_context(&self, ctx: ContextId, root: NodeId) -> ContextReset {
        let mut invalidator = VersioningInvalidator {
            managers: &self.managers,
            services: &self.services,
            ctx,
            reset: 0,
            invalidated: Vec::new(),
        };
        traverse_node(&*self.services.tree, root, &mut invalidator);
        tracing::debug!(ctx = ?ctx, root = ?root, reset = invalidator.reset, "invalidated version context");
        return ContextReset { managers: invalidator.reset, invalidated: Event::merge(invalidator.invalidated) };
    }

    /// Forget deleted fields in the logical state below `root`.
    pub fn delete_fields(&self, ctx: ContextId, root: NodeId, mask: FieldMask) {
        let mut invalidator = DeletionInvalidator { states: &self.logical, ctx, mask };
        traverse_node(&*self.services.tree, root, &mut invalidator);
    }

    // ========================================================================
    // Versioning analysis
    // ========================================================================

    /// Fill `info` with the versions `req` reads and, for writers, the
    /// versions it produces. The returned event completes once every remote
    /// content the info refers to has arrived; capture the physical states
    /// after waiting on it.
    pub fn perform_versioning_analysis(
        &self,
        ctx: ContextId,
        logical_uid: UniqueId,
        req: &RegionRequirement,
        info: &mut VersionInfo,
    ) -> Result<Event> {
        let tree = &*self.services.tree;
        let nodes = tree.path(req.parent, req.target)?;
        let base = tree.depth(req.parent);
        let target_depth = base + nodes.len() as u32 - 1;
        info.set_upper_bound_node(req.parent, base);
        let mut waits = Vec::new();

        let epochs = projection_epochs(req);
        for (offset, &node) in nodes.iter().enumerate() {
            let depth = base + offset as u32;
            let manager = self.manager(node, ctx);
            if depth < target_depth {
                let split = manager.compute_advance_split_mask(logical_uid, &epochs, req.mask);
                info.record_split_fields(depth, split);
                manager.record_path_only_versions(&self.services, req.mask, info, depth)?;
            } else if req.usage.modifies() {
                waits.extend(self.advance_target(ctx, logical_uid, req, &epochs, &manager, info, depth)?);
            } else {
                manager.record_current_versions(&self.services, req.mask, info, depth)?;
            }
        }

        for (depth, state, mask) in info.version_states() {
            let kind = if depth == target_depth { RequestKind::Initial } else { RequestKind::Child };
            waits.push(self.request_version_state(&state, kind, mask));
        }
        tracing::debug!(
            ctx = ?ctx,
            target_node = ?req.target,
            mask = ?req.mask,
            writes = req.usage.modifies(),
            "performed versioning analysis"
        );
        return Ok(Event::merge(waits));
    }

    #[allow(clippy::too_many_arguments)]
    fn advance_target(
        &self,
        ctx: ContextId,
        logical_uid: UniqueId,
        req: &RegionRequirement,
        epochs: &[(ProjectionEpochId, FieldMask)],
        manager: &VersionManager,
        info: &mut VersionInfo,
        depth: u32,
    ) -> Result<Vec<Event>> {
        let in_epochs = epochs.iter().fold(FieldMask::EMPTY, |acc, (_, mask)| acc | *mask);
        let dirty_previous = (req.usage.is_reduce() || req.projection.is_some()).then_some(req.mask);
        let update_parent = depth > info.base_depth();

        let mut groups: Vec<(Option<ProjectionEpochId>, FieldMask)> =
            epochs.iter().map(|(epoch, mask)| (Some(*epoch), *mask)).collect();
        if !(req.mask - in_epochs).is_empty() {
            groups.push((None, req.mask - in_epochs));
        }

        let mut waits = Vec::new();
        for (epoch, mask) in groups {
            let mut args = AdvanceArgs::new(mask, logical_uid);
            args.update_parent = update_parent;
            args.dirty_previous = dirty_previous;
            if let Some(epoch) = epoch {
                args.dedup_advances = true;
                args.advance_epoch = epoch;
                args.dedup_opens = true;
                args.open_epoch = epoch;
            }
            // The owner sees the forwarded advance before the version request
            // below, so the ack only joins the returned event.
            match self.advance_version_numbers(ctx, manager.node, args)? {
                AdvanceOutcome::Advanced { invalidated, .. } => waits.push(invalidated),
                AdvanceOutcome::Forwarded(acked) => waits.push(acked),
                AdvanceOutcome::Duplicate => {}
            }
        }

        let split = manager.compute_advance_split_mask(logical_uid, epochs, req.mask) | (req.mask - in_epochs);
        info.record_split_fields(depth, split);
        manager.record_current_versions(&self.services, req.mask, info, depth)?;
        manager.record_advance_versions(&self.services, req.mask, info, depth)?;
        return Ok(waits);
    }

    /// Issue the manager requests the versioning analysis of `req` would
    /// otherwise wait on, without waiting. Returns a triggered event once
    /// every node on the path holds valid versions of `req.mask`; until then
    /// deliver what is queued and call again.
    pub fn prefetch_versions(&self, ctx: ContextId, req: &RegionRequirement) -> Result<Event> {
        let nodes = self.services.tree.path(req.parent, req.target)?;
        let mut waits = Vec::new();
        for node in nodes {
            let manager = self.manager(node, ctx);
            let fetched = manager.request_remote_versions(&self.services, req.mask);
            if fetched.has_triggered() {
                waits.push(manager.request_unversioned(&self.services, req.mask));
            } else {
                waits.push(fetched);
            }
        }
        return Ok(Event::merge(waits));
    }

    /// Seed the first version of `node` with `views` holding valid data for
    /// `mask`. This space must own the node's versions.
    pub fn initialize_version_state(
        &self,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
        views: &BTreeMap<ViewId, FieldMask>,
    ) -> Result<()> {
        return self.manager(node, ctx).initialize_state(&self.services, mask, views);
    }

    /// Advance the versions of `node` and record the new states in the
    /// parent when asked to. Remote managers forward to the owner.
    pub fn advance_version_numbers(&self, ctx: ContextId, node: NodeId, args: AdvanceArgs) -> Result<AdvanceOutcome> {
        let outcome = self.manager(node, ctx).advance_versions(&self.services, &args);
        if let AdvanceOutcome::Advanced { new_states, parent_mask, .. } = &outcome {
            if !parent_mask.is_empty() {
                if let Some(parent) = self.services.tree.parent(node) {
                    let mut opened = VersioningSet::new();
                    for (state, mask) in new_states.entries_for(*parent_mask) {
                        opened.insert(state, mask);
                    }
                    let color = self.services.tree.color(node);
                    self.manager(parent, ctx).update_child_versions(&self.services, color, &opened)?;
                }
            }
        }
        return Ok(outcome);
    }

    /// Make sure the local copy of `state` holds `kind` contents for `mask`.
    pub fn request_version_state(&self, state: &StateRef, kind: RequestKind, mask: FieldMask) -> Event {
        let space = self.services.space;
        let plan = state.begin_request(kind, mask, |fields, targets| {
            let request = self.services.ids.next_request();
            let progress = if state.is_owner() {
                StateProgress::from_owner(state.did, kind, fields, targets.len())
            } else {
                StateProgress::new(state.did, kind, fields)
            };
            return (request, self.services.requests.register(request, Pending::State(progress)));
        });
        if let Some(issue) = plan.issue {
            tracing::debug!(did = ?state.did, kind = ?kind, mask = ?issue.mask, targets = issue.targets.len(), "requesting version state");
            for target in issue.targets {
                self.services.send(
                    target,
                    Message::StateRequest { did: state.did, requester: space, request: issue.request, mask: issue.mask, kind },
                );
            }
        }
        return Event::merge(plan.waits);
    }

    /// Fold the operation's updates into the states `info` advanced. One
    /// event per remote owner that must acknowledge a contribution is pushed
    /// to `applied`.
    pub fn apply_mapping(&self, info: &VersionInfo, copy_through: bool, applied: &mut Vec<Event>) -> Result<()> {
        for proxy in info.apply_mapping(copy_through) {
            let request = self.services.ids.next_request();
            applied.push(self.services.requests.register(request, Pending::Notify { did: proxy.did }));
            self.services.send(
                proxy.owner(),
                Message::ValidNotification {
                    did: proxy.did,
                    source: self.services.space,
                    kind: NoticeKind::Contribution,
                    request: Some(request),
                },
            );
        }
        if self.services.config.collect_garbage_eagerly {
            self.collect_garbage();
        }
        return Ok(());
    }

    /// Capture the current versions of `node` for `mask` as a composite view.
    pub fn capture_composite_view(
        &self,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
        summary: CompositeViewSummary,
    ) -> Result<CompositeView> {
        let manager = self.manager(node, ctx);
        manager.request_remote_versions(&self.services, mask).wait();
        manager.materialize_unversioned(&self.services, mask)?;
        let mut states = VersioningSet::new();
        let mut waits = Vec::new();
        for (state, held) in manager.current_states(mask) {
            waits.push(self.request_version_state(&state, RequestKind::Final, held));
            states.insert(state, held);
        }
        Event::merge(waits).wait();
        let depth = self.services.tree.depth(node);
        return Ok(CompositeView::from_states(node, depth, &states, mask, summary));
    }

    /// Reclaim unreferenced version states. Returns the number of release
    /// messages sent.
    pub fn collect_garbage(&self) -> usize {
        let outbound = self.services.arena.collect();
        let released = outbound.len();
        self.services.send_all(outbound);
        return released;
    }

    // ========================================================================
    // Message handling
    // ========================================================================

    pub fn handle_message(&self, source: AddressSpace, message: Message) -> Result<()> {
        tracing::trace!(space = ?self.services.space, from = ?source, message = message.name(), "handle");
        match message {
            Message::Advance(request) => return self.handle_advance(source, request),
            Message::Invalidate { node, ctx, request, mask } => {
                if let Some(manager) = self.managers.get(node, ctx) {
                    manager.invalidate_version_infos(mask);
                }
                self.services.send(source, Message::Ack { request });
                return Ok(());
            }
            Message::Ack { request } => return self.handle_ack(request),
            Message::ManagerRequest { node, ctx, request, mask } => {
                self.manager(node, ctx).handle_manager_request(&self.services, source, request, mask);
                return Ok(());
            }
            Message::ManagerResponse { node, ctx, request, mask, current, previous } => {
                let pending = self.services.requests.take(request)?;
                let result =
                    self.manager(node, ctx).handle_manager_response(&self.services, request, mask, &current, &previous);
                pending.complete();
                return result;
            }
            Message::UnversionedRequest { node, ctx, request, mask } => {
                return self.manager(node, ctx).handle_unversioned_request(&self.services, source, request, mask);
            }
            Message::UnversionedResponse { node, ctx, request, mask, states } => {
                let pending = self.services.requests.take(request)?;
                let result = self.manager(node, ctx).handle_unversioned_response(&self.services, request, mask, &states);
                pending.complete();
                return result;
            }
            Message::StateRequest { did, requester, request, mask, kind } => {
                return self.handle_state_request(did, requester, request, mask, kind);
            }
            Message::StateResponse { did, request, mask, kind: _, payload, from_owner, forwarded } => {
                return self.handle_state_response(source, did, request, mask, payload, from_owner, forwarded);
            }
            Message::ValidNotification { did, source: holder, kind, request } => {
                self.handle_valid_notification(did, holder, kind);
                if let Some(request) = request {
                    self.services.send(holder, Message::Ack { request });
                }
                return Ok(());
            }
            Message::RemoveReference { did, count } => {
                self.handle_remove_reference(source, did, count);
                return Ok(());
            }
        }
    }

    fn handle_advance(&self, source: AddressSpace, request: AdvanceRequest) -> Result<()> {
        let result = self.advance_version_numbers(request.ctx, request.node, AdvanceArgs::from_request(&request));
        self.services.send(source, Message::Ack { request: request.request });
        return result.map(|_| ());
    }

    fn handle_ack(&self, request: RequestId) -> Result<()> {
        let pending = self.services.requests.take(request)?;
        if let Pending::Advance { node, ctx } = pending.kind {
            if let Some(manager) = self.managers.get(node, ctx) {
                manager.reclaim_pending_advance(request);
            }
        }
        pending.complete();
        return Ok(());
    }

    fn handle_state_request(
        &self,
        did: DistributedId,
        requester: AddressSpace,
        request: RequestId,
        mask: FieldMask,
        kind: RequestKind,
    ) -> Result<()> {
        let space = self.services.space;
        let Some(state) = self.services.arena.get(did) else {
            if did.owner() == space {
                return Err(Error::UnknownVersionState(did));
            }
            // A forwarded request for a copy this space already dropped.
            self.services.send(
                requester,
                Message::StateResponse {
                    did,
                    request,
                    mask,
                    kind,
                    payload: StatePayload::default(),
                    from_owner: false,
                    forwarded: 0,
                },
            );
            return Ok(());
        };
        let (payload, sent) = state.pack_payload(kind, mask);
        for child in sent.iter().filter(|child| child.is_owner()) {
            child.add_holder(requester, 1);
        }
        let mut forwards = Vec::new();
        if state.is_owner() {
            forwards = state.valid_instances();
            forwards.retain(|holder| *holder != requester && *holder != space);
        }
        let from_owner = state.is_owner();
        drop(sent);
        drop(state);
        for holder in &forwards {
            self.services.send(*holder, Message::StateRequest { did, requester, request, mask, kind });
        }
        self.services.send(
            requester,
            Message::StateResponse { did, request, mask, kind, payload, from_owner, forwarded: forwards.len() as u32 },
        );
        return Ok(());
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_state_response(
        &self,
        source: AddressSpace,
        did: DistributedId,
        request: RequestId,
        mask: FieldMask,
        payload: StatePayload,
        from_owner: bool,
        forwarded: u32,
    ) -> Result<()> {
        let mut children: Vec<(Color, StateRef, FieldMask)> = Vec::new();
        let mut notices = Vec::new();
        for (color, entries) in &payload.children {
            for entry in entries {
                let (child, _) = self.services.arena.find_or_create_proxy(&entry.state)?;
                if !child.is_owner() {
                    child.record_received(1);
                    if entry.state.owner() != source {
                        notices.push((child.owner(), child.did));
                    }
                }
                children.push((*color, child, entry.mask));
            }
        }
        let state = self.services.arena.get(did);
        if let Some(state) = &state {
            state.apply_payload(mask, &payload, children);
        }
        for (owner, child) in notices {
            self.services.send(
                owner,
                Message::ValidNotification { did: child, source: self.services.space, kind: NoticeKind::Holder, request: None },
            );
        }
        let Some(pending) = self.services.requests.record_state_response(request, source, from_owner, forwarded, mask)? else {
            return Ok(());
        };
        if let (Some(state), Pending::State(progress)) = (&state, &pending.kind) {
            state.complete_request(progress.kind, request, progress.mask);
        }
        tracing::debug!(did = ?did, request = ?request, "version state request complete");
        pending.complete();
        return Ok(());
    }

    fn handle_valid_notification(&self, did: DistributedId, holder: AddressSpace, kind: NoticeKind) {
        let Some(state) = self.services.arena.get(did) else {
            tracing::warn!(did = ?did, holder = ?holder, kind = ?kind, "notification for a reclaimed version state");
            if kind == NoticeKind::Contribution {
                self.services.send(holder, Message::RemoveReference { did, count: 0 });
            }
            return;
        };
        debug_assert!(state.is_owner(), "{did:?} notified at a non-owner");
        match kind {
            NoticeKind::Holder => state.add_holder(holder, 1),
            NoticeKind::Contribution => state.add_valid_instance(holder),
        }
    }

    fn handle_remove_reference(&self, source: AddressSpace, did: DistributedId, count: u32) {
        if did.owner() != self.services.space {
            self.services.arena.release_pin(did);
            return;
        }
        if let Some(state) = self.services.arena.get(did) {
            state.remove_holder(source, count);
        }
        self.services.arena.defer(did);
        if self.services.config.collect_garbage_eagerly {
            self.collect_garbage();
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("Runtime")
            .field("space", &self.services.space)
            .field("logical_states", &self.logical.len())
            .field("managers", &self.managers.len())
            .field("version_states", &self.services.arena.len())
            .finish();
    }
}
