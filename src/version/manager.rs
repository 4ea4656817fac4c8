//! Version managers: the version numbers of one (node, context) pair.
//!
//! Every address space that analyzes operations on a node keeps a manager
//! for it. The first space to touch the pair owns it and holds the
//! authoritative current and previous version states; the others keep
//! copies of whichever fields they were sent and forward advances to the
//! owner.
//!
//! ## Invariants
//!
//! - In the current map each field is held by exactly one version number.
//! - A remote manager's maps are only meaningful for `remote_valid_fields`;
//!   the owner tracks per space which fields it sent, and invalidates them
//!   when it advances.
//! - No message is sent while the manager lock is held.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::message::AdvanceRequest;
use crate::message::Message;
use crate::message::NoticeKind;
use crate::message::Outbound;
use crate::message::StateEntry;
use crate::primitives::AddressSpace;
use crate::primitives::Color;
use crate::primitives::ContextId;
use crate::primitives::Event;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::ProjectionEpochId;
use crate::primitives::RequestId;
use crate::primitives::UniqueId;
use crate::primitives::VersionId;
use crate::primitives::ViewId;
use crate::runtime::Pending;
use crate::runtime::Services;
use crate::version::INITIAL_VERSION;
use crate::version::arena::StateRef;
use crate::version::info::VersionInfo;
use crate::version::set::VersioningSet;
use crate::version::state::StateContents;

type VersionMap = BTreeMap<VersionId, VersioningSet>;
type EpochLog = BTreeMap<(UniqueId, ProjectionEpochId), FieldMask>;

fn fields_of(map: &VersionMap) -> FieldMask {
    return map.values().fold(FieldMask::EMPTY, |acc, set| acc | set.valid_mask());
}

fn filter_map(map: &mut VersionMap, mask: FieldMask) {
    for set in map.values_mut() {
        set.filter(mask);
    }
    map.retain(|_, set| !set.is_empty());
}

fn capture(map: &VersionMap, mask: FieldMask, out: &mut Vec<(StateRef, FieldMask)>) -> FieldMask {
    let mut covered = FieldMask::EMPTY;
    if mask.is_empty() {
        return covered;
    }
    for set in map.values() {
        for (state, overlap) in set.entries_for(mask) {
            covered |= overlap;
            out.push((state, overlap));
        }
    }
    return covered;
}

fn insert(map: &mut VersionMap, state: StateRef, mask: FieldMask) {
    map.entry(state.version).or_default().insert(state, mask);
}

/// Record `mask` under `key` and return the fields it had not seen yet.
/// Fields recorded under an earlier epoch are dropped from it, since a new
/// epoch for a field only starts once every user of the older one is done.
fn record_epoch(log: &mut EpochLog, key: (UniqueId, ProjectionEpochId), mask: FieldMask) -> FieldMask {
    let fresh = mask - log.get(&key).copied().unwrap_or_default();
    if fresh.is_empty() {
        return fresh;
    }
    for ((_, epoch), held) in log.iter_mut() {
        if *epoch < key.1 {
            *held -= mask;
        }
    }
    log.retain(|_, held| !held.is_empty());
    *log.entry(key).or_default() |= fresh;
    return fresh;
}

/// Version numbers held per field, for inspection.
fn numbers(map: &VersionMap) -> BTreeMap<VersionId, FieldMask> {
    let mut out = BTreeMap::new();
    for (version, set) in map {
        let mask = set.valid_mask();
        if !mask.is_empty() {
            out.insert(*version, mask);
        }
    }
    return out;
}

/// Parameters of an advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvanceArgs {
    pub mask: FieldMask,
    pub logical_uid: UniqueId,
    /// Record the new states as open children of the parent's current
    /// version.
    pub update_parent: bool,
    /// Update the parent at most once per (logical context, open epoch).
    pub dedup_opens: bool,
    pub open_epoch: ProjectionEpochId,
    /// Advance at most once per (logical context, advance epoch).
    pub dedup_advances: bool,
    pub advance_epoch: ProjectionEpochId,
    /// Fields whose dirty data the new version starts from.
    pub dirty_previous: Option<FieldMask>,
}

impl AdvanceArgs {
    pub fn new(mask: FieldMask, logical_uid: UniqueId) -> AdvanceArgs {
        return AdvanceArgs {
            mask,
            logical_uid,
            update_parent: false,
            dedup_opens: false,
            open_epoch: 0,
            dedup_advances: false,
            advance_epoch: 0,
            dirty_previous: None,
        };
    }

    pub fn from_request(request: &AdvanceRequest) -> AdvanceArgs {
        return AdvanceArgs {
            mask: request.mask,
            logical_uid: request.logical_uid,
            update_parent: request.update_parent,
            dedup_opens: request.dedup_opens,
            open_epoch: request.open_epoch,
            dedup_advances: request.dedup_advances,
            advance_epoch: request.advance_epoch,
            dirty_previous: request.dirty_previous,
        };
    }

    fn to_request(self, node: NodeId, ctx: ContextId, request: RequestId) -> AdvanceRequest {
        return AdvanceRequest {
            node,
            ctx,
            request,
            mask: self.mask,
            logical_uid: self.logical_uid,
            update_parent: self.update_parent,
            dedup_opens: self.dedup_opens,
            open_epoch: self.open_epoch,
            dedup_advances: self.dedup_advances,
            advance_epoch: self.advance_epoch,
            dirty_previous: self.dirty_previous,
        };
    }
}

#[derive(Debug)]
pub enum AdvanceOutcome {
    /// Advanced on this space, the owner.
    Advanced {
        new_states: VersioningSet,
        /// Fields whose new states still have to be recorded in the parent.
        parent_mask: FieldMask,
        /// Completes when every remote copy was invalidated.
        invalidated: Event,
    },
    /// Sent to the owner; completes when the owner acknowledged.
    Forwarded(Event),
    /// Every field was already advanced in this epoch.
    Duplicate,
}

struct Outstanding {
    request: RequestId,
    event: Event,
    mask: FieldMask,
}

struct PendingAdvance {
    mask: FieldMask,
    /// States invalidated by the advance, kept alive until the owner has
    /// seen it.
    retired: Vec<StateRef>,
}

#[derive(Default)]
struct ManagerInner {
    owner: Option<AddressSpace>,
    current: VersionMap,
    previous: VersionMap,
    remote_valid_fields: FieldMask,
    remote_valid: BTreeMap<AddressSpace, FieldMask>,
    pending_advances: BTreeMap<RequestId, PendingAdvance>,
    previous_opens: EpochLog,
    previous_advancers: EpochLog,
    outstanding: Vec<Outstanding>,
    unversioned: Vec<Outstanding>,
}

impl ManagerInner {
    fn is_sane(&self) -> bool {
        let mut seen = FieldMask::EMPTY;
        for set in self.current.values() {
            let mask = set.valid_mask();
            if seen.intersects(mask) {
                return false;
            }
            seen |= mask;
        }
        return true;
    }
}

pub struct VersionManager {
    pub node: NodeId,
    pub ctx: ContextId,
    inner: Mutex<ManagerInner>,
}

impl VersionManager {
    pub fn new(node: NodeId, ctx: ContextId) -> VersionManager {
        return VersionManager { node, ctx, inner: Mutex::new(ManagerInner::default()) };
    }

    fn resolve_owner(&self, inner: &mut ManagerInner, services: &Services) -> AddressSpace {
        if let Some(owner) = inner.owner {
            return owner;
        }
        let owner = services.directory.claim(self.node, self.ctx, services.space);
        inner.owner = Some(owner);
        return owner;
    }

    /// Whether this space owns the manager, claiming it if nobody does.
    pub fn is_owner(&self, services: &Services) -> bool {
        let mut inner = self.inner.lock();
        return self.resolve_owner(&mut inner, services) == services.space;
    }

    pub fn owner(&self) -> Option<AddressSpace> {
        return self.inner.lock().owner;
    }

    // ========================================================================
    // Recording versions
    // ========================================================================

    /// Make sure a remote manager holds valid copies of `mask`. Requests for
    /// fields already in flight are not repeated. The owner returns at once.
    pub fn request_remote_versions(&self, services: &Services, mask: FieldMask) -> Event {
        let mut waits = Vec::new();
        let mut outbound = None;
        {
            let mut inner = self.inner.lock();
            let owner = self.resolve_owner(&mut inner, services);
            if owner == services.space {
                return Event::NO_EVENT;
            }
            let mut needed = mask - inner.remote_valid_fields;
            for pending in &inner.outstanding {
                if pending.mask.intersects(needed) {
                    waits.push(pending.event.clone());
                    needed -= pending.mask;
                }
            }
            if !needed.is_empty() {
                let request = services.ids.next_request();
                let event = services.requests.register(request, Pending::Manager { node: self.node, ctx: self.ctx });
                inner.outstanding.push(Outstanding { request, event: event.clone(), mask: needed });
                waits.push(event);
                outbound = Some(Outbound::new(
                    owner,
                    Message::ManagerRequest { node: self.node, ctx: self.ctx, request, mask: needed },
                ));
                tracing::debug!(node = ?self.node, ctx = ?self.ctx, mask = ?needed, "requesting remote versions");
            } else if !waits.is_empty() {
                tracing::debug!(node = ?self.node, ctx = ?self.ctx, mask = ?mask, "joined outstanding version request");
            }
        }
        if let Some(out) = outbound {
            services.send(out.target, out.message);
        }
        return Event::merge(waits);
    }

    /// Create first versions for fields that have none. A remote manager asks
    /// the owner and waits for the answer.
    pub fn materialize_unversioned(&self, services: &Services, mask: FieldMask) -> Result<()> {
        self.request_unversioned(services, mask).wait();
        return Ok(());
    }

    /// Like [`VersionManager::materialize_unversioned`] without waiting. The
    /// owner materializes at once and returns a triggered event.
    pub fn request_unversioned(&self, services: &Services, mask: FieldMask) -> Event {
        let mut waits = Vec::new();
        let mut outbound = None;
        {
            let mut inner = self.inner.lock();
            let owner = self.resolve_owner(&mut inner, services);
            let mut missing = mask - fields_of(&inner.current);
            if missing.is_empty() {
                return Event::NO_EVENT;
            }
            if owner == services.space {
                let state = services.arena.create(INITIAL_VERSION, self.node);
                insert(&mut inner.current, state, missing);
                tracing::debug!(node = ?self.node, ctx = ?self.ctx, mask = ?missing, "materialized first versions");
                debug_assert!(inner.is_sane());
                return Event::NO_EVENT;
            }
            for pending in &inner.unversioned {
                if pending.mask.intersects(missing) {
                    waits.push(pending.event.clone());
                    missing -= pending.mask;
                }
            }
            if !missing.is_empty() {
                let request = services.ids.next_request();
                let event =
                    services.requests.register(request, Pending::Unversioned { node: self.node, ctx: self.ctx });
                inner.unversioned.push(Outstanding { request, event: event.clone(), mask: missing });
                waits.push(event);
                outbound = Some(Outbound::new(
                    owner,
                    Message::UnversionedRequest { node: self.node, ctx: self.ctx, request, mask: missing },
                ));
            }
        }
        if let Some(out) = outbound {
            services.send(out.target, out.message);
        }
        return Event::merge(waits);
    }

    /// Seed the first version of the unversioned fields of `mask` with
    /// `views` as their valid data. Only the owner can seed.
    pub fn initialize_state(
        &self,
        services: &Services,
        mask: FieldMask,
        views: &BTreeMap<ViewId, FieldMask>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.resolve_owner(&mut inner, services) != services.space {
            return Err(Error::NotOwner { node: self.node, space: services.space });
        }
        let fresh = mask - fields_of(&inner.current);
        if fresh.is_empty() {
            return Ok(());
        }
        let mut contents = StateContents::default();
        for (view, held) in views {
            let overlap = *held & fresh;
            if !overlap.is_empty() {
                contents.valid_views.insert(*view, overlap);
                contents.dirty_mask |= overlap;
            }
        }
        let state = services.arena.create(INITIAL_VERSION, self.node);
        state.merge_physical_state(&contents, fresh);
        insert(&mut inner.current, state, fresh);
        debug_assert!(inner.is_sane());
        tracing::debug!(node = ?self.node, ctx = ?self.ctx, mask = ?fresh, views = contents.valid_views.len(), "initialized versions");
        return Ok(());
    }

    /// Record the current versions of `mask` in `info` at `depth`. Fields
    /// split at that depth read the previous versions instead.
    pub fn record_current_versions(
        &self,
        services: &Services,
        mask: FieldMask,
        info: &mut VersionInfo,
        depth: u32,
    ) -> Result<()> {
        let split = info.split_mask(depth) & mask;
        return self.record_versions(services, mask, split, info, depth, false);
    }

    /// Like [`VersionManager::record_current_versions`] for a node the
    /// requirement only passes through. Split fields also record the states
    /// that replaced their previous versions as advance states.
    pub fn record_path_only_versions(
        &self,
        services: &Services,
        mask: FieldMask,
        info: &mut VersionInfo,
        depth: u32,
    ) -> Result<()> {
        let split = info.split_mask(depth) & mask;
        self.record_versions(services, mask, split, info, depth, true)?;
        if split.is_empty() {
            return Ok(());
        }
        let mut advanced = Vec::new();
        capture(&self.inner.lock().current, split, &mut advanced);
        for (state, fields) in advanced {
            info.add_advance_version(self.node, depth, &state, fields);
        }
        return Ok(());
    }

    fn record_versions(
        &self,
        services: &Services,
        mask: FieldMask,
        split: FieldMask,
        info: &mut VersionInfo,
        depth: u32,
        path_only: bool,
    ) -> Result<()> {
        self.request_remote_versions(services, mask).wait();
        let mut captured = Vec::new();
        let covered = {
            let inner = self.inner.lock();
            capture(&inner.current, mask - split, &mut captured) | capture(&inner.previous, split, &mut captured)
        };
        let missing = mask - covered;
        if !missing.is_empty() {
            debug_assert!(missing.is_disjoint(split), "split fields {:?} have no previous version", missing & split);
            self.materialize_unversioned(services, missing)?;
            let inner = self.inner.lock();
            capture(&inner.current, missing, &mut captured);
        }
        for (state, fields) in captured {
            info.add_current_version(self.node, depth, &state, fields, path_only);
        }
        return Ok(());
    }

    /// Record the versions an advance at this node produced as the states
    /// `info` writes into.
    pub fn record_advance_versions(
        &self,
        services: &Services,
        mask: FieldMask,
        info: &mut VersionInfo,
        depth: u32,
    ) -> Result<()> {
        self.request_remote_versions(services, mask).wait();
        let mut captured = Vec::new();
        let covered = capture(&self.inner.lock().current, mask, &mut captured);
        debug_assert!(covered == mask, "fields {:?} were never advanced", mask - covered);
        for (state, fields) in captured {
            info.add_advance_version(self.node, depth, &state, fields);
        }
        return Ok(());
    }

    /// Fields of `mask` already advanced by an earlier point of the same
    /// logical context in the given epochs.
    pub fn compute_advance_split_mask(
        &self,
        logical_uid: UniqueId,
        epochs: &[(ProjectionEpochId, FieldMask)],
        mask: FieldMask,
    ) -> FieldMask {
        let inner = self.inner.lock();
        let mut split = FieldMask::EMPTY;
        for (epoch, fields) in epochs {
            if let Some(seen) = inner.previous_advancers.get(&(logical_uid, *epoch)) {
                split |= *seen & *fields & mask;
            }
        }
        return split;
    }

    // ========================================================================
    // Advancing
    // ========================================================================

    pub fn advance_versions(&self, services: &Services, args: &AdvanceArgs) -> AdvanceOutcome {
        let mut outbound = Vec::new();
        let mut retired = VersionMap::new();
        let outcome = {
            let mut inner = self.inner.lock();
            let owner = self.resolve_owner(&mut inner, services);
            let mut mask = args.mask;
            if args.dedup_advances {
                mask = record_epoch(&mut inner.previous_advancers, (args.logical_uid, args.advance_epoch), mask);
            }
            if mask.is_empty() {
                tracing::debug!(node = ?self.node, ctx = ?self.ctx, "skipped duplicate advance");
                return AdvanceOutcome::Duplicate;
            }
            if owner == services.space {
                self.advance_owned(&mut inner, services, args, mask, &mut outbound, &mut retired)
            } else {
                let request = services.ids.next_request();
                let event = services.requests.register(request, Pending::Advance { node: self.node, ctx: self.ctx });
                let mut states = Vec::new();
                capture(&inner.current, mask, &mut states);
                capture(&inner.previous, mask, &mut states);
                filter_map(&mut inner.current, mask);
                filter_map(&mut inner.previous, mask);
                inner.remote_valid_fields -= mask;
                inner.outstanding.retain(|pending| !pending.mask.intersects(mask));
                inner.pending_advances.insert(
                    request,
                    PendingAdvance { mask, retired: states.into_iter().map(|(state, _)| state).collect() },
                );
                let forwarded = AdvanceArgs { mask, ..*args };
                outbound.push(Outbound::new(owner, Message::Advance(forwarded.to_request(self.node, self.ctx, request))));
                tracing::debug!(node = ?self.node, ctx = ?self.ctx, mask = ?mask, owner = ?owner, "forwarded advance");
                AdvanceOutcome::Forwarded(event)
            }
        };
        drop(retired);
        services.send_all(outbound);
        return outcome;
    }

    fn advance_owned(
        &self,
        inner: &mut ManagerInner,
        services: &Services,
        args: &AdvanceArgs,
        mask: FieldMask,
        outbound: &mut Vec<Outbound>,
        retired: &mut VersionMap,
    ) -> AdvanceOutcome {
        let mut parent_mask = if args.update_parent { mask } else { FieldMask::EMPTY };
        if args.dedup_opens && !parent_mask.is_empty() {
            parent_mask = record_epoch(&mut inner.previous_opens, (args.logical_uid, args.open_epoch), parent_mask);
        }

        let unversioned = mask - fields_of(&inner.current);
        if !unversioned.is_empty() {
            let state = services.arena.create(INITIAL_VERSION, self.node);
            insert(&mut inner.current, state, unversioned);
        }

        // Only the most recent previous versions are kept.
        for (version, set) in inner.previous.iter_mut() {
            let dropped = set.take_fields(mask);
            if !dropped.is_empty() {
                retired.entry(*version).or_default().absorb(dropped);
            }
        }
        inner.previous.retain(|_, set| !set.is_empty());

        let mut demoted = VersionMap::new();
        for (version, set) in inner.current.iter_mut() {
            let moved = set.take_fields(mask);
            if !moved.is_empty() {
                demoted.insert(*version, moved);
            }
        }
        inner.current.retain(|_, set| !set.is_empty());

        let mut new_states = VersioningSet::new();
        for (version, set) in &demoted {
            let fields = set.valid_mask();
            let next = services.arena.create(version + 1, self.node);
            if let Some(dirty) = args.dirty_previous {
                for (prev, held) in set.iter() {
                    let overlap = held & dirty;
                    if !overlap.is_empty() {
                        prev.capture_dirty_instances(overlap, &next);
                    }
                }
            }
            insert(&mut inner.current, next.clone(), fields);
            new_states.insert(next, fields);
        }
        for (version, set) in demoted {
            inner.previous.entry(version).or_default().absorb(set);
        }

        let mut invalidations = Vec::new();
        for (space, held) in inner.remote_valid.iter_mut() {
            let overlap = *held & mask;
            if overlap.is_empty() {
                continue;
            }
            *held -= overlap;
            let request = services.ids.next_request();
            invalidations.push(services.requests.register(request, Pending::Invalidate { node: self.node, ctx: self.ctx }));
            outbound.push(Outbound::new(
                *space,
                Message::Invalidate { node: self.node, ctx: self.ctx, request, mask: overlap },
            ));
        }
        inner.remote_valid.retain(|_, held| !held.is_empty());
        inner.remote_valid_fields = inner.remote_valid.values().fold(FieldMask::EMPTY, |acc, m| acc | *m);
        debug_assert!(inner.is_sane());
        tracing::debug!(
            node = ?self.node,
            ctx = ?self.ctx,
            mask = ?mask,
            invalidations = invalidations.len(),
            "advanced versions"
        );
        return AdvanceOutcome::Advanced { new_states, parent_mask, invalidated: Event::merge(invalidations) };
    }

    /// Record `children`, the new states of child `color`, as open children
    /// of this node's current versions.
    pub fn update_child_versions(&self, services: &Services, color: Color, children: &VersioningSet) -> Result<()> {
        let mask = children.valid_mask();
        if mask.is_empty() {
            return Ok(());
        }
        self.request_remote_versions(services, mask).wait();
        self.materialize_unversioned(services, mask)?;
        let mut targets = Vec::new();
        capture(&self.inner.lock().current, mask, &mut targets);
        let mut notices = Vec::new();
        for (state, fields) in targets {
            if state.reduce_open_children(color, fields, children) {
                notices.push(Outbound::new(
                    state.owner(),
                    Message::ValidNotification {
                        did: state.did,
                        source: services.space,
                        kind: NoticeKind::Contribution,
                        request: None,
                    },
                ));
            }
        }
        services.send_all(notices);
        return Ok(());
    }

    /// A pending remote advance was acknowledged by the owner.
    pub fn reclaim_pending_advance(&self, request: RequestId) {
        let reclaimed = self.inner.lock().pending_advances.remove(&request);
        if let Some(pending) = reclaimed {
            tracing::trace!(node = ?self.node, ctx = ?self.ctx, retired = pending.retired.len(), "advance acknowledged");
        }
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Drop this space's copies of `mask`.
    pub fn invalidate_version_infos(&self, mask: FieldMask) {
        let dropped = {
            let mut inner = self.inner.lock();
            let mut dropped = Vec::new();
            capture(&inner.current, mask, &mut dropped);
            capture(&inner.previous, mask, &mut dropped);
            filter_map(&mut inner.current, mask);
            filter_map(&mut inner.previous, mask);
            inner.remote_valid_fields -= mask;
            dropped
        };
        tracing::debug!(node = ?self.node, ctx = ?self.ctx, mask = ?mask, states = dropped.len(), "invalidated versions");
    }

    /// Forget everything, invalidating remote copies and releasing ownership.
    /// The returned event completes once every remote copy was invalidated.
    pub fn reset(&self, services: &Services) -> Event {
        let mut outbound = Vec::new();
        let mut acks = Vec::new();
        let old = {
            let mut inner = self.inner.lock();
            if inner.owner == Some(services.space) {
                for (space, held) in &inner.remote_valid {
                    let request = services.ids.next_request();
                    acks.push(services.requests.register(request, Pending::Invalidate { node: self.node, ctx: self.ctx }));
                    outbound.push(Outbound::new(
                        *space,
                        Message::Invalidate { node: self.node, ctx: self.ctx, request, mask: *held },
                    ));
                }
                services.directory.release(self.node, self.ctx, services.space);
            }
            std::mem::take(&mut *inner)
        };
        drop(old);
        tracing::debug!(node = ?self.node, ctx = ?self.ctx, invalidations = outbound.len(), "reset version manager");
        services.send_all(outbound);
        return Event::merge(acks);
    }

    // ========================================================================
    // Owner-side handlers
    // ========================================================================

    fn entries_for_remote(
        &self,
        inner: &mut ManagerInner,
        source: AddressSpace,
        mask: FieldMask,
    ) -> (Vec<StateEntry>, Vec<StateEntry>) {
        let describe = |map: &VersionMap| {
            let mut entries = Vec::new();
            for set in map.values() {
                for (state, held) in set.iter() {
                    let overlap = held & mask;
                    if overlap.is_empty() {
                        continue;
                    }
                    state.add_holder(source, 1);
                    entries.push(StateEntry { state: state.descriptor(), mask: overlap });
                }
            }
            return entries;
        };
        let current = describe(&inner.current);
        let previous = describe(&inner.previous);
        *inner.remote_valid.entry(source).or_default() |= mask;
        inner.remote_valid_fields |= mask;
        return (current, previous);
    }

    pub fn handle_manager_request(&self, services: &Services, source: AddressSpace, request: RequestId, mask: FieldMask) {
        let message = {
            let mut inner = self.inner.lock();
            let owner = self.resolve_owner(&mut inner, services);
            debug_assert_eq!(owner, services.space, "{:?} asked a non-owner for versions", source);
            let (current, previous) = self.entries_for_remote(&mut inner, source, mask);
            Message::ManagerResponse { node: self.node, ctx: self.ctx, request, mask, current, previous }
        };
        services.send(source, message);
    }

    pub fn handle_unversioned_request(
        &self,
        services: &Services,
        source: AddressSpace,
        request: RequestId,
        mask: FieldMask,
    ) -> Result<()> {
        self.materialize_unversioned(services, mask)?;
        let message = {
            let mut inner = self.inner.lock();
            let (states, _) = self.entries_for_remote(&mut inner, source, mask);
            Message::UnversionedResponse { node: self.node, ctx: self.ctx, request, mask, states }
        };
        services.send(source, message);
        return Ok(());
    }

    // ========================================================================
    // Remote-side handlers
    // ========================================================================

    fn resolve(services: &Services, entries: &[StateEntry]) -> Result<Vec<(StateRef, FieldMask)>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let (state, _) = services.arena.find_or_create_proxy(&entry.state)?;
            state.record_received(1);
            out.push((state, entry.mask));
        }
        return Ok(out);
    }

    pub fn handle_manager_response(
        &self,
        services: &Services,
        request: RequestId,
        mask: FieldMask,
        current: &[StateEntry],
        previous: &[StateEntry],
    ) -> Result<()> {
        let current = Self::resolve(services, current)?;
        let previous = Self::resolve(services, previous)?;
        let stale = {
            let mut inner = self.inner.lock();
            let mut stale = Vec::new();
            capture(&inner.current, mask, &mut stale);
            capture(&inner.previous, mask, &mut stale);
            filter_map(&mut inner.current, mask);
            filter_map(&mut inner.previous, mask);
            for (state, fields) in current {
                insert(&mut inner.current, state, fields);
            }
            for (state, fields) in previous {
                insert(&mut inner.previous, state, fields);
            }
            inner.remote_valid_fields |= mask;
            inner.outstanding.retain(|pending| pending.request != request);
            debug_assert!(inner.is_sane());
            stale
        };
        drop(stale);
        return Ok(());
    }

    pub fn handle_unversioned_response(
        &self,
        services: &Services,
        request: RequestId,
        mask: FieldMask,
        states: &[StateEntry],
    ) -> Result<()> {
        let states = Self::resolve(services, states)?;
        let mut inner = self.inner.lock();
        filter_map(&mut inner.current, mask);
        for (state, fields) in states {
            insert(&mut inner.current, state, fields);
        }
        inner.remote_valid_fields |= mask;
        inner.unversioned.retain(|pending| pending.request != request);
        debug_assert!(inner.is_sane());
        return Ok(());
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn current_versions(&self) -> BTreeMap<VersionId, FieldMask> {
        return numbers(&self.inner.lock().current);
    }

    pub fn previous_versions(&self) -> BTreeMap<VersionId, FieldMask> {
        return numbers(&self.inner.lock().previous);
    }

    /// Current version states holding `mask`.
    pub fn current_states(&self, mask: FieldMask) -> Vec<(StateRef, FieldMask)> {
        let mut out = Vec::new();
        capture(&self.inner.lock().current, mask, &mut out);
        return out;
    }

    pub fn remote_valid_fields(&self) -> FieldMask {
        return self.inner.lock().remote_valid_fields;
    }

    /// Fields with an advance forwarded to the owner and not yet
    /// acknowledged.
    pub fn pending_advance_summary(&self) -> FieldMask {
        let inner = self.inner.lock();
        return inner.pending_advances.values().fold(FieldMask::EMPTY, |acc, pending| acc | pending.mask);
    }

    /// Number of (logical context, epoch) entries kept to deduplicate
    /// advances and parent updates.
    pub fn recorded_epochs(&self) -> usize {
        let inner = self.inner.lock();
        return inner.previous_advancers.len() + inner.previous_opens.len();
    }

    pub fn outstanding_requests(&self) -> usize {
        let inner = self.inner.lock();
        return inner.outstanding.len() + inner.unversioned.len();
    }

    /// Each field is current in at most one version.
    pub fn sanity_check(&self) -> bool {
        return self.inner.lock().is_sane();
    }
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        return f
            .debug_struct("VersionManager")
            .field("node", &self.node)
            .field("ctx", &self.ctx)
            .field("owner", &inner.owner)
            .field("current", &inner.current)
            .field("previous", &inner.previous)
            .finish();
    }
}
