//! Version states: the contents of one version of some fields of a node.
//!
//! A version state records which views hold valid data, which fields are
//! dirty or carry pending reductions, and which children were opened below
//! the node while the version was current. Each state has one owner address
//! space; other spaces hold proxies that fetch contents on demand.
//!
//! ## Bookkeeping
//!
//! - The owner tracks `holders` (spaces it sent descriptors to, with counts)
//!   and `valid_instances` (spaces whose proxies received contributions).
//! - A proxy counts descriptors it `received`, returned to the owner when it
//!   drops its last local reference, and stays pinned while it carries a
//!   contribution the owner has not released.
//! - Fetched contents are tracked per request kind so concurrent requests
//!   for the same fields wait on the first one.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::message::RequestKind;
use crate::message::StateDescriptor;
use crate::message::StateEntry;
use crate::message::StatePayload;
use crate::primitives::AddressSpace;
use crate::primitives::Color;
use crate::primitives::DistributedId;
use crate::primitives::Event;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::RequestId;
use crate::primitives::VersionId;
use crate::primitives::ViewId;
use crate::version::arena::StateRef;
use crate::version::set::VersioningSet;

/// Views and masks of a state, restricted to some fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateContents {
    pub dirty_mask: FieldMask,
    pub reduction_mask: FieldMask,
    pub valid_views: BTreeMap<ViewId, FieldMask>,
    pub reduction_views: BTreeMap<ViewId, FieldMask>,
}

fn merge_views(into: &mut BTreeMap<ViewId, FieldMask>, from: &BTreeMap<ViewId, FieldMask>, mask: FieldMask) {
    for (view, held) in from {
        let overlap = *held & mask;
        if !overlap.is_empty() {
            *into.entry(*view).or_default() |= overlap;
        }
    }
}

fn filter_views(views: &BTreeMap<ViewId, FieldMask>, mask: FieldMask) -> BTreeMap<ViewId, FieldMask> {
    let mut out = BTreeMap::new();
    merge_views(&mut out, views, mask);
    return out;
}

impl StateContents {
    pub fn is_empty(&self) -> bool {
        return self.dirty_mask.is_empty()
            && self.reduction_mask.is_empty()
            && self.valid_views.is_empty()
            && self.reduction_views.is_empty();
    }

    pub fn filtered(&self, mask: FieldMask) -> StateContents {
        return StateContents {
            dirty_mask: self.dirty_mask & mask,
            reduction_mask: self.reduction_mask & mask,
            valid_views: filter_views(&self.valid_views, mask),
            reduction_views: filter_views(&self.reduction_views, mask),
        };
    }

    /// Union the `mask` portion of `other` into this.
    pub fn merge(&mut self, other: &StateContents, mask: FieldMask) {
        self.dirty_mask |= other.dirty_mask & mask;
        self.reduction_mask |= other.reduction_mask & mask;
        merge_views(&mut self.valid_views, &other.valid_views, mask);
        merge_views(&mut self.reduction_views, &other.reduction_views, mask);
    }
}

/// A request for some fields of a state that is still in flight.
#[derive(Clone, Debug)]
struct InFlight {
    kind: RequestKind,
    request: RequestId,
    event: Event,
    mask: FieldMask,
}

/// A request the caller must send after [`VersionState::begin_request`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedRequest {
    pub request: RequestId,
    pub mask: FieldMask,
    pub targets: Vec<AddressSpace>,
}

#[derive(Debug, Default)]
pub struct RequestPlan {
    /// Events to wait on before the requested fields are present.
    pub waits: Vec<Event>,
    pub issue: Option<IssuedRequest>,
}

#[derive(Default)]
struct StateInner {
    contents: StateContents,
    open_children: BTreeMap<Color, VersioningSet>,
    child_fields: FieldMask,
    initial_fields: FieldMask,
    final_fields: FieldMask,
    in_flight: Vec<InFlight>,
    valid_instances: BTreeSet<AddressSpace>,
    holders: BTreeMap<AddressSpace, u32>,
    received: u32,
    contributed: bool,
}

impl StateInner {
    fn fetched(&self, kind: RequestKind) -> FieldMask {
        match kind {
            RequestKind::Child => return self.child_fields | self.final_fields,
            RequestKind::Initial => return self.initial_fields | self.final_fields,
            RequestKind::Final => return self.final_fields,
        }
    }

    fn covers(pending: RequestKind, wanted: RequestKind) -> bool {
        return pending == wanted || pending == RequestKind::Final;
    }
}

pub struct VersionState {
    pub did: DistributedId,
    pub version: VersionId,
    pub node: NodeId,
    /// The space holding this copy.
    pub local: AddressSpace,
    refs: AtomicU32,
    inner: Mutex<StateInner>,
}

impl VersionState {
    pub fn new(did: DistributedId, version: VersionId, node: NodeId, local: AddressSpace) -> VersionState {
        return VersionState {
            did,
            version,
            node,
            local,
            refs: AtomicU32::new(0),
            inner: Mutex::new(StateInner::default()),
        };
    }

    pub fn descriptor(&self) -> StateDescriptor {
        return StateDescriptor { did: self.did, version: self.version, node: self.node };
    }

    pub fn owner(&self) -> AddressSpace {
        return self.did.owner();
    }

    pub fn is_owner(&self) -> bool {
        return self.did.owner() == self.local;
    }

    // ========================================================================
    // References
    // ========================================================================

    pub(crate) fn add_local_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when the last local reference went away.
    pub(crate) fn remove_local_ref(&self) -> bool {
        let before = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "{:?} released more references than it had", self.did);
        return before == 1;
    }

    pub fn local_refs(&self) -> u32 {
        return self.refs.load(Ordering::Acquire);
    }

    pub fn add_holder(&self, space: AddressSpace, count: u32) {
        debug_assert!(self.is_owner());
        *self.inner.lock().holders.entry(space).or_default() += count;
    }

    /// Returns true when no space holds a copy any more.
    pub fn remove_holder(&self, space: AddressSpace, count: u32) -> bool {
        let mut inner = self.inner.lock();
        if let Some(held) = inner.holders.get_mut(&space) {
            debug_assert!(*held >= count, "{space:?} returned more references to {:?} than it held", self.did);
            *held = held.saturating_sub(count);
            if *held == 0 {
                inner.holders.remove(&space);
            }
        }
        return inner.holders.is_empty();
    }

    pub fn has_holders(&self) -> bool {
        return !self.inner.lock().holders.is_empty();
    }

    pub fn holder_count(&self, space: AddressSpace) -> u32 {
        return self.inner.lock().holders.get(&space).copied().unwrap_or(0);
    }

    pub fn record_received(&self, count: u32) {
        debug_assert!(!self.is_owner());
        self.inner.lock().received += count;
    }

    pub(crate) fn take_received(&self) -> u32 {
        return std::mem::take(&mut self.inner.lock().received);
    }

    /// A proxy that contributed data stays alive until the owner releases it.
    pub fn is_pinned(&self) -> bool {
        return !self.is_owner() && self.inner.lock().contributed;
    }

    pub(crate) fn clear_pin(&self) {
        self.inner.lock().contributed = false;
    }

    /// Record that `space` holds contributions. Invalidates everything the
    /// owner fetched so far, since it no longer has all the data.
    pub fn add_valid_instance(&self, space: AddressSpace) {
        debug_assert!(self.is_owner());
        let mut inner = self.inner.lock();
        if inner.valid_instances.insert(space) {
            inner.child_fields = FieldMask::EMPTY;
            inner.initial_fields = FieldMask::EMPTY;
            inner.final_fields = FieldMask::EMPTY;
        }
    }

    pub fn valid_instances(&self) -> Vec<AddressSpace> {
        return self.inner.lock().valid_instances.iter().copied().collect();
    }

    // ========================================================================
    // Contents
    // ========================================================================

    pub fn contents(&self, mask: FieldMask) -> StateContents {
        return self.inner.lock().contents.filtered(mask);
    }

    /// Open children for `mask`, per color.
    pub fn children(&self, mask: FieldMask) -> Vec<(Color, Vec<(StateRef, FieldMask)>)> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for (color, set) in &inner.open_children {
            let entries = set.entries_for(mask);
            if !entries.is_empty() {
                out.push((*color, entries));
            }
        }
        return out;
    }

    /// Merge the `mask` portion of `contents`. Returns true when a proxy
    /// receives its first contribution and the owner must be told.
    pub fn merge_physical_state(&self, contents: &StateContents, mask: FieldMask) -> bool {
        let mut inner = self.inner.lock();
        inner.contents.merge(contents, mask);
        return self.mark_contributed(&mut inner);
    }

    /// Replace the open children of `color` for `mask` with `children`,
    /// keeping entries that are already present. Returns true like
    /// [`VersionState::merge_physical_state`].
    pub fn reduce_open_children(&self, color: Color, mask: FieldMask, children: &VersioningSet) -> bool {
        let mut inner = self.inner.lock();
        let set = inner.open_children.entry(color).or_default();
        let mut stale = FieldMask::EMPTY;
        for (state, held) in set.iter() {
            let overlap = held & mask;
            if !overlap.is_empty() && children.get(state.did).is_none_or(|m| !overlap.is_subset_of(m)) {
                stale |= overlap;
            }
        }
        set.filter(stale);
        for (state, held) in children.iter() {
            set.insert(state.clone(), held & mask);
        }
        if set.is_empty() {
            inner.open_children.remove(&color);
        }
        return self.mark_contributed(&mut inner);
    }

    /// Copy the dirty data of `mask` into `target`, which is being created
    /// as the next version of this state.
    pub fn capture_dirty_instances(&self, mask: FieldMask, target: &VersionState) {
        let dirty = {
            let inner = self.inner.lock();
            inner.contents.filtered(mask & inner.contents.dirty_mask)
        };
        if dirty.is_empty() {
            return;
        }
        let mut next = target.inner.lock();
        let dirty_mask = dirty.dirty_mask;
        next.contents.merge(&dirty, dirty_mask);
    }

    fn mark_contributed(&self, inner: &mut StateInner) -> bool {
        if self.is_owner() || inner.contributed {
            return false;
        }
        inner.contributed = true;
        return true;
    }

    // ========================================================================
    // Remote contents
    // ========================================================================

    /// Decide what must be fetched for `kind` over `mask`. Fields already
    /// fetched or in flight are not requested again. `register` is called with
    /// the fields to request and the spaces to ask, and must return the
    /// request's id and completion event.
    pub fn begin_request(
        &self,
        kind: RequestKind,
        mask: FieldMask,
        register: impl FnOnce(FieldMask, &[AddressSpace]) -> (RequestId, Event),
    ) -> RequestPlan {
        let mut inner = self.inner.lock();
        let mut plan = RequestPlan::default();
        let mut needed = mask - inner.fetched(kind);
        for flight in &inner.in_flight {
            if StateInner::covers(flight.kind, kind) && flight.mask.intersects(needed) {
                plan.waits.push(flight.event.clone());
                needed -= flight.mask;
            }
        }
        if needed.is_empty() {
            return plan;
        }
        let targets: Vec<AddressSpace> = if self.is_owner() {
            inner.valid_instances.iter().copied().filter(|s| *s != self.local).collect()
        } else {
            vec![self.owner()]
        };
        if targets.is_empty() {
            Self::mark_fetched(&mut inner, kind, needed);
            return plan;
        }
        let (request, event) = register(needed, &targets);
        inner.in_flight.push(InFlight { kind, request, event: event.clone(), mask: needed });
        plan.waits.push(event);
        plan.issue = Some(IssuedRequest { request, mask: needed, targets });
        return plan;
    }

    pub fn complete_request(&self, kind: RequestKind, request: RequestId, mask: FieldMask) {
        let mut inner = self.inner.lock();
        inner.in_flight.retain(|flight| flight.request != request);
        Self::mark_fetched(&mut inner, kind, mask);
    }

    pub fn requests_in_flight(&self) -> usize {
        return self.inner.lock().in_flight.len();
    }

    fn mark_fetched(inner: &mut StateInner, kind: RequestKind, mask: FieldMask) {
        match kind {
            RequestKind::Child => inner.child_fields |= mask,
            RequestKind::Initial => inner.initial_fields |= mask,
            RequestKind::Final => inner.final_fields |= mask,
        }
    }

    /// Contents of `kind` for `mask`, plus the children whose descriptors the
    /// payload carries.
    pub fn pack_payload(&self, kind: RequestKind, mask: FieldMask) -> (StatePayload, Vec<StateRef>) {
        let inner = self.inner.lock();
        let mut payload = StatePayload::default();
        let mut sent = Vec::new();
        if kind != RequestKind::Child {
            let contents = inner.contents.filtered(mask);
            payload.dirty_mask = contents.dirty_mask;
            payload.reduction_mask = contents.reduction_mask;
            payload.valid_views = contents.valid_views.into_iter().collect();
            payload.reduction_views = contents.reduction_views.into_iter().collect();
        }
        if kind != RequestKind::Initial {
            for (color, set) in &inner.open_children {
                let mut entries = Vec::new();
                for (child, held) in set.iter() {
                    let overlap = held & mask;
                    if overlap.is_empty() {
                        continue;
                    }
                    entries.push(StateEntry { state: child.descriptor(), mask: overlap });
                    sent.push(child.clone());
                }
                if !entries.is_empty() {
                    payload.children.push((*color, entries));
                }
            }
        }
        return (payload, sent);
    }

    /// Fold a fetched payload in. `children` are the payload's child entries
    /// resolved against the local arena.
    pub fn apply_payload(&self, mask: FieldMask, payload: &StatePayload, children: Vec<(Color, StateRef, FieldMask)>) {
        let contents = StateContents {
            dirty_mask: payload.dirty_mask,
            reduction_mask: payload.reduction_mask,
            valid_views: payload.valid_views.iter().copied().collect(),
            reduction_views: payload.reduction_views.iter().copied().collect(),
        };
        let mut inner = self.inner.lock();
        inner.contents.merge(&contents, mask);
        for (color, child, held) in children {
            inner.open_children.entry(color).or_default().insert(child, held & mask);
        }
    }
}

impl fmt::Debug for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("VersionState")
            .field("did", &self.did)
            .field("version", &self.version)
            .field("node", &self.node)
            .field("refs", &self.local_refs())
            .finish();
    }
}
