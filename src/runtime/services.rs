//! Per-address-space services shared by the analyses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::message::Message;
use crate::message::Outbound;
use crate::message::RequestKind;
use crate::primitives::AddressSpace;
use crate::primitives::ContextId;
use crate::primitives::DistributedId;
use crate::primitives::Event;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::OpRef;
use crate::primitives::RegionTree;
use crate::primitives::RequestId;
use crate::primitives::UserEvent;
use crate::transport::Transport;
use crate::version::arena::VersionStateArena;
use crate::version::owner::OwnerDirectory;

/// Sets smaller than this are never swept.
const MIN_COMMIT_SWEEP: usize = 64;

#[derive(Debug, Default)]
struct CommitInner {
    committed: FxHashSet<OpRef>,
    sweep_at: usize,
}

/// Operations known to have committed. Logical users of committed operations
/// can be pruned without recording dependences on them. Entries are retired
/// once no logical user refers to them anymore.
#[derive(Debug, Default)]
pub struct CommitSet {
    inner: Mutex<CommitInner>,
}

impl CommitSet {
    pub fn new() -> CommitSet {
        return CommitSet::default();
    }

    /// Record `op` as committed. Returns true once the set has grown enough
    /// that a sweep is due.
    pub fn commit(&self, op: OpRef) -> bool {
        let mut inner = self.inner.lock();
        inner.committed.insert(op);
        return inner.committed.len() >= inner.sweep_at.max(MIN_COMMIT_SWEEP);
    }

    pub fn is_committed(&self, op: OpRef) -> bool {
        return self.inner.lock().committed.contains(&op);
    }

    pub fn len(&self) -> usize {
        return self.inner.lock().committed.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// The operations committed so far.
    pub fn snapshot(&self) -> Vec<OpRef> {
        return self.inner.lock().committed.iter().copied().collect();
    }

    /// Forget the `candidates` that are not `live`. Operations committed
    /// after the candidates were taken are kept. Returns how many were
    /// forgotten.
    pub fn retire(&self, candidates: Vec<OpRef>, live: &FxHashSet<OpRef>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.committed.len();
        for op in candidates {
            if !live.contains(&op) {
                inner.committed.remove(&op);
            }
        }
        inner.sweep_at = inner.committed.len() * 2;
        return before - inner.committed.len();
    }
}

/// Close operations carry this bit so they never collide with operation ids
/// handed in by callers.
const CLOSE_OP_BIT: u64 = 1 << 63;
const CLOSE_SPACE_SHIFT: u32 = 40;

#[derive(Debug)]
pub struct IdAllocator {
    space: AddressSpace,
    next_close: AtomicU64,
    next_request: AtomicU64,
}

impl IdAllocator {
    pub fn new(space: AddressSpace) -> IdAllocator {
        return IdAllocator { space, next_close: AtomicU64::new(1), next_request: AtomicU64::new(1) };
    }

    pub fn next_close_op(&self) -> OpRef {
        let seq = self.next_close.fetch_add(1, Ordering::Relaxed);
        return OpRef::new(CLOSE_OP_BIT | ((self.space.0 as u64) << CLOSE_SPACE_SHIFT) | seq, 0);
    }

    pub fn next_request(&self) -> RequestId {
        return RequestId::new(self.space, self.next_request.fetch_add(1, Ordering::Relaxed));
    }
}

/// Progress of a version-state request: one response from the owner, which
/// announces how many forwarded responses follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateProgress {
    pub did: DistributedId,
    pub kind: RequestKind,
    pub mask: FieldMask,
    pub owner_responded: bool,
    pub expected: u32,
    pub received: u32,
    seen: BTreeMap<AddressSpace, FieldMask>,
}

impl StateProgress {
    pub fn new(did: DistributedId, kind: RequestKind, mask: FieldMask) -> StateProgress {
        return StateProgress {
            did,
            kind,
            mask,
            owner_responded: false,
            expected: 0,
            received: 0,
            seen: BTreeMap::new(),
        };
    }

    /// Progress of a request the owner itself sends to `targets` holders.
    pub fn from_owner(did: DistributedId, kind: RequestKind, mask: FieldMask, targets: usize) -> StateProgress {
        let mut progress = StateProgress::new(did, kind, mask);
        progress.owner_responded = true;
        progress.expected = targets as u32;
        return progress;
    }

    fn is_complete(&self) -> bool {
        return self.owner_responded && self.received == self.expected;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    Manager { node: NodeId, ctx: ContextId },
    Unversioned { node: NodeId, ctx: ContextId },
    Advance { node: NodeId, ctx: ContextId },
    Invalidate { node: NodeId, ctx: ContextId },
    Notify { did: DistributedId },
    State(StateProgress),
}

#[derive(Debug)]
pub struct PendingRequest {
    pub kind: Pending,
    event: UserEvent,
}

impl PendingRequest {
    pub fn complete(self) {
        self.event.trigger();
    }
}

/// Requests this space issued and has not seen completed.
#[derive(Debug, Default)]
pub struct RequestTable {
    pending: Mutex<FxHashMap<RequestId, PendingRequest>>,
}

impl RequestTable {
    pub fn new() -> RequestTable {
        return RequestTable::default();
    }

    pub fn register(&self, request: RequestId, kind: Pending) -> Event {
        let event = UserEvent::new();
        let observer = event.event();
        let previous = self.pending.lock().insert(request, PendingRequest { kind, event });
        debug_assert!(previous.is_none(), "request {request:?} registered twice");
        return observer;
    }

    pub fn take(&self, request: RequestId) -> Result<PendingRequest> {
        return self.pending.lock().remove(&request).ok_or(Error::UnknownRequest(request));
    }

    /// Account one response to a version-state request. Returns the request
    /// once every expected response arrived.
    pub fn record_state_response(
        &self,
        request: RequestId,
        source: AddressSpace,
        from_owner: bool,
        forwarded: u32,
        mask: FieldMask,
    ) -> Result<Option<PendingRequest>> {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&request) else {
            return Err(Error::UnknownRequest(request));
        };
        let Pending::State(progress) = &mut entry.kind else {
            return Err(Error::UnknownRequest(request));
        };
        let seen = progress.seen.entry(source).or_default();
        debug_assert!(seen.is_disjoint(mask), "{source:?} updated {:?} twice for {request:?}", *seen & mask);
        *seen |= mask;
        if from_owner {
            progress.owner_responded = true;
            progress.expected += forwarded;
        } else {
            progress.received += 1;
        }
        if !progress.is_complete() {
            return Ok(None);
        }
        return Ok(pending.remove(&request));
    }

    pub fn len(&self) -> usize {
        return self.pending.lock().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }
}

/// Everything a version manager or traversal needs from its address space.
pub struct Services {
    pub space: AddressSpace,
    pub config: Config,
    pub tree: Arc<dyn RegionTree>,
    pub transport: Arc<dyn Transport>,
    pub directory: Arc<OwnerDirectory>,
    pub arena: VersionStateArena,
    pub requests: RequestTable,
    pub ids: IdAllocator,
    pub commits: CommitSet,
}

impl Services {
    pub fn new(
        space: AddressSpace,
        config: Config,
        tree: Arc<dyn RegionTree>,
        transport: Arc<dyn Transport>,
        directory: Arc<OwnerDirectory>,
    ) -> Services {
        return Services {
            space,
            config,
            tree,
            transport,
            directory,
            arena: VersionStateArena::new(space),
            requests: RequestTable::new(),
            ids: IdAllocator::new(space),
            commits: CommitSet::new(),
        };
    }

    pub fn send(&self, target: AddressSpace, message: Message) {
        tracing::trace!(from = ?self.space, to = ?target, message = message.name(), "send");
        self.transport.send(self.space, target, message);
    }

    pub fn send_all(&self, outbound: Vec<Outbound>) {
        for out in outbound {
            self.send(out.target, out.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_ops_are_tagged_per_space() {
        let a = IdAllocator::new(AddressSpace(1));
        let b = IdAllocator::new(AddressSpace(2));
        let first = a.next_close_op();
        assert_ne!(first, a.next_close_op());
        assert_ne!(first, b.next_close_op());
        assert!(first.op.0 & CLOSE_OP_BIT != 0);
        assert_eq!(a.next_request().issuer(), AddressSpace(1));
    }

    #[test]
    fn commits_are_remembered() {
        let commits = CommitSet::new();
        assert!(!commits.is_committed(OpRef::new(4, 1)));
        commits.commit(OpRef::new(4, 1));
        assert!(commits.is_committed(OpRef::new(4, 1)));
        assert!(!commits.is_committed(OpRef::new(4, 2)));
    }

    #[test]
    fn retired_commits_are_forgotten_unless_live() {
        let commits = CommitSet::new();
        for i in 0..MIN_COMMIT_SWEEP as u64 - 1 {
            assert!(!commits.commit(OpRef::new(i, 0)));
        }
        assert!(commits.commit(OpRef::new(1000, 0)));

        let candidates = commits.snapshot();
        // Committed while the sweep was collecting live users.
        commits.commit(OpRef::new(2000, 0));
        let live: FxHashSet<OpRef> = [OpRef::new(3, 0), OpRef::new(1000, 0)].into_iter().collect();
        assert_eq!(commits.retire(candidates, &live), MIN_COMMIT_SWEEP - 2);
        assert_eq!(commits.len(), 3);
        assert!(commits.is_committed(OpRef::new(3, 0)));
        assert!(commits.is_committed(OpRef::new(2000, 0)));
        assert!(!commits.is_committed(OpRef::new(4, 0)));

        // The next sweep waits for the set to grow again.
        assert!(!commits.commit(OpRef::new(4, 0)));
    }

    #[test]
    fn state_requests_wait_for_forwarded_responses() {
        let table = RequestTable::new();
        let request = RequestId::new(AddressSpace(1), 1);
        let did = DistributedId::new(AddressSpace(0), 1);
        let mask = FieldMask::single(0);
        let event = table.register(request, Pending::State(StateProgress::new(did, RequestKind::Final, mask)));

        // A forwarded response can overtake the owner's.
        let early = table.record_state_response(request, AddressSpace(2), false, 0, mask);
        assert!(matches!(early, Ok(None)));
        let owner = table.record_state_response(request, AddressSpace(0), true, 2, mask);
        assert!(matches!(owner, Ok(None)));
        let last = table.record_state_response(request, AddressSpace(3), false, 0, mask);
        let Ok(Some(done)) = last else {
            panic!("request should be complete");
        };
        assert!(!event.has_triggered());
        done.complete();
        assert!(event.has_triggered());
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_requests_are_errors() {
        let table = RequestTable::new();
        let request = RequestId::new(AddressSpace(0), 9);
        assert!(matches!(table.take(request), Err(Error::UnknownRequest(_))));
    }
}
