//! Messages exchanged between address spaces.
//!
//! | message | sender → receiver | purpose |
//! |---|---|---|
//! | `Advance` | remote → owner | advance versions of a manager |
//! | `Invalidate` | owner → remote | revoke a remote copy of some fields |
//! | `ManagerRequest` / `ManagerResponse` | remote ↔ owner | fetch a manager's version states |
//! | `StateRequest` / `StateResponse` | any ↔ owner or holder | fetch a version state's contents |
//! | `UnversionedRequest` / `UnversionedResponse` | remote ↔ owner | materialize first versions |
//! | `ValidNotification` | holder → owner | a copy or contribution now exists at the holder |
//! | `RemoveReference` | holder → owner, owner → contributor | release copies |
//! | `Ack` | any | completes advances, invalidations and notifications |
//!
//! Version states travel as [`StateDescriptor`]s; the receiver resolves them
//! against its arena, creating proxies as needed.

use serde::Deserialize;
use serde::Serialize;

use crate::primitives::AddressSpace;
use crate::primitives::Color;
use crate::primitives::ContextId;
use crate::primitives::DistributedId;
use crate::primitives::FieldMask;
use crate::primitives::NodeId;
use crate::primitives::ProjectionEpochId;
use crate::primitives::RequestId;
use crate::primitives::UniqueId;
use crate::primitives::VersionId;
use crate::primitives::ViewId;

/// Enough to name a version state and create a proxy for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateDescriptor {
    pub did: DistributedId,
    pub version: VersionId,
    pub node: NodeId,
}

impl StateDescriptor {
    pub fn owner(&self) -> AddressSpace {
        return self.did.owner();
    }
}

/// A version state together with the fields it holds in some set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: StateDescriptor,
    pub mask: FieldMask,
}

/// What part of a version state a request wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Open children only.
    Child,
    /// Masks and valid views, no children.
    Initial,
    /// Everything.
    Final,
}

/// Contents of a version state restricted to a field mask.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub dirty_mask: FieldMask,
    pub reduction_mask: FieldMask,
    pub valid_views: Vec<(ViewId, FieldMask)>,
    pub reduction_views: Vec<(ViewId, FieldMask)>,
    pub children: Vec<(Color, Vec<StateEntry>)>,
}

/// What a valid notification announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoticeKind {
    /// The source holds a copy it did not receive from the owner.
    Holder,
    /// The source merged data into its copy.
    Contribution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceRequest {
    pub node: NodeId,
    pub ctx: ContextId,
    pub request: RequestId,
    pub mask: FieldMask,
    pub logical_uid: UniqueId,
    pub update_parent: bool,
    pub dedup_opens: bool,
    pub open_epoch: ProjectionEpochId,
    pub dedup_advances: bool,
    pub advance_epoch: ProjectionEpochId,
    pub dirty_previous: Option<FieldMask>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Advance(AdvanceRequest),
    Invalidate {
        node: NodeId,
        ctx: ContextId,
        request: RequestId,
        mask: FieldMask,
    },
    ManagerRequest {
        node: NodeId,
        ctx: ContextId,
        request: RequestId,
        mask: FieldMask,
    },
    ManagerResponse {
        node: NodeId,
        ctx: ContextId,
        request: RequestId,
        mask: FieldMask,
        current: Vec<StateEntry>,
        previous: Vec<StateEntry>,
    },
    StateRequest {
        did: DistributedId,
        requester: AddressSpace,
        request: RequestId,
        mask: FieldMask,
        kind: RequestKind,
    },
    StateResponse {
        did: DistributedId,
        request: RequestId,
        mask: FieldMask,
        kind: RequestKind,
        payload: StatePayload,
        from_owner: bool,
        /// Responses the owner asked other holders to send.
        forwarded: u32,
    },
    UnversionedRequest {
        node: NodeId,
        ctx: ContextId,
        request: RequestId,
        mask: FieldMask,
    },
    UnversionedResponse {
        node: NodeId,
        ctx: ContextId,
        request: RequestId,
        mask: FieldMask,
        states: Vec<StateEntry>,
    },
    ValidNotification {
        did: DistributedId,
        source: AddressSpace,
        kind: NoticeKind,
        /// Acknowledge with this request id once recorded.
        request: Option<RequestId>,
    },
    RemoveReference {
        did: DistributedId,
        /// Descriptors the sender received; zero from an owner releasing a
        /// contributor's pinned copy.
        count: u32,
    },
    Ack {
        request: RequestId,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Advance(_) => return "advance",
            Message::Invalidate { .. } => return "invalidate",
            Message::ManagerRequest { .. } => return "manager-request",
            Message::ManagerResponse { .. } => return "manager-response",
            Message::StateRequest { .. } => return "state-request",
            Message::StateResponse { .. } => return "state-response",
            Message::UnversionedRequest { .. } => return "unversioned-request",
            Message::UnversionedResponse { .. } => return "unversioned-response",
            Message::ValidNotification { .. } => return "valid-notification",
            Message::RemoveReference { .. } => return "remove-reference",
            Message::Ack { .. } => return "ack",
        }
    }
}

/// A message waiting to be sent once locks are released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub target: AddressSpace,
    pub message: Message,
}

impl Outbound {
    pub fn new(target: AddressSpace, message: Message) -> Outbound {
        return Outbound { target, message };
    }
}
