//! Building blocks shared by the logical and versioning analyses.
//!
//! # Primitives
//!
//! ## Masks
//! - `FieldMask`: 64-field bit-set, the key of all per-field bookkeeping
//!
//! ## Usage
//! - `RegionUsage`: privilege, coherence and reduction operator
//! - `check_dependence_type`: classify the ordering between two usages
//!
//! ## Events
//! - `UserEvent`: triggered once by its owner
//! - `Event`: awaitable handle, merged with `Event::merge`
//!
//! ## Trees
//! - `RegionTree`: navigation queries over regions and partitions
//! - `RegionForest`: in-memory region forest
//! - `RegionTreePath`: per-depth child colors of a traversal
//!
//! ## IDs
//! - `NodeId`, `ContextId`, `AddressSpace`, `OpRef`
//! - `DistributedId`: version states, carrying their owner
//! - `RequestId`: outstanding remote requests

pub mod event;
pub mod id;
pub mod mask;
pub mod tree;
pub mod usage;

pub use event::Event;
pub use event::UserEvent;
pub use id::AddressSpace;
pub use id::Color;
pub use id::ContextId;
pub use id::DistributedId;
pub use id::NodeId;
pub use id::OpId;
pub use id::OpRef;
pub use id::ProjectionEpochId;
pub use id::ReductionOpId;
pub use id::RequestId;
pub use id::ShardId;
pub use id::UniqueId;
pub use id::VersionId;
pub use id::ViewId;
pub use mask::FieldId;
pub use mask::FieldMask;
pub use tree::NodeKind;
pub use tree::NodePath;
pub use tree::RegionForest;
pub use tree::RegionTree;
pub use tree::RegionTreePath;
pub use usage::Coherence;
pub use usage::DependenceType;
pub use usage::Privilege;
pub use usage::RegionUsage;
pub use usage::check_dependence_type;
