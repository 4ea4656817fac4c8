//! Distributed versioning.
//!
//! Each (node, context) pair has a [`VersionManager`](manager::VersionManager)
//! in every address space that analyzes it. The managers map version numbers
//! to [`VersionState`](state::VersionState)s, the objects holding one
//! generation of a node's data locations. A requirement's versioning pass
//! records which states it reads and which it writes into a
//! [`VersionInfo`](info::VersionInfo); after the operation ran, the info folds
//! its buffered updates into the states it advanced.
//!
//! ```text
//!   VersionManager (node, ctx)
//!     current:  v3 -> {S7: f0 f1}
//!     previous: v2 -> {S4: f0 f1}
//!                 |
//!                 v
//!   VersionInfo ---- depth d: PhysicalState(S4 read, S7 advance)
//! ```
//!
//! States live in a per-space [`VersionStateArena`](arena::VersionStateArena)
//! and are referenced through [`StateRef`](arena::StateRef) tokens; copies in
//! other spaces are proxies that fetch contents from the owner on demand.

pub mod arena;
pub mod composite;
pub mod info;
pub mod manager;
pub mod owner;
pub mod physical;
pub mod set;
pub mod state;

pub use arena::StateRef;
pub use arena::VersionStateArena;
pub use composite::CompositeNode;
pub use composite::CompositeView;
pub use info::FieldVersions;
pub use info::VersionInfo;
pub use info::VersionTracker;
pub use manager::AdvanceArgs;
pub use manager::AdvanceOutcome;
pub use manager::VersionManager;
pub use owner::OwnerDirectory;
pub use physical::PhysicalState;
pub use set::VersioningSet;
pub use state::StateContents;
pub use state::VersionState;

use crate::primitives::VersionId;

/// Version number of the first state materialized for a field.
pub const INITIAL_VERSION: VersionId = 1;
