//! Stratum - logical dependence analysis and distributed version tracking
//! for region-based task runtimes.
//!
//! Operations name the data they touch as region requirements: a node of a
//! region tree, a set of fields and a privilege. For every requirement the
//! crate answers two questions:
//!
//! - which earlier operations it must wait for, synthesizing close
//!   operations where children opened by earlier accesses conflict with it
//!   ([`logical`]);
//! - which version states hold the data it reads, and which new ones hold
//!   the data it writes, across address spaces ([`version`]).
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use stratum::Config;
//! use stratum::Runtime;
//! use stratum::logical::RegionRequirement;
//! use stratum::primitives::AddressSpace;
//! use stratum::primitives::ContextId;
//! use stratum::primitives::FieldMask;
//! use stratum::primitives::OpRef;
//! use stratum::primitives::RegionForest;
//! use stratum::primitives::RegionUsage;
//! use stratum::transport::DeliveryMode;
//! use stratum::transport::LocalNetwork;
//! use stratum::version::OwnerDirectory;
//!
//! let forest = Arc::new(RegionForest::new());
//! let root = forest.create_region();
//! let network = LocalNetwork::new(DeliveryMode::Inline);
//! let runtime = Runtime::new(AddressSpace(0), Config::default(), forest, network.clone(), Arc::new(OwnerDirectory::new()));
//! network.attach(&runtime);
//!
//! let ctx = ContextId(0);
//! let fields = FieldMask::from_fields(&[0, 1]);
//! let mut write = RegionRequirement::new(root, root, RegionUsage::read_write(), fields);
//! let mut read = RegionRequirement::new(root, root, RegionUsage::read_only(), fields);
//! runtime.register_logical_user(ctx, OpRef::new(1, 0), 0, &mut write).unwrap();
//! let outcome = runtime.register_logical_user(ctx, OpRef::new(2, 0), 0, &mut read).unwrap();
//! assert_eq!(outcome.predecessors(), vec![OpRef::new(1, 0)]);
//! ```

pub mod config;
pub mod error;
pub mod logical;
pub mod message;
pub mod pool;
pub mod primitives;
pub mod runtime;
pub mod transport;
pub mod version;
pub mod wire;

pub use config::Config;
pub use error::Error;
pub use error::Result;
pub use runtime::Runtime;
