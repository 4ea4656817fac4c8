//! Error type for the fallible boundaries of the crate.
//!
//! Protocol invariants are `debug_assert!`s; the variants here cover input
//! that can legitimately be wrong: bytes off the wire, messages naming state
//! this space no longer has, bad region-tree paths and configuration.

use thiserror::Error;

use crate::primitives::id::AddressSpace;
use crate::primitives::id::DistributedId;
use crate::primitives::id::NodeId;
use crate::primitives::id::RequestId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("wire codec failure: {0}")]
    Wire(#[from] bincode::Error),

    #[error("wire schema version {found} does not match {expected}")]
    SchemaMismatch { found: u16, expected: u16 },

    #[error("unknown version state {0:?}")]
    UnknownVersionState(DistributedId),

    #[error("unknown request {0:?}")]
    UnknownRequest(RequestId),

    #[error("node {target:?} is not below {upper:?}")]
    InvalidPath { upper: NodeId, target: NodeId },

    #[error("address space {space:?} does not own the versions of {node:?}")]
    NotOwner { node: NodeId, space: AddressSpace },

    #[error("address space {0:?} is not attached to the transport")]
    UnknownAddressSpace(AddressSpace),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Error {
        return Error::Config(err.to_string());
    }
}

pub type Result<T> = std::result::Result<T, Error>;
