//! Wire framing of messages and packed version information.
//!
//! Every frame starts with [`WIRE_SCHEMA_VERSION`]; a receiver rejects frames
//! of another schema before looking at the payload.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::error::Result;
use crate::message::Message;
use crate::primitives::AddressSpace;

pub const WIRE_SCHEMA_VERSION: u16 = 1;

#[derive(Serialize)]
struct OutgoingFrame<'a> {
    schema_version: u16,
    source: AddressSpace,
    message: &'a Message,
}

#[derive(Deserialize)]
struct IncomingFrame {
    schema_version: u16,
    source: AddressSpace,
    message: Message,
}

#[derive(Deserialize)]
struct FrameHeader {
    schema_version: u16,
}

fn check_schema(bytes: &[u8]) -> Result<()> {
    let header: FrameHeader = bincode::deserialize(bytes)?;
    if header.schema_version != WIRE_SCHEMA_VERSION {
        return Err(Error::SchemaMismatch { found: header.schema_version, expected: WIRE_SCHEMA_VERSION });
    }
    return Ok(());
}

pub fn encode(source: AddressSpace, message: &Message) -> Result<Vec<u8>> {
    let frame = OutgoingFrame { schema_version: WIRE_SCHEMA_VERSION, source, message };
    return Ok(bincode::serialize(&frame)?);
}

pub fn decode(bytes: &[u8]) -> Result<(AddressSpace, Message)> {
    check_schema(bytes)?;
    let frame: IncomingFrame = bincode::deserialize(bytes)?;
    debug_assert_eq!(frame.schema_version, WIRE_SCHEMA_VERSION);
    return Ok((frame.source, frame.message));
}

/// Frame any serializable value, such as packed version information.
pub fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    return Ok(bincode::serialize(&(WIRE_SCHEMA_VERSION, value))?);
}

pub fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    check_schema(bytes)?;
    let (_, value): (u16, T) = bincode::deserialize(bytes)?;
    return Ok(value);
}
