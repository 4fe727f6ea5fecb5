//! Frames as they travel on the bus: prefix followed by the flatbuffer body.

use crate::codec::{self, DecodeError};
use crate::event::{Event, EventKind};
use crate::prefix::{self, PrefixError, PREFIX_LEN};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error(transparent)]
    Prefix(#[from] PrefixError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Unknown prefix tag {0:02x?}")]
    UnknownTag([u8; PREFIX_LEN]),

    #[error("Prefix says {prefix} but body decodes as {body}")]
    PrefixMismatch { prefix: EventKind, body: EventKind },
}

/// Encodes an event and prepends its kind tag.
pub fn to_wire(event: &Event) -> Vec<u8> {
    prefix::prepend(prefix::tag_for(event.kind()), &codec::encode(event))
}

/// Kind announced by a frame's prefix, without decoding the body.
pub fn peek_kind(frame: &[u8]) -> Result<EventKind, WireError> {
    let (tag, _) = prefix::strip(frame)?;
    prefix::kind_for(tag).ok_or(WireError::UnknownTag(tag))
}

/// Strips the prefix, decodes the body and checks that both agree.
pub fn from_wire(frame: &[u8]) -> Result<Event, WireError> {
    let (tag, body) = prefix::strip(frame)?;
    let announced = prefix::kind_for(tag).ok_or(WireError::UnknownTag(tag))?;
    let event = codec::decode(body)?;
    if event.kind() != announced {
        return Err(WireError::PrefixMismatch {
            prefix: announced,
            body: event.kind(),
        });
    }
    Ok(event)
}
