//! Two-byte event prefix used for subscription filtering.
//!
//! Every frame on the bus starts with the little-endian tag of its event kind
//! so that the bus hub and subscribers can filter without decoding the body.

use crate::event::EventKind;
use thiserror::Error;

/// Width of the prefix in bytes.
pub const PREFIX_LEN: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrefixError {
    #[error("Malformed message: {len} bytes is shorter than the {PREFIX_LEN}-byte prefix")]
    MalformedMessage { len: usize },
}

/// Tag value for each kind. Stable across the deployment.
pub const fn tag_value(kind: EventKind) -> u16 {
    match kind {
        EventKind::NewImage => 0x0001,
        EventKind::ImageReceived => 0x0002,
        EventKind::ImageScored => 0x0003,
        EventKind::ImageStored => 0x0004,
        EventKind::ImageDeleted => 0x0005,
        EventKind::PluginStarted => 0x0010,
        EventKind::PluginTerminating => 0x0011,
        EventKind::PluginTerminate => 0x0012,
        EventKind::MonitorPowerStart => 0x0020,
        EventKind::MonitorPowerStop => 0x0021,
    }
}

/// Wire bytes of the tag for `kind`.
pub const fn tag_for(kind: EventKind) -> [u8; PREFIX_LEN] {
    tag_value(kind).to_le_bytes()
}

/// Kind for a tag, if the tag is known.
pub fn kind_for(tag: [u8; PREFIX_LEN]) -> Option<EventKind> {
    EventKind::ALL
        .into_iter()
        .find(|kind| tag_for(*kind) == tag)
}

/// Builds a frame from a tag and an encoded body.
pub fn prepend(tag: [u8; PREFIX_LEN], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&tag);
    frame.extend_from_slice(payload);
    frame
}

/// Splits a frame into its tag and body.
pub fn strip(frame: &[u8]) -> Result<([u8; PREFIX_LEN], &[u8]), PrefixError> {
    if frame.len() < PREFIX_LEN {
        return Err(PrefixError::MalformedMessage { len: frame.len() });
    }
    let (tag, payload) = frame.split_at(PREFIX_LEN);
    Ok(([tag[0], tag[1]], payload))
}
