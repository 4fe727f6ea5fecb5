//! # Camtrap Events
//!
//! Typed events exchanged between pipeline plugins and their binary encoding.
//!
//! A frame on the bus is a two-byte little-endian kind tag followed by a
//! flatbuffer body:
//!
//! ```text
//! +---------+---------------------------------------------+
//! | tag u16 | flatbuffer Event { event_type, event union } |
//! +---------+---------------------------------------------+
//! ```
//!
//! The tag lets the bus hub and subscribers filter frames without decoding
//! them. [`to_wire`] and [`from_wire`] handle both layers at once.
//!
//! ## Example
//!
//! ```
//! use camtrap_events::{from_wire, ids, to_wire, Event, ImageReceived};
//!
//! let uuid = ids::image_uuid("/srv/traps/IMG_0001.jpg");
//! let event: Event = ImageReceived::new(uuid, "jpg").into();
//! let frame = to_wire(&event);
//! assert_eq!(from_wire(&frame).unwrap(), event);
//! ```

pub mod codec;
pub mod event;
pub mod ids;
pub mod prefix;
pub mod wire;

pub use codec::{decode, encode, DecodeError};
pub use event::{
    parse_timestamp, timestamp_now, Event, EventError, EventKind, ImageDeleted, ImageLabelScore,
    ImageReceived, ImageScored, ImageStored, MonitorPowerStart, MonitorPowerStop, MonitorType,
    NewImage, PluginStarted, PluginTerminate, PluginTerminating, EMPTY_LABEL, WILDCARD_TARGET,
};
pub use prefix::{PrefixError, PREFIX_LEN};
pub use wire::{from_wire, peek_kind, to_wire, WireError};
