//! Flatbuffer wire codec for events.
//!
//! Layout (schema order, one table per kind, slot 0 is always
//! `event_create_ts`):
//!
//! ```text
//! table Event { event_type: ubyte; event: EventUnion; }
//!
//! union discriminants:
//!   1 NewImage          { ts, image_uuid, image_format, image: [ubyte] }
//!   2 ImageReceived     { ts, image_uuid, image_format }
//!   3 ImageScored       { ts, image_uuid, image_format, scores: [ImageLabelScore] }
//!   4 ImageStored       { ts, image_uuid, image_format, destination }
//!   5 ImageDeleted      { ts, image_uuid, image_format }
//!   6 PluginStarted     { ts, plugin_name, plugin_uuid }
//!   7 PluginTerminating { ts, plugin_name, plugin_uuid }
//!   8 PluginTerminate   { ts, target_plugin_name, target_plugin_uuid }
//!   9 MonitorPowerStart { ts, pids: [int], monitor_types: [ubyte], monitor_start_ts, monitor_seconds: uint }
//!  10 MonitorPowerStop  { ts, pids: [int] }
//!
//! table ImageLabelScore { label: string; probability: float; }
//! ```
//!
//! Encoding goes through `flatbuffers::FlatBufferBuilder`. Decoding uses a
//! bounds-checked table reader so that a hostile or truncated buffer yields a
//! [`DecodeError`] instead of a panic.

use crate::event::{
    Event, EventKind, ImageDeleted, ImageLabelScore, ImageReceived, ImageScored, ImageStored,
    MonitorPowerStart, MonitorPowerStop, MonitorType, NewImage, PluginStarted, PluginTerminate,
    PluginTerminating,
};
use flatbuffers::{FlatBufferBuilder, UnionWIPOffset, VOffsetT, WIPOffset};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown event kind discriminant {0}")]
    UnknownEventKind(u8),

    #[error("Malformed buffer: {0}")]
    Malformed(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("Field {field} is not a valid uuid: {value}")]
    InvalidUuid { field: &'static str, value: String },

    #[error("Invalid monitor type {0}")]
    InvalidMonitorType(u8),
}

impl DecodeError {
    fn malformed(reason: impl Into<String>) -> Self {
        DecodeError::Malformed(reason.into())
    }
}

/// Vtable offset of field `index`.
const fn slot(index: u16) -> VOffsetT {
    4 + 2 * index
}

const VT_EVENT_TYPE: VOffsetT = slot(0);
const VT_EVENT: VOffsetT = slot(1);

/// Union discriminant for a kind.
pub const fn discriminant(kind: EventKind) -> u8 {
    match kind {
        EventKind::NewImage => 1,
        EventKind::ImageReceived => 2,
        EventKind::ImageScored => 3,
        EventKind::ImageStored => 4,
        EventKind::ImageDeleted => 5,
        EventKind::PluginStarted => 6,
        EventKind::PluginTerminating => 7,
        EventKind::PluginTerminate => 8,
        EventKind::MonitorPowerStart => 9,
        EventKind::MonitorPowerStop => 10,
    }
}

/// Kind for a union discriminant.
pub fn kind_for_discriminant(value: u8) -> Result<EventKind, DecodeError> {
    EventKind::ALL
        .into_iter()
        .find(|kind| discriminant(*kind) == value)
        .ok_or(DecodeError::UnknownEventKind(value))
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serializes an event into a flatbuffer (without the bus prefix).
pub fn encode(event: &Event) -> Vec<u8> {
    let capacity = match event {
        Event::NewImage(e) => e.image.len() + 256,
        _ => 256,
    };
    let mut fbb = FlatBufferBuilder::with_capacity(capacity);

    let payload = match event {
        Event::NewImage(e) => write_new_image(&mut fbb, e),
        Event::ImageReceived(e) => {
            write_image_ref(&mut fbb, &e.event_create_ts, &e.image_uuid, &e.image_format, None)
        }
        Event::ImageScored(e) => write_image_scored(&mut fbb, e),
        Event::ImageStored(e) => write_image_ref(
            &mut fbb,
            &e.event_create_ts,
            &e.image_uuid,
            &e.image_format,
            Some(&e.destination),
        ),
        Event::ImageDeleted(e) => {
            write_image_ref(&mut fbb, &e.event_create_ts, &e.image_uuid, &e.image_format, None)
        }
        Event::PluginStarted(e) => write_plugin_ref(
            &mut fbb,
            &e.event_create_ts,
            &e.plugin_name,
            &e.plugin_uuid.hyphenated().to_string(),
        ),
        Event::PluginTerminating(e) => write_plugin_ref(
            &mut fbb,
            &e.event_create_ts,
            &e.plugin_name,
            &e.plugin_uuid.hyphenated().to_string(),
        ),
        Event::PluginTerminate(e) => write_plugin_ref(
            &mut fbb,
            &e.event_create_ts,
            &e.target_plugin_name,
            &e.target_plugin_uuid,
        ),
        Event::MonitorPowerStart(e) => write_monitor_start(&mut fbb, e),
        Event::MonitorPowerStop(e) => write_monitor_stop(&mut fbb, e),
    };

    let root = fbb.start_table();
    fbb.push_slot_always(VT_EVENT, payload);
    fbb.push_slot_always::<u8>(VT_EVENT_TYPE, discriminant(event.kind()));
    let root = fbb.end_table(root);
    fbb.finish_minimal(root);
    fbb.finished_data().to_vec()
}

fn write_new_image(fbb: &mut FlatBufferBuilder<'_>, e: &NewImage) -> WIPOffset<UnionWIPOffset> {
    let ts = fbb.create_string(&e.event_create_ts);
    let uuid = fbb.create_string(&e.image_uuid.hyphenated().to_string());
    let format = fbb.create_string(&e.image_format);
    let image = fbb.create_vector(e.image.as_slice());

    let table = fbb.start_table();
    fbb.push_slot_always(slot(0), ts);
    fbb.push_slot_always(slot(1), uuid);
    fbb.push_slot_always(slot(2), format);
    fbb.push_slot_always(slot(3), image);
    fbb.end_table(table).as_union_value()
}

/// Tables shaped `{ ts, image_uuid, image_format [, destination] }`.
fn write_image_ref(
    fbb: &mut FlatBufferBuilder<'_>,
    ts: &str,
    image_uuid: &Uuid,
    image_format: &str,
    destination: Option<&str>,
) -> WIPOffset<UnionWIPOffset> {
    let ts = fbb.create_string(ts);
    let uuid = fbb.create_string(&image_uuid.hyphenated().to_string());
    let format = fbb.create_string(image_format);
    let destination = destination.map(|d| fbb.create_string(d));

    let table = fbb.start_table();
    fbb.push_slot_always(slot(0), ts);
    fbb.push_slot_always(slot(1), uuid);
    fbb.push_slot_always(slot(2), format);
    if let Some(destination) = destination {
        fbb.push_slot_always(slot(3), destination);
    }
    fbb.end_table(table).as_union_value()
}

fn write_image_scored(
    fbb: &mut FlatBufferBuilder<'_>,
    e: &ImageScored,
) -> WIPOffset<UnionWIPOffset> {
    let ts = fbb.create_string(&e.event_create_ts);
    let uuid = fbb.create_string(&e.image_uuid.hyphenated().to_string());
    let format = fbb.create_string(&e.image_format);

    let mut score_tables = Vec::with_capacity(e.scores.len());
    for score in &e.scores {
        let label = fbb.create_string(&score.label);
        let table = fbb.start_table();
        fbb.push_slot_always(slot(0), label);
        // Always written so that -0.0 and NaN payloads survive bit for bit.
        fbb.push_slot_always::<f32>(slot(1), score.probability);
        score_tables.push(fbb.end_table(table));
    }
    let scores = fbb.create_vector(score_tables.as_slice());

    let table = fbb.start_table();
    fbb.push_slot_always(slot(0), ts);
    fbb.push_slot_always(slot(1), uuid);
    fbb.push_slot_always(slot(2), format);
    fbb.push_slot_always(slot(3), scores);
    fbb.end_table(table).as_union_value()
}

/// Tables shaped `{ ts, name, uuid }`.
fn write_plugin_ref(
    fbb: &mut FlatBufferBuilder<'_>,
    ts: &str,
    name: &str,
    uuid: &str,
) -> WIPOffset<UnionWIPOffset> {
    let ts = fbb.create_string(ts);
    let name = fbb.create_string(name);
    let uuid = fbb.create_string(uuid);

    let table = fbb.start_table();
    fbb.push_slot_always(slot(0), ts);
    fbb.push_slot_always(slot(1), name);
    fbb.push_slot_always(slot(2), uuid);
    fbb.end_table(table).as_union_value()
}

fn write_monitor_start(
    fbb: &mut FlatBufferBuilder<'_>,
    e: &MonitorPowerStart,
) -> WIPOffset<UnionWIPOffset> {
    let ts = fbb.create_string(&e.event_create_ts);
    let pids = fbb.create_vector(e.pids.as_slice());
    let types: Vec<u8> = e.monitor_types.iter().map(|t| t.as_u8()).collect();
    let types = fbb.create_vector(types.as_slice());
    let start_ts = fbb.create_string(&e.monitor_start_ts);

    let table = fbb.start_table();
    fbb.push_slot_always(slot(0), ts);
    fbb.push_slot_always(slot(1), pids);
    fbb.push_slot_always(slot(2), types);
    fbb.push_slot_always(slot(3), start_ts);
    fbb.push_slot::<u32>(slot(4), e.monitor_seconds, 0);
    fbb.end_table(table).as_union_value()
}

fn write_monitor_stop(
    fbb: &mut FlatBufferBuilder<'_>,
    e: &MonitorPowerStop,
) -> WIPOffset<UnionWIPOffset> {
    let ts = fbb.create_string(&e.event_create_ts);
    let pids = fbb.create_vector(e.pids.as_slice());

    let table = fbb.start_table();
    fbb.push_slot_always(slot(0), ts);
    fbb.push_slot_always(slot(1), pids);
    fbb.end_table(table).as_union_value()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Deserializes a flatbuffer (without the bus prefix) into an event.
pub fn decode(buf: &[u8]) -> Result<Event, DecodeError> {
    let root = Table::root(buf)?;
    let disc = root.scalar_u8(VT_EVENT_TYPE, 0)?;
    let kind = kind_for_discriminant(disc)?;
    let t = root
        .table(VT_EVENT)?
        .ok_or(DecodeError::MissingField("event"))?;
    let ts = t.required_string(slot(0), "event_create_ts")?;

    let event = match kind {
        EventKind::NewImage => Event::NewImage(NewImage {
            event_create_ts: ts,
            image_uuid: t.uuid(slot(1), "image_uuid")?,
            image_format: t.required_string(slot(2), "image_format")?,
            image: t.bytes(slot(3))?.map(<[u8]>::to_vec).unwrap_or_default(),
        }),
        EventKind::ImageReceived => Event::ImageReceived(ImageReceived {
            event_create_ts: ts,
            image_uuid: t.uuid(slot(1), "image_uuid")?,
            image_format: t.required_string(slot(2), "image_format")?,
        }),
        EventKind::ImageScored => {
            let mut scores = Vec::new();
            for score in t.tables(slot(3))?.unwrap_or_default() {
                scores.push(ImageLabelScore {
                    label: score.required_string(slot(0), "label")?,
                    probability: score.scalar_f32(slot(1), 0.0)?,
                });
            }
            Event::ImageScored(ImageScored {
                event_create_ts: ts,
                image_uuid: t.uuid(slot(1), "image_uuid")?,
                image_format: t.required_string(slot(2), "image_format")?,
                scores,
            })
        }
        EventKind::ImageStored => Event::ImageStored(ImageStored {
            event_create_ts: ts,
            image_uuid: t.uuid(slot(1), "image_uuid")?,
            image_format: t.required_string(slot(2), "image_format")?,
            destination: t.required_string(slot(3), "destination")?,
        }),
        EventKind::ImageDeleted => Event::ImageDeleted(ImageDeleted {
            event_create_ts: ts,
            image_uuid: t.uuid(slot(1), "image_uuid")?,
            image_format: t.required_string(slot(2), "image_format")?,
        }),
        EventKind::PluginStarted => Event::PluginStarted(PluginStarted {
            event_create_ts: ts,
            plugin_name: t.required_string(slot(1), "plugin_name")?,
            plugin_uuid: t.uuid(slot(2), "plugin_uuid")?,
        }),
        EventKind::PluginTerminating => Event::PluginTerminating(PluginTerminating {
            event_create_ts: ts,
            plugin_name: t.required_string(slot(1), "plugin_name")?,
            plugin_uuid: t.uuid(slot(2), "plugin_uuid")?,
        }),
        EventKind::PluginTerminate => Event::PluginTerminate(PluginTerminate {
            event_create_ts: ts,
            target_plugin_name: t.required_string(slot(1), "target_plugin_name")?,
            target_plugin_uuid: t.required_string(slot(2), "target_plugin_uuid")?,
        }),
        EventKind::MonitorPowerStart => {
            let monitor_types = t
                .bytes(slot(2))?
                .unwrap_or_default()
                .iter()
                .map(|raw| MonitorType::from_u8(*raw).map_err(|_| DecodeError::InvalidMonitorType(*raw)))
                .collect::<Result<Vec<_>, _>>()?;
            Event::MonitorPowerStart(MonitorPowerStart {
                event_create_ts: ts,
                pids: t.i32_vector(slot(1))?.unwrap_or_default(),
                monitor_types,
                monitor_start_ts: t.string(slot(3), "monitor_start_ts")?.unwrap_or_default(),
                monitor_seconds: t.scalar_u32(slot(4), 0)?,
            })
        }
        EventKind::MonitorPowerStop => Event::MonitorPowerStop(MonitorPowerStop {
            event_create_ts: ts,
            pids: t.i32_vector(slot(1))?.unwrap_or_default(),
        }),
    };

    Ok(event)
}

fn read_array<const N: usize>(buf: &[u8], pos: usize) -> Result<[u8; N], DecodeError> {
    buf.get(pos..pos.checked_add(N).ok_or_else(|| DecodeError::malformed("offset overflow"))?)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| DecodeError::malformed(format!("read of {N} bytes at {pos} out of bounds")))
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, DecodeError> {
    read_array::<2>(buf, pos).map(u16::from_le_bytes)
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, DecodeError> {
    read_array::<4>(buf, pos).map(u32::from_le_bytes)
}

fn read_i32(buf: &[u8], pos: usize) -> Result<i32, DecodeError> {
    read_array::<4>(buf, pos).map(i32::from_le_bytes)
}

/// A located flatbuffer table.
#[derive(Debug, Clone, Copy)]
struct Table<'a> {
    buf: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_len: usize,
    table_len: usize,
}

impl<'a> Table<'a> {
    fn root(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let offset = read_u32(buf, 0)? as usize;
        Self::at(buf, offset)
    }

    fn at(buf: &'a [u8], pos: usize) -> Result<Self, DecodeError> {
        let soffset = read_i32(buf, pos)? as i64;
        let vtable = pos as i64 - soffset;
        if vtable < 0 || vtable as usize >= buf.len() {
            return Err(DecodeError::malformed(format!("vtable offset {vtable} out of bounds")));
        }
        let vtable = vtable as usize;
        let vtable_len = read_u16(buf, vtable)? as usize;
        let table_len = read_u16(buf, vtable + 2)? as usize;
        if vtable_len < 4 || vtable_len % 2 != 0 || vtable + vtable_len > buf.len() {
            return Err(DecodeError::malformed(format!("bad vtable length {vtable_len}")));
        }
        if table_len < 4 || pos + table_len > buf.len() {
            return Err(DecodeError::malformed(format!("bad table length {table_len}")));
        }
        Ok(Self {
            buf,
            pos,
            vtable,
            vtable_len,
            table_len,
        })
    }

    /// Absolute position of a field, or None when absent.
    fn field(&self, voffset: VOffsetT) -> Result<Option<usize>, DecodeError> {
        let voffset = voffset as usize;
        if voffset + 2 > self.vtable_len {
            return Ok(None);
        }
        let rel = read_u16(self.buf, self.vtable + voffset)? as usize;
        if rel == 0 {
            return Ok(None);
        }
        if rel >= self.table_len {
            return Err(DecodeError::malformed(format!(
                "field offset {rel} outside table of {} bytes",
                self.table_len
            )));
        }
        Ok(Some(self.pos + rel))
    }

    /// Follows the uoffset stored at a field.
    fn indirect(&self, voffset: VOffsetT) -> Result<Option<usize>, DecodeError> {
        let Some(at) = self.field(voffset)? else {
            return Ok(None);
        };
        let target = at
            .checked_add(read_u32(self.buf, at)? as usize)
            .filter(|t| *t < self.buf.len())
            .ok_or_else(|| DecodeError::malformed(format!("offset at {at} points outside buffer")))?;
        Ok(Some(target))
    }

    fn scalar_u8(&self, voffset: VOffsetT, default: u8) -> Result<u8, DecodeError> {
        match self.field(voffset)? {
            Some(at) => read_array::<1>(self.buf, at).map(|b| b[0]),
            None => Ok(default),
        }
    }

    fn scalar_u32(&self, voffset: VOffsetT, default: u32) -> Result<u32, DecodeError> {
        match self.field(voffset)? {
            Some(at) => read_u32(self.buf, at),
            None => Ok(default),
        }
    }

    fn scalar_f32(&self, voffset: VOffsetT, default: f32) -> Result<f32, DecodeError> {
        match self.field(voffset)? {
            Some(at) => read_array::<4>(self.buf, at).map(f32::from_le_bytes),
            None => Ok(default),
        }
    }

    /// Length-prefixed vector at a field: (start of elements, element count).
    fn vector(&self, voffset: VOffsetT, elem_size: usize) -> Result<Option<(usize, usize)>, DecodeError> {
        let Some(at) = self.indirect(voffset)? else {
            return Ok(None);
        };
        let count = read_u32(self.buf, at)? as usize;
        let start = at + 4;
        let end = count
            .checked_mul(elem_size)
            .and_then(|n| n.checked_add(start))
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| DecodeError::malformed(format!("vector of {count} elements overruns buffer")))?;
        debug_assert!(end >= start);
        Ok(Some((start, count)))
    }

    fn bytes(&self, voffset: VOffsetT) -> Result<Option<&'a [u8]>, DecodeError> {
        Ok(self
            .vector(voffset, 1)?
            .map(|(start, count)| &self.buf[start..start + count]))
    }

    fn string(&self, voffset: VOffsetT, name: &'static str) -> Result<Option<String>, DecodeError> {
        match self.bytes(voffset)? {
            Some(raw) => std::str::from_utf8(raw)
                .map(|s| Some(s.to_string()))
                .map_err(|_| DecodeError::InvalidUtf8(name)),
            None => Ok(None),
        }
    }

    fn required_string(&self, voffset: VOffsetT, name: &'static str) -> Result<String, DecodeError> {
        self.string(voffset, name)?
            .ok_or(DecodeError::MissingField(name))
    }

    fn uuid(&self, voffset: VOffsetT, name: &'static str) -> Result<Uuid, DecodeError> {
        let value = self.required_string(voffset, name)?;
        Uuid::parse_str(&value).map_err(|_| DecodeError::InvalidUuid { field: name, value })
    }

    fn i32_vector(&self, voffset: VOffsetT) -> Result<Option<Vec<i32>>, DecodeError> {
        let Some((start, count)) = self.vector(voffset, 4)? else {
            return Ok(None);
        };
        (0..count)
            .map(|i| read_i32(self.buf, start + i * 4))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    fn table(&self, voffset: VOffsetT) -> Result<Option<Table<'a>>, DecodeError> {
        match self.indirect(voffset)? {
            Some(at) => Table::at(self.buf, at).map(Some),
            None => Ok(None),
        }
    }

    fn tables(&self, voffset: VOffsetT) -> Result<Option<Vec<Table<'a>>>, DecodeError> {
        let Some((start, count)) = self.vector(voffset, 4)? else {
            return Ok(None);
        };
        let mut tables = Vec::with_capacity(count);
        for i in 0..count {
            let at = start + i * 4;
            let target = at
                .checked_add(read_u32(self.buf, at)? as usize)
                .ok_or_else(|| DecodeError::malformed("table offset overflow"))?;
            tables.push(Table::at(self.buf, target)?);
        }
        Ok(Some(tables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::image_uuid;

    fn uuid() -> Uuid {
        image_uuid("/data/traps/IMG_0001.jpg")
    }

    fn sample_events() -> Vec<Event> {
        vec![
            NewImage::new(uuid(), "jpg", vec![0x00, 0x01, 0xff]).into(),
            ImageReceived::new(uuid(), "jpg").into(),
            ImageScored::new(
                uuid(),
                "jpg",
                vec![
                    ImageLabelScore::new("animal", 0.87),
                    ImageLabelScore::new("human", 0.05),
                ],
            )
            .into(),
            ImageStored::new(uuid(), "jpg", "save").into(),
            ImageDeleted::new(uuid(), "jpg").into(),
            PluginStarted::new("image_scoring_plugin", Uuid::new_v4()).into(),
            PluginTerminating::new("image_generating_plugin", Uuid::new_v4()).into(),
            PluginTerminate::wildcard().into(),
            MonitorPowerStart::new(
                vec![101, 202],
                vec![MonitorType::Cpu, MonitorType::Gpu],
                "2024-05-01T12:00:00Z",
                30,
            )
            .unwrap()
            .into(),
            MonitorPowerStop::new(vec![101]).into(),
        ]
    }

    /// Position of the root discriminant byte inside an encoded buffer.
    fn discriminant_position(buf: &[u8]) -> usize {
        Table::root(buf).unwrap().field(VT_EVENT_TYPE).unwrap().unwrap()
    }

    #[test]
    fn test_every_kind_round_trips() {
        for event in sample_events() {
            let encoded = encode(&event);
            let decoded = decode(&encoded).expect("Failed to decode");
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn test_non_ascii_strings_round_trip() {
        let event: Event = ImageStored::new(uuid(), "jpég", "répertoire/猫/🦊").into();
        assert_eq!(decode(&encode(&event)).unwrap(), event);

        let event: Event = PluginStarted::new("plugin-ñandú", Uuid::new_v4()).into();
        assert_eq!(decode(&encode(&event)).unwrap(), event);
    }

    #[test]
    fn test_image_payload_sizes() {
        let large: Vec<u8> = (0..(1024 * 1024 + 17)).map(|i| (i % 251) as u8).collect();
        for image in [Vec::new(), vec![0u8], large] {
            let event: Event = NewImage::new(uuid(), "png", image.clone()).into();
            match decode(&encode(&event)).unwrap() {
                Event::NewImage(decoded) => assert_eq!(decoded.image, image),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn test_probability_bits_preserved() {
        let values = [0.87_f32, -0.0, f32::MIN_POSITIVE, 1.0 / 3.0, f32::NAN];
        let scores = values
            .iter()
            .enumerate()
            .map(|(i, p)| ImageLabelScore::new(format!("label-{i}"), *p))
            .collect();
        let event: Event = ImageScored::new(uuid(), "jpg", scores).into();

        match decode(&encode(&event)).unwrap() {
            Event::ImageScored(decoded) => {
                let bits: Vec<u32> = decoded.scores.iter().map(|s| s.probability.to_bits()).collect();
                let expected: Vec<u32> = values.iter().map(|p| p.to_bits()).collect();
                assert_eq!(bits, expected);
                let labels: Vec<&str> = decoded.scores.iter().map(|s| s.label.as_str()).collect();
                assert_eq!(labels, ["label-0", "label-1", "label-2", "label-3", "label-4"]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_discriminant_rejected() {
        let mut buf = encode(&ImageReceived::new(uuid(), "jpg").into());
        let pos = discriminant_position(&buf);
        for bad in [0u8, 11, 42, 255] {
            buf[pos] = bad;
            assert_eq!(decode(&buf), Err(DecodeError::UnknownEventKind(bad)));
        }
    }

    #[test]
    fn test_discriminant_swap_is_not_misdecoded_silently() {
        // An ImageReceived body relabelled as ImageStored lacks a destination.
        let mut buf = encode(&ImageReceived::new(uuid(), "jpg").into());
        let pos = discriminant_position(&buf);
        buf[pos] = discriminant(EventKind::ImageStored);
        assert_eq!(decode(&buf), Err(DecodeError::MissingField("destination")));
    }

    #[test]
    fn test_truncated_buffers_never_panic() {
        for event in sample_events() {
            let buf = encode(&event);
            for len in 0..buf.len() {
                let _ = decode(&buf[..len]);
            }
        }
        assert!(decode(&[]).is_err());
        assert!(decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_discriminants_follow_schema_order() {
        let values: Vec<u8> = EventKind::ALL.iter().map(|k| discriminant(*k)).collect();
        assert_eq!(values, (1..=10).collect::<Vec<u8>>());
    }
}
