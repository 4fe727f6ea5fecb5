//! Event structures exchanged between plugins.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Target value that addresses every plugin in a `PluginTerminate`.
pub const WILDCARD_TARGET: &str = "*";

/// Label used when the detector finds nothing in an image.
pub const EMPTY_LABEL: &str = "empty";

/// Errors raised when constructing an event with invalid fields.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("MonitorPowerStart requires at least one pid")]
    NoPids,

    #[error("MonitorPowerStart requires at least one monitor type")]
    NoMonitorTypes,

    #[error("Invalid monitor start timestamp '{0}': expected RFC 3339")]
    InvalidStartTimestamp(String),

    #[error("Unknown monitor type {0}")]
    UnknownMonitorType(u8),
}

/// Current UTC time as an RFC 3339 string, used for `event_create_ts`.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses an `event_create_ts` value.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    NewImage,
    ImageReceived,
    ImageScored,
    ImageStored,
    ImageDeleted,
    PluginStarted,
    PluginTerminating,
    PluginTerminate,
    MonitorPowerStart,
    MonitorPowerStop,
}

impl EventKind {
    /// Every kind, in wire discriminant order.
    pub const ALL: [EventKind; 10] = [
        EventKind::NewImage,
        EventKind::ImageReceived,
        EventKind::ImageScored,
        EventKind::ImageStored,
        EventKind::ImageDeleted,
        EventKind::PluginStarted,
        EventKind::PluginTerminating,
        EventKind::PluginTerminate,
        EventKind::MonitorPowerStart,
        EventKind::MonitorPowerStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewImage => "NewImage",
            EventKind::ImageReceived => "ImageReceived",
            EventKind::ImageScored => "ImageScored",
            EventKind::ImageStored => "ImageStored",
            EventKind::ImageDeleted => "ImageDeleted",
            EventKind::PluginStarted => "PluginStarted",
            EventKind::PluginTerminating => "PluginTerminating",
            EventKind::PluginTerminate => "PluginTerminate",
            EventKind::MonitorPowerStart => "MonitorPowerStart",
            EventKind::MonitorPowerStop => "MonitorPowerStop",
        }
    }

    /// Parses a kind name. The legacy `...Event` suffix is accepted.
    pub fn from_name(name: &str) -> Option<EventKind> {
        let name = name.strip_suffix("Event").unwrap_or(name);
        EventKind::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Kinds that end an image's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::ImageStored | EventKind::ImageDeleted)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw image payload published by the ingestion producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewImage {
    pub event_create_ts: String,
    /// Deterministic id derived from the image source (see [`crate::ids::image_uuid`])
    pub image_uuid: Uuid,
    /// File extension, e.g. "jpg"
    pub image_format: String,
    /// Image bytes, never transcoded
    pub image: Vec<u8>,
}

impl NewImage {
    pub fn new(image_uuid: Uuid, image_format: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            event_create_ts: timestamp_now(),
            image_uuid,
            image_format: image_format.into(),
            image,
        }
    }
}

/// Acknowledges that an image entered the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReceived {
    pub event_create_ts: String,
    pub image_uuid: Uuid,
    pub image_format: String,
}

impl ImageReceived {
    pub fn new(image_uuid: Uuid, image_format: impl Into<String>) -> Self {
        Self {
            event_create_ts: timestamp_now(),
            image_uuid,
            image_format: image_format.into(),
        }
    }
}

/// One label/confidence pair of a scored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLabelScore {
    pub label: String,
    pub probability: f32,
}

impl ImageLabelScore {
    pub fn new(label: impl Into<String>, probability: f32) -> Self {
        Self {
            label: label.into(),
            probability,
        }
    }

    /// The single entry reported for an image without detections.
    pub fn empty() -> Self {
        Self::new(EMPTY_LABEL, 0.0)
    }
}

/// Scores assigned to an image by the inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageScored {
    pub event_create_ts: String,
    pub image_uuid: Uuid,
    pub image_format: String,
    /// Never empty when built through [`ImageScored::new`]
    pub scores: Vec<ImageLabelScore>,
}

impl ImageScored {
    /// Builds the event, substituting the `empty/0.0` entry for an empty list.
    pub fn new(
        image_uuid: Uuid,
        image_format: impl Into<String>,
        scores: Vec<ImageLabelScore>,
    ) -> Self {
        let scores = if scores.is_empty() {
            vec![ImageLabelScore::empty()]
        } else {
            scores
        };
        Self {
            event_create_ts: timestamp_now(),
            image_uuid,
            image_format: image_format.into(),
            scores,
        }
    }

    /// Highest probability across all labels, 0.0 when there are none.
    pub fn highest_probability(&self) -> f32 {
        self.scores
            .iter()
            .map(|s| s.probability)
            .fold(0.0_f32, f32::max)
    }
}

/// An image was written to a terminal location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStored {
    pub event_create_ts: String,
    pub image_uuid: Uuid,
    pub image_format: String,
    /// Destination tag, e.g. "save" or "reduce_save"
    pub destination: String,
}

impl ImageStored {
    pub fn new(
        image_uuid: Uuid,
        image_format: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            event_create_ts: timestamp_now(),
            image_uuid,
            image_format: image_format.into(),
            destination: destination.into(),
        }
    }
}

/// An image was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDeleted {
    pub event_create_ts: String,
    pub image_uuid: Uuid,
    pub image_format: String,
}

impl ImageDeleted {
    pub fn new(image_uuid: Uuid, image_format: impl Into<String>) -> Self {
        Self {
            event_create_ts: timestamp_now(),
            image_uuid,
            image_format: image_format.into(),
        }
    }
}

/// A plugin announcing it is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStarted {
    pub event_create_ts: String,
    pub plugin_name: String,
    pub plugin_uuid: Uuid,
}

impl PluginStarted {
    pub fn new(plugin_name: impl Into<String>, plugin_uuid: Uuid) -> Self {
        Self {
            event_create_ts: timestamp_now(),
            plugin_name: plugin_name.into(),
            plugin_uuid,
        }
    }
}

/// A plugin announcing its own voluntary exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginTerminating {
    pub event_create_ts: String,
    pub plugin_name: String,
    pub plugin_uuid: Uuid,
}

impl PluginTerminating {
    pub fn new(plugin_name: impl Into<String>, plugin_uuid: Uuid) -> Self {
        Self {
            event_create_ts: timestamp_now(),
            plugin_name: plugin_name.into(),
            plugin_uuid,
        }
    }
}

/// Command telling one plugin, or every plugin via `"*"`, to shut down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginTerminate {
    pub event_create_ts: String,
    pub target_plugin_name: String,
    /// Hyphenated uuid or `"*"`
    pub target_plugin_uuid: String,
}

impl PluginTerminate {
    pub fn new(target_plugin_name: impl Into<String>, target_plugin_uuid: impl Into<String>) -> Self {
        Self {
            event_create_ts: timestamp_now(),
            target_plugin_name: target_plugin_name.into(),
            target_plugin_uuid: target_plugin_uuid.into(),
        }
    }

    /// Terminate addressed to every plugin.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD_TARGET, WILDCARD_TARGET)
    }

    pub fn is_wildcard(&self) -> bool {
        self.target_plugin_name == WILDCARD_TARGET || self.target_plugin_uuid == WILDCARD_TARGET
    }
}

/// Devices a power monitor can sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    All = 1,
    Cpu = 2,
    Gpu = 3,
    Dram = 4,
}

impl MonitorType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self, EventError> {
        match value {
            1 => Ok(MonitorType::All),
            2 => Ok(MonitorType::Cpu),
            3 => Ok(MonitorType::Gpu),
            4 => Ok(MonitorType::Dram),
            other => Err(EventError::UnknownMonitorType(other)),
        }
    }

    /// Concrete devices behind this type; `All` expands to every device.
    pub fn devices(self) -> &'static [MonitorType] {
        match self {
            MonitorType::All => &[MonitorType::Cpu, MonitorType::Gpu, MonitorType::Dram],
            MonitorType::Cpu => &[MonitorType::Cpu],
            MonitorType::Gpu => &[MonitorType::Gpu],
            MonitorType::Dram => &[MonitorType::Dram],
        }
    }
}

impl fmt::Display for MonitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorType::All => "all",
            MonitorType::Cpu => "cpu",
            MonitorType::Gpu => "gpu",
            MonitorType::Dram => "dram",
        };
        f.write_str(name)
    }
}

/// Request to start sampling power for a set of processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorPowerStart {
    pub event_create_ts: String,
    pub pids: Vec<i32>,
    pub monitor_types: Vec<MonitorType>,
    /// Empty for "now", otherwise RFC 3339
    pub monitor_start_ts: String,
    /// 0 means until stopped
    pub monitor_seconds: u32,
}

impl MonitorPowerStart {
    pub fn new(
        pids: Vec<i32>,
        monitor_types: Vec<MonitorType>,
        monitor_start_ts: impl Into<String>,
        monitor_seconds: u32,
    ) -> Result<Self, EventError> {
        let monitor_start_ts = monitor_start_ts.into();
        if pids.is_empty() {
            return Err(EventError::NoPids);
        }
        if monitor_types.is_empty() {
            return Err(EventError::NoMonitorTypes);
        }
        if !monitor_start_ts.is_empty() && parse_timestamp(&monitor_start_ts).is_none() {
            return Err(EventError::InvalidStartTimestamp(monitor_start_ts));
        }
        Ok(Self {
            event_create_ts: timestamp_now(),
            pids,
            monitor_types,
            monitor_start_ts,
            monitor_seconds,
        })
    }
}

/// Request to stop sampling. An empty pid list stops every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorPowerStop {
    pub event_create_ts: String,
    pub pids: Vec<i32>,
}

impl MonitorPowerStop {
    pub fn new(pids: Vec<i32>) -> Self {
        Self {
            event_create_ts: timestamp_now(),
            pids,
        }
    }

    /// Stop request covering every monitored process.
    pub fn all() -> Self {
        Self::new(Vec::new())
    }
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    NewImage(NewImage),
    ImageReceived(ImageReceived),
    ImageScored(ImageScored),
    ImageStored(ImageStored),
    ImageDeleted(ImageDeleted),
    PluginStarted(PluginStarted),
    PluginTerminating(PluginTerminating),
    PluginTerminate(PluginTerminate),
    MonitorPowerStart(MonitorPowerStart),
    MonitorPowerStop(MonitorPowerStop),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NewImage(_) => EventKind::NewImage,
            Event::ImageReceived(_) => EventKind::ImageReceived,
            Event::ImageScored(_) => EventKind::ImageScored,
            Event::ImageStored(_) => EventKind::ImageStored,
            Event::ImageDeleted(_) => EventKind::ImageDeleted,
            Event::PluginStarted(_) => EventKind::PluginStarted,
            Event::PluginTerminating(_) => EventKind::PluginTerminating,
            Event::PluginTerminate(_) => EventKind::PluginTerminate,
            Event::MonitorPowerStart(_) => EventKind::MonitorPowerStart,
            Event::MonitorPowerStop(_) => EventKind::MonitorPowerStop,
        }
    }

    pub fn event_create_ts(&self) -> &str {
        match self {
            Event::NewImage(e) => &e.event_create_ts,
            Event::ImageReceived(e) => &e.event_create_ts,
            Event::ImageScored(e) => &e.event_create_ts,
            Event::ImageStored(e) => &e.event_create_ts,
            Event::ImageDeleted(e) => &e.event_create_ts,
            Event::PluginStarted(e) => &e.event_create_ts,
            Event::PluginTerminating(e) => &e.event_create_ts,
            Event::PluginTerminate(e) => &e.event_create_ts,
            Event::MonitorPowerStart(e) => &e.event_create_ts,
            Event::MonitorPowerStop(e) => &e.event_create_ts,
        }
    }

    /// Image the event refers to, for the image lifecycle kinds.
    pub fn image_uuid(&self) -> Option<Uuid> {
        match self {
            Event::NewImage(e) => Some(e.image_uuid),
            Event::ImageReceived(e) => Some(e.image_uuid),
            Event::ImageScored(e) => Some(e.image_uuid),
            Event::ImageStored(e) => Some(e.image_uuid),
            Event::ImageDeleted(e) => Some(e.image_uuid),
            _ => None,
        }
    }
}

macro_rules! impl_from_variant {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Event {
                fn from(event: $variant) -> Self {
                    Event::$variant(event)
                }
            }
        )*
    };
}

impl_from_variant!(
    NewImage,
    ImageReceived,
    ImageScored,
    ImageStored,
    ImageDeleted,
    PluginStarted,
    PluginTerminating,
    PluginTerminate,
    MonitorPowerStart,
    MonitorPowerStop,
);
