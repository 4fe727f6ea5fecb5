//! Core types shared by the bus hub and the plugins.
//!
//! A plugin process plays exactly one [`PluginRole`]. The role decides its
//! default name, the well-known port it talks to the bus on, and the
//! `<PLUGIN>_PORT` environment key that overrides that port.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default port of the bus hub when no role port applies.
pub const DEFAULT_BUS_PORT: u16 = 5559;

/// Plugin roles in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginRole {
    /// Reads images from a source and publishes `NewImage`
    ImageGenerating,
    /// Acknowledges new images with `ImageReceived`
    ImageReceiving,
    /// Scores images through the inference backend
    ImageScoring,
    /// Decides whether a scored image is stored or deleted
    ImageStoring,
    /// Ground-truth bookkeeping and global completion detection
    Oracle,
    /// Samples power draw for requested processes
    PowerMeasuring,
    /// Logs every event on the bus
    Observer,
}

impl PluginRole {
    /// All roles, in pipeline order.
    pub const ALL: [PluginRole; 7] = [
        PluginRole::ImageGenerating,
        PluginRole::ImageReceiving,
        PluginRole::ImageScoring,
        PluginRole::ImageStoring,
        PluginRole::Oracle,
        PluginRole::PowerMeasuring,
        PluginRole::Observer,
    ];

    /// Snake-case identifier of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginRole::ImageGenerating => "image_generating",
            PluginRole::ImageReceiving => "image_receiving",
            PluginRole::ImageScoring => "image_scoring",
            PluginRole::ImageStoring => "image_storing",
            PluginRole::Oracle => "oracle",
            PluginRole::PowerMeasuring => "power_measuring",
            PluginRole::Observer => "observer",
        }
    }

    /// Name a plugin of this role announces unless configured otherwise.
    pub fn default_plugin_name(&self) -> String {
        format!("{}_plugin", self.as_str())
    }

    /// Environment key holding the port override, e.g. `IMAGE_SCORING_PORT`.
    pub fn port_env_key(&self) -> String {
        format!("{}_PORT", self.as_str().to_ascii_uppercase())
    }

    /// Well-known port for the role.
    pub fn default_port(&self) -> u16 {
        match self {
            PluginRole::ImageGenerating | PluginRole::ImageScoring => 6000,
            PluginRole::PowerMeasuring => 6010,
            PluginRole::Oracle => 6011,
            PluginRole::ImageReceiving | PluginRole::ImageStoring | PluginRole::Observer => {
                DEFAULT_BUS_PORT
            }
        }
    }

    /// Resolves the port for this role.
    ///
    /// The `<PLUGIN>_PORT` environment variable wins, then the configured
    /// port, then the well-known default. An unparsable environment value is
    /// ignored with a warning.
    pub fn resolve_port(&self, configured: Option<u16>) -> u16 {
        let key = self.port_env_key();
        if let Ok(raw) = std::env::var(&key) {
            match raw.trim().parse::<u16>() {
                Ok(port) if port != 0 => return port,
                _ => tracing::warn!(key = %key, value = %raw, "Ignoring invalid port override"),
            }
        }
        configured.unwrap_or_else(|| self.default_port())
    }
}

impl fmt::Display for PluginRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PluginRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("unknown plugin role: {s}"))
    }
}

/// Name and instance id a plugin uses in started/terminating announcements
/// and that `PluginTerminate` commands are matched against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub name: String,
    pub uuid: Uuid,
}

impl PluginIdentity {
    /// Creates an identity with a fresh random instance id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
        }
    }

    /// Creates an identity with a fixed instance id.
    pub fn with_uuid(name: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            name: name.into(),
            uuid,
        }
    }
}

impl fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.uuid)
    }
}
