//! First frames exchanged on a new bus connection.
//!
//! The plugin sends a JSON [`Hello`]; the bus registers the connection and
//! answers with a [`HelloAck`]. Subscriptions are live once the ack arrives.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub plugin_name: String,
    pub plugin_uuid: Uuid,
    pub role: Role,
    /// Raw byte prefixes; ignored for publishers
    #[serde(default)]
    pub subscriptions: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub connection_id: u64,
}

impl Hello {
    pub fn to_frame(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

impl HelloAck {
    pub fn to_frame(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}
