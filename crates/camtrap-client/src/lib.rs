//! # camtrap-client
//!
//! Sockets that connect plugin processes to the bus hub.
//!
//! - **Framing**: 4-byte big-endian length prefix, 16 MiB limit
//! - **Handshake**: plugin name, role and subscription prefixes in JSON
//! - **Publish**: best-effort; an [`Ack`] only means the frame was queued locally
//! - **Receive**: bounded queue, drop-newest when full; timeouts are reported
//!   apart from transport failures
//! - **Reconnect**: exponential backoff, handshake replayed on every reconnect
//!
//! ## Example
//!
//! ```rust,no_run
//! use camtrap_client::{ClientConfig, Role, Socket};
//! use camtrap_core::PluginIdentity;
//! use camtrap_filter::SubscriptionSet;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let identity = PluginIdentity::new("observer_plugin");
//!     let config = ClientConfig::new("127.0.0.1:5559");
//!     let mut socket =
//!         Socket::connect(config, &identity, Role::Subscriber, SubscriptionSet::everything()).await?;
//!
//!     let frame = socket.receive(Duration::from_secs(1)).await?;
//!     println!("{} bytes", frame.len());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod socket;
pub mod state;

pub use client::{calculate_backoff, ClientConfig, ReconnectConfig};
pub use error::{RecvError, TransportError};
pub use framing::{FrameCodec, FrameError, MAX_FRAME_SIZE};
pub use handshake::{Hello, HelloAck, Role};
pub use socket::{Ack, Socket};
pub use state::{LinkState, LinkStatus};

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};
