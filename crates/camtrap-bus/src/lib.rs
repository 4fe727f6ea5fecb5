//! # camtrap-bus
//!
//! The bus hub every plugin connects to. It listens on the bus port plus one
//! port per plugin role, registers each connection from its handshake, and
//! forwards publisher frames to the subscribers whose prefixes match.
//!
//! Delivery is best-effort: a subscriber that falls behind loses frames, and
//! the loss is counted in [`BusMetrics`].
//!
//! ```rust,no_run
//! use camtrap_bus::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), camtrap_bus::BusError> {
//!     let bus = Broker::start(BrokerConfig::default()).await?;
//!     tokio::signal::ctrl_c().await?;
//!     bus.shutdown();
//!     bus.wait().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod error;
pub mod metrics;

pub use broker::{Broker, BrokerConfig, BusHandle};
pub use error::BusError;
pub use metrics::{install_prometheus, BusMetrics};
