//! # Camtrap Core
//!
//! Core types, error handling, and configuration for the camera-traps event
//! pipeline.
//!
//! - **Types**: [`PluginRole`] (name, well-known port, `<PLUGIN>_PORT` key) and
//!   [`PluginIdentity`].
//! - **Errors**: configuration, persistence and I/O errors built with `thiserror`.
//! - **Configuration**: one YAML document for the bus hub and every plugin
//!   role, with `CAMTRAP__*` environment overrides.
//!
//! ## Example
//!
//! ```
//! use camtrap_core::{PipelineConfig, PluginRole};
//!
//! let config = PipelineConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.plugin_name(PluginRole::Oracle), "oracle_plugin");
//! ```

pub mod config;
pub mod error;
pub mod types;

pub use config::PipelineConfig;
pub use error::{CamtrapError, ConfigError, PersistenceError, Result};
pub use types::{PluginIdentity, PluginRole};
