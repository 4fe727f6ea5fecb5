//! # Camtrap Plugins
//!
//! The plugin side of the pipeline: the [`Dispatcher`] receive loop, the
//! termination protocol and one [`EventHandler`] per role.
//!
//! ## Example
//!
//! ```no_run
//! use camtrap_core::{PipelineConfig, PluginRole};
//! use camtrap_plugins::run_role;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(PipelineConfig::from_file("camtrap.yaml")?);
//! let reason = run_role(PluginRole::ImageScoring, config).await?;
//! println!("scoring plugin stopped: {reason}");
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod error;
pub mod persist;
pub mod roles;
pub mod termination;

pub use dispatcher::{
    Dispatcher, DispatcherState, EventHandler, ExitReason, Flow, IdlePolicy, PluginContext,
};
pub use error::{PluginError, PluginResult};
pub use persist::write_json_atomic;
pub use roles::{connect, run_role, RoleConnection};
pub use termination::{is_addressed_to, CompletionDetector, ProgressTracker};
