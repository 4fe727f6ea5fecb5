use camtrap_client::TransportError;
use camtrap_core::{ConfigError, PersistenceError};
use camtrap_events::EventError;
use camtrap_filter::FilterError;
use thiserror::Error;

use crate::roles::score::ScorerError;

/// Errors raised by plugin handlers and the dispatcher
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid subscriptions: {0}")]
    Subscriptions(#[from] FilterError),

    #[error("Invalid event: {0}")]
    Event(#[from] EventError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scorer setup failed: {0}")]
    Scorer(#[from] ScorerError),

    #[error("Directory watch failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl PluginError {
    /// True when the bus connection itself failed
    pub fn is_transport(&self) -> bool {
        matches!(self, PluginError::Transport(_))
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
