//! Configuration management for the camera-traps pipeline.
//!
//! One YAML document configures the bus hub and every plugin role; each
//! process reads the sections it needs. Supported sources:
//! - YAML files and strings
//! - Environment variable overrides (`CAMTRAP__SECTION__FIELD`) through the `config` crate
//! - `<PLUGIN>_PORT` overrides for plugin ports (see [`crate::types::PluginRole::resolve_port`])

use crate::error::{ConfigError, Result};
use crate::types::{PluginIdentity, PluginRole, DEFAULT_BUS_PORT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;
use uuid::Uuid;

/// Main pipeline configuration.
///
/// # Examples
///
/// ```no_run
/// use camtrap_core::config::PipelineConfig;
///
/// let config = PipelineConfig::from_file("camtrap.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bus hub settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Socket timeouts and reconnect policy
    #[serde(default)]
    pub transport: TransportConfig,

    /// Receive loop settings shared by all plugins
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Per-role overrides (name, instance id, port, subscriptions)
    #[serde(default)]
    pub plugins: HashMap<PluginRole, PluginSettings>,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub recv: RecvConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub power: PowerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl PipelineConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, merging the file with
    /// `CAMTRAP__*` environment variables.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("CAMTRAP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<()> {
        if self.bus.queue_capacity == 0 {
            return Err(ConfigError::invalid_value("bus.queue_capacity", "must be positive").into());
        }
        if self.transport.recv_queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "transport.recv_queue_capacity",
                "must be positive",
            )
            .into());
        }
        if self.transport.send_queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "transport.send_queue_capacity",
                "must be positive",
            )
            .into());
        }
        if self.dispatcher.poll_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "dispatcher.poll_timeout_ms",
                "must be positive; the receive loop needs a timeout to apply its idle policy",
            )
            .into());
        }

        let mut seen_names = HashSet::new();
        for role in PluginRole::ALL {
            let name = self.plugin_name(role);
            if !seen_names.insert(name.clone()) {
                return Err(ConfigError::DuplicatePluginName { name }.into());
            }
        }

        self.store.validate()?;
        self.power.validate()?;
        self.logging.parse_level()?;

        Ok(())
    }

    /// Settings for one role, falling back to defaults.
    pub fn plugin(&self, role: PluginRole) -> PluginSettings {
        self.plugins.get(&role).cloned().unwrap_or_default()
    }

    /// Announced name for a role.
    pub fn plugin_name(&self, role: PluginRole) -> String {
        self.plugins
            .get(&role)
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| role.default_plugin_name())
    }

    /// Identity for a role: configured uuid or a fresh one.
    pub fn plugin_identity(&self, role: PluginRole) -> PluginIdentity {
        let name = self.plugin_name(role);
        match self.plugins.get(&role).and_then(|p| p.uuid) {
            Some(uuid) => PluginIdentity::with_uuid(name, uuid),
            None => PluginIdentity::new(name),
        }
    }

    /// Port a role connects to, honouring `<PLUGIN>_PORT`.
    pub fn plugin_port(&self, role: PluginRole) -> u16 {
        role.resolve_port(self.plugins.get(&role).and_then(|p| p.port))
    }

    /// Every port the bus hub must listen on: its own port plus each role port.
    pub fn bus_listen_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.bus.port];
        for role in PluginRole::ALL {
            let port = self.plugin_port(role);
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }
}

/// How the bus hub treats subscribers whose queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Drop the frame for that subscriber (best-effort, default)
    #[default]
    DropOnFull,
    /// Wait for queue space, up to the write timeout
    WaitOnFull,
}

/// Bus hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Host the hub binds and plugins connect to
    #[serde(default = "default_bus_host")]
    pub host: String,

    /// Main hub port
    #[serde(default = "default_bus_port")]
    pub port: u16,

    /// Outbound queue capacity per subscriber connection
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Slow-subscriber handling
    #[serde(default)]
    pub delivery: DeliveryMode,
}

fn default_bus_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bus_port() -> u16 {
    DEFAULT_BUS_PORT
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_bus_host(),
            port: default_bus_port(),
            queue_capacity: default_queue_capacity(),
            delivery: DeliveryMode::DropOnFull,
        }
    }
}

/// Socket configuration used by every plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Frames buffered between the socket reader and `receive`
    #[serde(default = "default_queue_capacity")]
    pub recv_queue_capacity: usize,

    /// Frames buffered between `publish` and the socket writer
    #[serde(default = "default_queue_capacity")]
    pub send_queue_capacity: usize,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            recv_queue_capacity: default_queue_capacity(),
            send_queue_capacity: default_queue_capacity(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Reconnection policy for plugin sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Consecutive failed attempts before the socket gives up (None = never)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> Option<u32> {
    Some(20)
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Receive loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How long one `receive` call waits
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Consecutive timeouts before the plugin stops (None = wait forever)
    #[serde(default)]
    pub max_idle_timeouts: Option<u32>,

    /// Consecutive transport errors a consumer tolerates
    #[serde(default = "default_max_transport_errors")]
    pub max_transport_errors: u32,

    /// Publish `PluginStarted` when entering the receive loop
    #[serde(default = "default_true")]
    pub announce_started: bool,
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_max_transport_errors() -> u32 {
    10
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            max_idle_timeouts: None,
            max_transport_errors: default_max_transport_errors(),
            announce_started: true,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Per-role overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSettings {
    pub name: Option<String>,
    pub uuid: Option<Uuid>,
    pub port: Option<u16>,
    /// Event kind names (e.g. `ImageScored`) replacing the role's default subscriptions
    pub subscriptions: Option<Vec<String>>,
}

/// Order in which the ingestion producer emits images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageOrdering {
    /// Oldest modification time first, ties broken by name
    #[default]
    ModifiedTime,
    /// Lexicographic file name
    FileName,
}

/// How the ingestion producer finds images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Emit the images present at startup, then wait for them to finish
    #[default]
    Batch,
    /// Emit each image written into the directory after startup, until
    /// terminated
    Watch,
}

/// Ingestion producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    #[serde(default)]
    pub mode: IngestMode,

    #[serde(default)]
    pub ordering: ImageOrdering,

    /// Accepted file extensions, compared case-insensitively
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// How long to wait for downstream completion before giving up
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,

    /// Ask the power monitor to sample this process
    #[serde(default)]
    pub monitor_power: bool,
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("images")
}

fn default_extensions() -> Vec<String> {
    vec!["png".to_string(), "jpg".to_string(), "jpeg".to_string()]
}

fn default_completion_timeout_secs() -> u64 {
    300
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            mode: IngestMode::default(),
            ordering: ImageOrdering::default(),
            extensions: default_extensions(),
            completion_timeout_secs: default_completion_timeout_secs(),
            monitor_power: false,
        }
    }
}

/// Receive acknowledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvConfig {
    /// Write each received image to `images_dir`
    #[serde(default)]
    pub write_images: bool,

    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    #[serde(default)]
    pub image_file_prefix: String,
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("images_output")
}

impl Default for RecvConfig {
    fn default() -> Self {
        Self {
            write_images: false,
            images_dir: default_images_dir(),
            image_file_prefix: String::new(),
        }
    }
}

/// A fixed detection used by the static scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSpec {
    pub category: String,
    pub confidence: f32,
}

/// Scoring consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Detector category id to label
    #[serde(default = "default_label_map")]
    pub label_map: BTreeMap<String, String>,

    /// Remote detector URL; when absent the static detections are used
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub static_detections: Vec<DetectionSpec>,

    /// Ask the power monitor to sample this process
    #[serde(default)]
    pub monitor_power: bool,
}

pub fn default_label_map() -> BTreeMap<String, String> {
    [("1", "animal"), ("2", "human"), ("3", "vehicle"), ("4", "empty")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            label_map: default_label_map(),
            endpoint: None,
            request_timeout_ms: default_request_timeout_ms(),
            static_detections: Vec::new(),
            monitor_power: false,
        }
    }
}

/// Store decision configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Action name (`save`, `reduce_save`, `delete`, `noop`) to minimum score
    #[serde(default)]
    pub thresholds: BTreeMap<String, f32>,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        for (action, threshold) in &self.thresholds {
            if !(0.0..=1.0).contains(threshold) {
                return Err(ConfigError::invalid_value(
                    format!("store.thresholds.{action}"),
                    format!("{threshold} is outside 0.0..=1.0"),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Oracle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_file")]
    pub output_file: PathBuf,

    /// Quiet period after an image's terminal event before it counts as done
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,

    /// Maximum wait for the record file lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Producers whose `PluginTerminating` announces the image total
    #[serde(default = "default_producers")]
    pub producers: Vec<String>,
}

fn default_oracle_file() -> PathBuf {
    PathBuf::from("oracle_output/image_mapping_final.json")
}

fn default_quiescence_ms() -> u64 {
    2_000
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_producers() -> Vec<String> {
    vec![PluginRole::ImageGenerating.default_plugin_name()]
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            output_file: default_oracle_file(),
            quiescence_ms: default_quiescence_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            producers: default_producers(),
        }
    }
}

impl OracleConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Fixed wattages reported by the static power sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticWatts {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub gpu: f64,
    #[serde(default)]
    pub dram: f64,
}

impl Default for StaticWatts {
    fn default() -> Self {
        Self {
            cpu: 5.0,
            gpu: 0.0,
            dram: 0.0,
        }
    }
}

/// Power monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    #[serde(default = "default_power_workers")]
    pub workers: usize,

    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,

    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Global cap on monitoring time (None = unbounded)
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: Option<u64>,

    #[serde(default = "default_power_output")]
    pub output_file: PathBuf,

    #[serde(default)]
    pub static_watts: StaticWatts,
}

fn default_power_workers() -> usize {
    2
}

fn default_task_queue_capacity() -> usize {
    64
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_max_runtime_secs() -> Option<u64> {
    Some(3_600)
}

fn default_power_output() -> PathBuf {
    PathBuf::from("power_output/power_summary_report.json")
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            workers: default_power_workers(),
            task_queue_capacity: default_task_queue_capacity(),
            sample_interval_ms: default_sample_interval_ms(),
            max_runtime_secs: default_max_runtime_secs(),
            output_file: default_power_output(),
            static_watts: StaticWatts::default(),
        }
    }
}

impl PowerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ConfigError::invalid_value("power.workers", "must be positive").into());
        }
        if self.task_queue_capacity == 0 {
            return Err(
                ConfigError::invalid_value("power.task_queue_capacity", "must be positive").into(),
            );
        }
        if self.sample_interval_ms == 0 {
            return Err(
                ConfigError::invalid_value("power.sample_interval_ms", "must be positive").into(),
            );
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_secs.map(Duration::from_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Invalid log level: {}", self.level),
            }
            .into()
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Expose a Prometheus scrape endpoint
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_address")]
    pub bind_address: SocketAddr,
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_metrics_address(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.bus.port, 5559);
        assert_eq!(config.scoring.label_map.get("2").map(String::as_str), Some("human"));
        assert_eq!(config.oracle.producers, vec!["image_generating_plugin".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
bus:
  port: 7000
  delivery: wait_on_full

dispatcher:
  poll_timeout_ms: 250
  max_idle_timeouts: 40

plugins:
  image_scoring:
    name: scorer-a
    port: 7100
    subscriptions: [NewImage, PluginTerminate]

store:
  thresholds:
    save: 0.7
    reduce_save: 0.4

logging:
  level: debug
  format: json
"#;

        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.bus.port, 7000);
        assert_eq!(config.bus.delivery, DeliveryMode::WaitOnFull);
        assert_eq!(config.dispatcher.max_idle_timeouts, Some(40));
        assert_eq!(config.plugin_name(PluginRole::ImageScoring), "scorer-a");
        assert_eq!(config.store.thresholds.get("save"), Some(&0.7));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = PipelineConfig::default();
        config.store.thresholds.insert("save".to_string(), 1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_plugin_names_rejected() {
        let mut config = PipelineConfig::default();
        config.plugins.insert(
            PluginRole::Observer,
            PluginSettings {
                name: Some("oracle_plugin".to_string()),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_timeout_rejected() {
        let mut config = PipelineConfig::default();
        config.dispatcher.poll_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bus_listen_ports_are_deduplicated() {
        let config = PipelineConfig::default();
        let ports = config.bus_listen_ports();
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), ports.len());
        assert_eq!(ports[0], config.bus.port);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "oracle:\n  quiescence_ms: 50").unwrap();
        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.oracle.quiescence(), Duration::from_millis(50));

        assert!(PipelineConfig::from_file("/nonexistent/camtrap.yaml").is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/camtrap.yaml");
        let config = PipelineConfig::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.store.thresholds.len(), 2);
        assert_eq!(config.power.static_watts.cpu, 15.0);
    }
}
