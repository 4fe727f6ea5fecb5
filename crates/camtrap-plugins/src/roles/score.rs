//! Scoring consumer.
//!
//! Each `NewImage` is scored by a [`Scorer`] and answered with exactly one
//! `ImageScored`. Detector categories go through the label map; an image
//! without detections, or one the scorer failed on, is reported as the
//! single `empty/0.0` entry.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use camtrap_core::config::{DetectionSpec, ScoringConfig};
use camtrap_events::{Event, ImageLabelScore, ImageScored, NewImage};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatcher::{EventHandler, Flow, PluginContext};
use crate::error::PluginResult;
use crate::roles::power::request_self_monitoring;

/// Label for categories missing from the map
pub const UNKNOWN_LABEL: &str = "unknown";

/// One detector hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(deserialize_with = "category_from_any")]
    pub category: String,
    pub conf: f32,
}

impl Detection {
    pub fn new(category: impl Into<String>, conf: f32) -> Self {
        Self {
            category: category.into(),
            conf,
        }
    }
}

impl From<&DetectionSpec> for Detection {
    fn from(configured: &DetectionSpec) -> Self {
        Self::new(configured.category.clone(), configured.confidence)
    }
}

/// Detectors report categories as either `"1"` or `1`
fn category_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Category {
        Text(String),
        Number(i64),
    }

    Ok(match Category::deserialize(deserializer)? {
        Category::Text(text) => text,
        Category::Number(number) => number.to_string(),
    })
}

#[derive(Error, Debug)]
pub enum ScorerError {
    #[error("Detector request failed: {0}")]
    Request(String),

    #[error("Detector returned HTTP {0}")]
    Status(u16),

    #[error("Invalid detector response: {0}")]
    InvalidResponse(String),
}

/// Inference backend
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, image: &[u8], image_format: &str) -> Result<Vec<Detection>, ScorerError>;
}

/// Returns the same detections for every image
#[derive(Debug, Clone, Default)]
pub struct StaticScorer {
    detections: Vec<Detection>,
}

impl StaticScorer {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }
}

#[async_trait]
impl Scorer for StaticScorer {
    async fn score(&self, _image: &[u8], _image_format: &str) -> Result<Vec<Detection>, ScorerError> {
        Ok(self.detections.clone())
    }
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    /// Base64 of the raw image bytes
    image: String,
    image_format: &'a str,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Option<Vec<Detection>>,
}

/// Posts images to a remote detector's predict endpoint
pub struct HttpScorer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpScorer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ScorerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScorerError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, image: &[u8], image_format: &str) -> Result<Vec<Detection>, ScorerError> {
        let request = DetectRequest {
            image: STANDARD.encode(image),
            image_format,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ScorerError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ScorerError::Status(response.status().as_u16()));
        }

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|e| ScorerError::InvalidResponse(e.to_string()))?;
        Ok(body.detections.unwrap_or_default())
    }
}

/// Remote scorer when an endpoint is configured, static detections otherwise
pub fn scorer_from_config(config: &ScoringConfig) -> Result<Arc<dyn Scorer>, ScorerError> {
    match &config.endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "Scoring through remote detector");
            Ok(Arc::new(HttpScorer::new(
                endpoint.clone(),
                Duration::from_millis(config.request_timeout_ms),
            )?))
        }
        None => {
            info!(
                detections = config.static_detections.len(),
                "Scoring with static detections"
            );
            Ok(Arc::new(StaticScorer::new(
                config.static_detections.iter().map(Detection::from).collect(),
            )))
        }
    }
}

/// Detector category to label
#[derive(Debug, Clone)]
pub struct LabelMap(BTreeMap<String, String>);

impl LabelMap {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn label_for(&self, category: &str) -> &str {
        self.0.get(category).map(String::as_str).unwrap_or(UNKNOWN_LABEL)
    }

    /// One score per detection, or the `empty` entry when there are none
    pub fn scores(&self, detections: &[Detection]) -> Vec<ImageLabelScore> {
        if detections.is_empty() {
            return vec![ImageLabelScore::empty()];
        }
        detections
            .iter()
            .map(|d| ImageLabelScore::new(self.label_for(&d.category), d.conf))
            .collect()
    }
}

impl Default for LabelMap {
    fn default() -> Self {
        Self::new(camtrap_core::config::default_label_map())
    }
}

/// Scores one image; scorer failures degrade to the empty result
pub async fn score_image(scorer: &dyn Scorer, labels: &LabelMap, image: &NewImage) -> ImageScored {
    let detections = match scorer.score(&image.image, &image.image_format).await {
        Ok(detections) => detections,
        Err(e) => {
            warn!(image_uuid = %image.image_uuid, error = %e, "Scoring failed, reporting empty");
            Vec::new()
        }
    };
    ImageScored::new(image.image_uuid, image.image_format.clone(), labels.scores(&detections))
}

pub struct ScoreHandler {
    scorer: Arc<dyn Scorer>,
    labels: LabelMap,
    monitor_power: bool,
    scored: u64,
}

impl ScoreHandler {
    pub fn new(scorer: Arc<dyn Scorer>, labels: LabelMap) -> Self {
        Self {
            scorer,
            labels,
            monitor_power: false,
            scored: 0,
        }
    }

    /// Requests power monitoring of this process on start
    pub fn with_power_monitoring(mut self, enabled: bool) -> Self {
        self.monitor_power = enabled;
        self
    }

    pub fn scored(&self) -> u64 {
        self.scored
    }
}

#[async_trait]
impl EventHandler for ScoreHandler {
    async fn on_start(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        if self.monitor_power {
            request_self_monitoring(ctx).await?;
        }
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, event: Event, ctx: &mut PluginContext) -> PluginResult<Flow> {
        let Event::NewImage(image) = event else {
            return Ok(Flow::Continue);
        };

        let scored = score_image(self.scorer.as_ref(), &self.labels, &image).await;
        debug!(
            image_uuid = %scored.image_uuid,
            scores = scored.scores.len(),
            top = scored.highest_probability(),
            "Image scored"
        );
        ctx.publish(scored).await?;
        self.scored += 1;
        Ok(Flow::Continue)
    }

    async fn drain(&mut self, _ctx: &mut PluginContext) -> PluginResult<()> {
        info!(scored = self.scored, "Scoring finished");
        Ok(())
    }
}
