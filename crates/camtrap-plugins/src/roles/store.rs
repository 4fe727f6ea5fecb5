//! Store decision.
//!
//! The highest probability of a scored image picks the first threshold at or
//! below it, thresholds sorted from highest to lowest. A `0.0 -> Delete`
//! entry is added when no zero threshold is configured, so every score maps
//! to an action.

use async_trait::async_trait;
use camtrap_core::config::StoreConfig;
use camtrap_core::ConfigError;
use camtrap_events::{Event, ImageDeleted, ImageScored, ImageStored};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::dispatcher::{EventHandler, Flow, PluginContext};
use crate::error::PluginResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Delete,
    Noop,
    ReduceSave,
    Save,
}

impl StoreAction {
    /// Name used as the `ImageStored` destination
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreAction::Delete => "Delete",
            StoreAction::Noop => "Noop",
            StoreAction::ReduceSave => "ReduceSave",
            StoreAction::Save => "Save",
        }
    }
}

impl fmt::Display for StoreAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "").as_str() {
            "delete" => Ok(StoreAction::Delete),
            "noop" => Ok(StoreAction::Noop),
            "reducesave" => Ok(StoreAction::ReduceSave),
            "save" => Ok(StoreAction::Save),
            _ => Err(format!("unknown store action: {s}")),
        }
    }
}

/// Thresholds in descending order, ending with a zero entry
#[derive(Debug, Clone, PartialEq)]
pub struct StorePolicy {
    thresholds: Vec<(f32, StoreAction)>,
}

impl StorePolicy {
    pub fn from_config(config: &StoreConfig) -> Result<Self, ConfigError> {
        let mut thresholds = Vec::with_capacity(config.thresholds.len() + 1);
        for (name, threshold) in &config.thresholds {
            let action = name
                .parse::<StoreAction>()
                .map_err(|reason| ConfigError::invalid_value(format!("store.thresholds.{name}"), reason))?;
            if action == StoreAction::Noop {
                continue;
            }
            if !(0.0..=1.0).contains(threshold) {
                return Err(ConfigError::invalid_value(
                    format!("store.thresholds.{name}"),
                    format!("{threshold} is outside 0.0..=1.0"),
                ));
            }
            thresholds.push((*threshold, action));
        }
        Ok(Self::new(thresholds))
    }

    pub fn new(mut thresholds: Vec<(f32, StoreAction)>) -> Self {
        thresholds.retain(|(_, action)| *action != StoreAction::Noop);
        if !thresholds.iter().any(|(threshold, _)| *threshold == 0.0) {
            thresholds.push((0.0, StoreAction::Delete));
        }
        // Stable: equal thresholds keep their configured order.
        thresholds.sort_by(|a, b| b.0.total_cmp(&a.0));
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &[(f32, StoreAction)] {
        &self.thresholds
    }

    pub fn action_for(&self, score: f32) -> StoreAction {
        self.thresholds
            .iter()
            .find(|(threshold, _)| score >= *threshold)
            .map(|(_, action)| *action)
            .unwrap_or(StoreAction::Delete)
    }

    /// Event announcing the decision for a scored image
    pub fn decide(&self, scored: &ImageScored) -> Event {
        match self.action_for(scored.highest_probability()) {
            StoreAction::Delete => {
                ImageDeleted::new(scored.image_uuid, scored.image_format.clone()).into()
            }
            action => ImageStored::new(
                scored.image_uuid,
                scored.image_format.clone(),
                action.as_str(),
            )
            .into(),
        }
    }
}

pub struct StoreHandler {
    policy: StorePolicy,
    stored: u64,
    deleted: u64,
}

impl StoreHandler {
    pub fn new(policy: StorePolicy) -> Self {
        Self {
            policy,
            stored: 0,
            deleted: 0,
        }
    }
}

#[async_trait]
impl EventHandler for StoreHandler {
    async fn handle(&mut self, event: Event, ctx: &mut PluginContext) -> PluginResult<Flow> {
        let Event::ImageScored(scored) = event else {
            return Ok(Flow::Continue);
        };

        let decision = self.policy.decide(&scored);
        match &decision {
            Event::ImageDeleted(_) => self.deleted += 1,
            _ => self.stored += 1,
        }
        debug!(
            image_uuid = %scored.image_uuid,
            score = scored.highest_probability(),
            decision = %decision.kind(),
            "Store decision"
        );
        ctx.publish(decision).await?;
        Ok(Flow::Continue)
    }

    async fn drain(&mut self, _ctx: &mut PluginContext) -> PluginResult<()> {
        info!(stored = self.stored, deleted = self.deleted, "Store decisions finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camtrap_events::ids::image_uuid;
    use camtrap_events::ImageLabelScore;
    use std::collections::BTreeMap;

    fn config(entries: &[(&str, f32)]) -> StoreConfig {
        StoreConfig {
            thresholds: entries
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_thresholds_sorted_with_zero_delete() {
        let policy =
            StorePolicy::from_config(&config(&[("ReduceSave", 0.25), ("Save", 0.5), ("Noop", 0.35)]))
                .unwrap();
        assert_eq!(
            policy.thresholds(),
            &[
                (0.5, StoreAction::Save),
                (0.25, StoreAction::ReduceSave),
                (0.0, StoreAction::Delete)
            ]
        );
    }

    #[test]
    fn test_configured_zero_entry_is_kept() {
        let policy = StorePolicy::from_config(&config(&[("save", 0.0)])).unwrap();
        assert_eq!(policy.thresholds(), &[(0.0, StoreAction::Save)]);
        assert_eq!(policy.action_for(0.0), StoreAction::Save);
    }

    #[test]
    fn test_action_boundaries() {
        let policy = StorePolicy::new(vec![(0.25, StoreAction::ReduceSave), (0.5, StoreAction::Save)]);
        assert_eq!(policy.action_for(0.9), StoreAction::Save);
        assert_eq!(policy.action_for(0.5), StoreAction::Save);
        assert_eq!(policy.action_for(0.49), StoreAction::ReduceSave);
        assert_eq!(policy.action_for(0.25), StoreAction::ReduceSave);
        assert_eq!(policy.action_for(0.1), StoreAction::Delete);
        assert_eq!(policy.action_for(0.0), StoreAction::Delete);
    }

    #[test]
    fn test_empty_config_deletes_everything() {
        let policy = StorePolicy::from_config(&StoreConfig::default()).unwrap();
        assert_eq!(policy.action_for(1.0), StoreAction::Delete);
    }

    #[test]
    fn test_invalid_entries_rejected() {
        assert!(StorePolicy::from_config(&config(&[("archive", 0.5)])).is_err());
        assert!(StorePolicy::from_config(&config(&[("save", 1.5)])).is_err());
        // Noop thresholds are ignored before validation.
        assert!(StorePolicy::from_config(&config(&[("noop", 7.0)])).is_ok());
    }

    #[test]
    fn test_decision_events() {
        let policy = StorePolicy::new(vec![(0.5, StoreAction::Save)]);
        let id = image_uuid("fox.jpg");

        let animal = ImageScored::new(
            id,
            "jpg",
            vec![ImageLabelScore::new("human", 0.1), ImageLabelScore::new("animal", 0.8)],
        );
        match policy.decide(&animal) {
            Event::ImageStored(e) => {
                assert_eq!(e.image_uuid, id);
                assert_eq!(e.destination, "Save");
            }
            other => panic!("unexpected {other:?}"),
        }

        let empty = ImageScored::new(id, "jpg", Vec::new());
        assert!(matches!(policy.decide(&empty), Event::ImageDeleted(_)));
    }

    #[test]
    fn test_action_names_parse() {
        assert_eq!("reduce_save".parse(), Ok(StoreAction::ReduceSave));
        assert_eq!("ReduceSave".parse(), Ok(StoreAction::ReduceSave));
        assert_eq!("DELETE".parse(), Ok(StoreAction::Delete));
    }
}
