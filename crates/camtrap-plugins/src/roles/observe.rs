//! Observer: logs every event it is subscribed to.

use async_trait::async_trait;
use camtrap_events::{Event, EventKind};
use std::collections::BTreeMap;
use tracing::info;

use crate::dispatcher::{EventHandler, Flow, PluginContext};
use crate::error::PluginResult;

#[derive(Debug, Default)]
pub struct ObserveHandler {
    counts: BTreeMap<EventKind, u64>,
}

impl ObserveHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> &BTreeMap<EventKind, u64> {
        &self.counts
    }

    fn record(&mut self, event: &Event) {
        *self.counts.entry(event.kind()).or_insert(0) += 1;
        match event {
            Event::NewImage(e) => info!(
                kind = "NewImage",
                image_uuid = %e.image_uuid,
                image_format = %e.image_format,
                bytes = e.image.len(),
                ts = %e.event_create_ts,
                "Observed"
            ),
            Event::ImageScored(e) => info!(
                kind = "ImageScored",
                image_uuid = %e.image_uuid,
                top = e.highest_probability(),
                labels = e.scores.len(),
                ts = %e.event_create_ts,
                "Observed"
            ),
            Event::ImageStored(e) => info!(
                kind = "ImageStored",
                image_uuid = %e.image_uuid,
                destination = %e.destination,
                ts = %e.event_create_ts,
                "Observed"
            ),
            Event::PluginStarted(e) => info!(kind = "PluginStarted", plugin = %e.plugin_name, plugin_uuid = %e.plugin_uuid, "Observed"),
            Event::PluginTerminating(e) => info!(kind = "PluginTerminating", plugin = %e.plugin_name, plugin_uuid = %e.plugin_uuid, "Observed"),
            Event::PluginTerminate(e) => info!(
                kind = "PluginTerminate",
                target = %e.target_plugin_name,
                target_uuid = %e.target_plugin_uuid,
                "Observed"
            ),
            Event::MonitorPowerStart(e) => info!(
                kind = "MonitorPowerStart",
                pids = ?e.pids,
                monitor_types = ?e.monitor_types,
                seconds = e.monitor_seconds,
                "Observed"
            ),
            Event::MonitorPowerStop(e) => info!(kind = "MonitorPowerStop", pids = ?e.pids, "Observed"),
            other => info!(
                kind = %other.kind(),
                image_uuid = ?other.image_uuid(),
                ts = %other.event_create_ts(),
                "Observed"
            ),
        }
    }
}

#[async_trait]
impl EventHandler for ObserveHandler {
    async fn handle(&mut self, event: Event, _ctx: &mut PluginContext) -> PluginResult<Flow> {
        self.record(&event);
        Ok(Flow::Continue)
    }

    async fn drain(&mut self, _ctx: &mut PluginContext) -> PluginResult<()> {
        let total: u64 = self.counts.values().sum();
        let by_kind: Vec<String> = self
            .counts
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect();
        info!(total, by_kind = %by_kind.join(","), "Observer summary");
        Ok(())
    }
}
