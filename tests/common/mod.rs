//! Common helpers for the in-process pipeline tests

#![allow(dead_code)]

use camtrap_bus::{Broker, BrokerConfig, BusHandle};
use camtrap_core::config::{DetectionSpec, PluginSettings};
use camtrap_core::{PipelineConfig, PluginRole};
use std::path::Path;
use std::time::Duration;

/// A hub on one ephemeral loopback port
pub async fn start_bus() -> BusHandle {
    Broker::start(BrokerConfig::ephemeral())
        .await
        .expect("Failed to start bus hub")
}

/// Configuration pointing every role at `port`, with short timeouts
pub fn pipeline_config(port: u16, work_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.bus.port = port;
    for role in PluginRole::ALL {
        config.plugins.insert(
            role,
            PluginSettings {
                port: Some(port),
                ..Default::default()
            },
        );
    }

    config.transport.reconnect.enabled = false;
    config.dispatcher.poll_timeout_ms = 50;
    config.dispatcher.max_idle_timeouts = Some(400);

    config.ingest.source_dir = work_dir.join("images");
    config.ingest.completion_timeout_secs = 15;
    config.recv.images_dir = work_dir.join("received");
    config.oracle.output_file = work_dir.join("oracle").join("image_mapping_final.json");
    config.oracle.quiescence_ms = 200;
    config.power.output_file = work_dir.join("power").join("power_summary_report.json");
    config.power.sample_interval_ms = 20;
    config
}

pub fn detect(category: &str, confidence: f32) -> DetectionSpec {
    DetectionSpec {
        category: category.to_string(),
        confidence,
    }
}

/// Writes `count` small fake jpg files and returns their names
pub fn write_images(dir: &Path, count: usize) -> Vec<String> {
    std::fs::create_dir_all(dir).expect("Failed to create image directory");
    (0..count)
        .map(|i| {
            let name = format!("IMG_{i:04}.jpg");
            let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
            bytes.extend(std::iter::repeat(i as u8).take(64 + i));
            std::fs::write(dir.join(&name), bytes).expect("Failed to write image");
            name
        })
        .collect()
}

/// Waits until the hub has `count` subscriber connections
pub async fn wait_for_subscribers(bus: &BusHandle, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bus.subscriber_count() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} of {count} subscribers connected",
            bus.subscriber_count()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
