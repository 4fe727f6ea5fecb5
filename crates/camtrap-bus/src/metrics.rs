//! Bus metrics.
//!
//! Counters go to the global `metrics` recorder and are mirrored in atomics
//! so tests and shutdown logs can read them without an exporter.

use camtrap_core::config::MetricsConfig;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::error::BusError;

#[derive(Debug)]
pub struct BusMetrics {
    frames_received: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
    subscribers_connected: AtomicI64,
}

impl BusMetrics {
    pub fn new() -> Self {
        describe_counter!(
            "bus_frames_received_total",
            "Total frames received from publishers"
        );
        describe_counter!(
            "bus_frames_forwarded_total",
            "Total frame copies queued for subscribers"
        );
        describe_counter!(
            "bus_frames_dropped_total",
            "Total frame copies dropped because a subscriber queue was full"
        );
        describe_gauge!("bus_subscribers_connected", "Currently connected subscribers");
        describe_histogram!(
            "bus_forward_latency_seconds",
            "Time to fan one frame out to all subscribers"
        );

        Self {
            frames_received: AtomicU64::new(0),
            frames_forwarded: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            subscribers_connected: AtomicI64::new(0),
        }
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        counter!("bus_frames_received_total").increment(1);
    }

    pub fn record_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        counter!("bus_frames_forwarded_total").increment(1);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        counter!("bus_frames_dropped_total").increment(1);
    }

    pub fn record_subscriber_connected(&self) {
        let now = self.subscribers_connected.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("bus_subscribers_connected").set(now as f64);
    }

    pub fn record_subscriber_disconnected(&self) {
        let now = self.subscribers_connected.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("bus_subscribers_connected").set(now as f64);
    }

    pub fn record_forward_latency(&self, latency: Duration) {
        histogram!("bus_forward_latency_seconds").record(latency.as_secs_f64());
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_forwarded(&self) -> u64 {
        self.frames_forwarded.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn subscribers_connected(&self) -> i64 {
        self.subscribers_connected.load(Ordering::Relaxed)
    }

    /// Share of frame copies dropped, 0.0 when nothing was offered
    pub fn drop_rate(&self) -> f64 {
        let offered = self.frames_forwarded() + self.frames_dropped();
        if offered == 0 {
            0.0
        } else {
            self.frames_dropped() as f64 / offered as f64
        }
    }
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder with its own scrape listener.
///
/// Must be called from within a tokio runtime. Does nothing when disabled.
pub fn install_prometheus(config: &MetricsConfig) -> Result<(), BusError> {
    if !config.enabled {
        info!("Metrics export disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.bind_address)
        .set_buckets_for_metric(
            Matcher::Suffix("latency_seconds".to_string()),
            &[0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5],
        )
        .map_err(|e| BusError::Metrics(e.to_string()))?
        .install()
        .map_err(|e| BusError::Metrics(e.to_string()))?;

    info!(
        bind_address = %config.bind_address,
        "Prometheus metrics exporter started"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_mirror() {
        let metrics = BusMetrics::new();
        metrics.record_frame_received();
        metrics.record_forwarded();
        metrics.record_forwarded();
        metrics.record_forwarded();
        metrics.record_dropped();

        assert_eq!(metrics.frames_received(), 1);
        assert_eq!(metrics.frames_forwarded(), 3);
        assert_eq!(metrics.frames_dropped(), 1);
        assert_eq!(metrics.drop_rate(), 0.25);
    }

    #[test]
    fn test_subscriber_gauge() {
        let metrics = BusMetrics::new();
        metrics.record_subscriber_connected();
        metrics.record_subscriber_connected();
        metrics.record_subscriber_disconnected();
        assert_eq!(metrics.subscribers_connected(), 1);
    }

    #[test]
    fn test_disabled_exporter_is_noop() {
        assert!(install_prometheus(&MetricsConfig::default()).is_ok());
    }
}
