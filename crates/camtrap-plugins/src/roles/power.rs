//! Power monitor.
//!
//! `MonitorPowerStart` requests become [`MonitorTask`]s on a bounded queue
//! served by a fixed set of worker tasks. Each worker samples its task's pids
//! every `sample_interval` until the task's duration runs out, its pids are
//! stopped, or the monitor-wide stop flag is raised. The flag is raised by
//! `MonitorPowerStop` with no pids or by the `max_runtime` timer; the plugin
//! then reduces the collected series to a [`PowerSummary`], writes it and
//! exits.

use async_trait::async_trait;
use camtrap_core::config::{PowerConfig, StaticWatts};
use camtrap_events::{parse_timestamp, Event, MonitorPowerStart, MonitorType};
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dispatcher::{EventHandler, Flow, PluginContext};
use crate::error::{PluginError, PluginResult};
use crate::persist::write_json_atomic;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Device {0} cannot be sampled")]
    Unsupported(MonitorType),

    #[error("Sampling failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowerError {
    #[error("Power monitor is stopped")]
    Stopped,

    #[error("Monitor task queue is closed")]
    QueueClosed,
}

/// Source of instantaneous power readings. Called from a blocking thread.
pub trait PowerSampler: Send + Sync {
    /// Watts drawn by `pids` on each concrete device behind `monitor_types`
    fn sample(
        &self,
        pids: &[i32],
        monitor_types: &[MonitorType],
    ) -> Result<HashMap<MonitorType, f64>, SamplerError>;
}

/// Reports fixed wattages regardless of the pids asked for
#[derive(Debug, Clone, Default)]
pub struct StaticSampler {
    watts: StaticWatts,
}

impl StaticSampler {
    pub fn new(watts: StaticWatts) -> Self {
        Self { watts }
    }
}

impl PowerSampler for StaticSampler {
    fn sample(
        &self,
        _pids: &[i32],
        monitor_types: &[MonitorType],
    ) -> Result<HashMap<MonitorType, f64>, SamplerError> {
        let mut readings = HashMap::new();
        for device in monitor_types.iter().flat_map(|t| t.devices()) {
            let watts = match device {
                MonitorType::Cpu => self.watts.cpu,
                MonitorType::Gpu => self.watts.gpu,
                MonitorType::Dram => self.watts.dram,
                MonitorType::All => return Err(SamplerError::Unsupported(MonitorType::All)),
            };
            readings.insert(*device, watts);
        }
        Ok(readings)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorTask {
    pub pids: Vec<i32>,
    pub monitor_types: Vec<MonitorType>,
    /// None starts immediately
    pub start_at: Option<DateTime<Utc>>,
    /// None runs until stopped
    pub duration: Option<Duration>,
}

impl From<&MonitorPowerStart> for MonitorTask {
    fn from(request: &MonitorPowerStart) -> Self {
        Self {
            pids: request.pids.clone(),
            monitor_types: request.monitor_types.clone(),
            start_at: parse_timestamp(&request.monitor_start_ts),
            duration: (request.monitor_seconds > 0)
                .then(|| Duration::from_secs(u64::from(request.monitor_seconds))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    pub watts: f64,
}

type SeriesMap = BTreeMap<(i32, MonitorType), Vec<PowerSample>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub samples: usize,
    pub energy_joules: f64,
    pub average_watts: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Per-pid, per-device energy report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerSummary {
    /// pid -> device -> summary
    pub processes: BTreeMap<String, BTreeMap<String, DeviceSummary>>,
    pub total_energy_joules: f64,
}

fn summarize_series(samples: &[PowerSample]) -> Option<DeviceSummary> {
    let first = samples.first()?;
    let last = samples.last()?;

    let energy_joules: f64 = samples
        .windows(2)
        .map(|pair| {
            let dt = (pair[1].timestamp - pair[0].timestamp)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            (pair[0].watts + pair[1].watts) / 2.0 * dt
        })
        .sum();

    let span = (last.timestamp - first.timestamp)
        .to_std()
        .unwrap_or_default()
        .as_secs_f64();
    let average_watts = if span > 0.0 {
        energy_joules / span
    } else {
        samples.iter().map(|s| s.watts).sum::<f64>() / samples.len() as f64
    };

    Some(DeviceSummary {
        samples: samples.len(),
        energy_joules,
        average_watts,
        start_time: first.timestamp,
        end_time: last.timestamp,
    })
}

/// Trapezoidal energy per series; empty series are left out
pub fn summarize(series: &SeriesMap) -> PowerSummary {
    let mut summary = PowerSummary::default();
    for ((pid, device), samples) in series {
        let Some(device_summary) = summarize_series(samples) else {
            continue;
        };
        summary.total_energy_joules += device_summary.energy_joules;
        summary
            .processes
            .entry(pid.to_string())
            .or_default()
            .insert(device.to_string(), device_summary);
    }
    summary
}

/// State shared between the monitor handle and its workers
struct Shared {
    sampler: Arc<dyn PowerSampler>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    stopped_pids: Mutex<HashSet<i32>>,
    series: Mutex<SeriesMap>,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn pid_stopped(&self, pid: i32) -> bool {
        self.stopped_pids.lock().contains(&pid)
    }

    /// False when the stop flag was raised while waiting
    async fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.is_stopped() {
                return false;
            }
            let slice = self.interval.min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(slice).await;
        }
        !self.is_stopped()
    }

    async fn sample_pid(&self, pid: i32, monitor_types: &[MonitorType]) {
        let sampler = Arc::clone(&self.sampler);
        let types = monitor_types.to_vec();
        let readings = tokio::task::spawn_blocking(move || sampler.sample(&[pid], &types)).await;

        match readings {
            Ok(Ok(readings)) => {
                let timestamp = Utc::now();
                let mut series = self.series.lock();
                for (device, watts) in readings {
                    series
                        .entry((pid, device))
                        .or_default()
                        .push(PowerSample { timestamp, watts });
                }
            }
            Ok(Err(e)) => warn!(pid, error = %e, "Power sample failed"),
            Err(e) => warn!(pid, error = %e, "Power sampler task failed"),
        }
    }

    async fn run_task(&self, task: MonitorTask) {
        if let Some(start_at) = task.start_at {
            let wait = (start_at - Utc::now()).to_std().unwrap_or_default();
            if !self.sleep_unless_stopped(wait).await {
                return;
            }
        }

        let deadline = task.duration.map(|d| Instant::now() + d);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.is_stopped() || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let pids: Vec<i32> = task
                .pids
                .iter()
                .copied()
                .filter(|pid| !self.pid_stopped(*pid))
                .collect();
            if pids.is_empty() {
                break;
            }
            for pid in pids {
                self.sample_pid(pid, &task.monitor_types).await;
            }
        }
    }
}

/// Worker pool sampling power for submitted tasks
pub struct PowerMonitor {
    tx: Option<Sender<MonitorTask>>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl PowerMonitor {
    /// Spawns the workers and the `max_runtime` timer. Must be called inside
    /// a tokio runtime.
    pub fn start(settings: &PowerConfig, sampler: Arc<dyn PowerSampler>) -> Self {
        let (tx, rx) = flume::bounded(settings.task_queue_capacity.max(1));
        let shared = Arc::new(Shared {
            sampler,
            interval: settings.sample_interval(),
            stop: Arc::new(AtomicBool::new(false)),
            stopped_pids: Mutex::new(HashSet::new()),
            series: Mutex::new(BTreeMap::new()),
        });

        let workers = (0..settings.workers.max(1))
            .map(|worker_id| Self::spawn_worker(worker_id, rx.clone(), Arc::clone(&shared)))
            .collect();

        let timer = settings.max_runtime().map(|limit| {
            let stop = Arc::clone(&shared.stop);
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if !stop.swap(true, Ordering::AcqRel) {
                    info!(limit_secs = limit.as_secs(), "Power monitor reached its maximum runtime");
                }
            })
        });

        info!(workers = settings.workers, "Power monitor started");
        Self {
            tx: Some(tx),
            shared,
            workers,
            timer,
        }
    }

    fn spawn_worker(worker_id: usize, rx: Receiver<MonitorTask>, shared: Arc<Shared>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(worker_id, "Power worker started");
            while let Ok(task) = rx.recv_async().await {
                if shared.is_stopped() {
                    break;
                }
                debug!(worker_id, pids = ?task.pids, "Monitoring");
                shared.run_task(task).await;
            }
            debug!(worker_id, "Power worker stopped");
        })
    }

    /// Queues a task, waiting while the queue is full
    pub async fn submit(&self, task: MonitorTask) -> Result<(), PowerError> {
        if self.is_stopped() {
            return Err(PowerError::Stopped);
        }
        let tx = self.tx.as_ref().ok_or(PowerError::QueueClosed)?;
        tx.send_async(task).await.map_err(|_| PowerError::QueueClosed)
    }

    /// Stops sampling `pids`; an empty list stops everything
    pub fn stop_pids(&self, pids: &[i32]) {
        if pids.is_empty() {
            self.stop();
            return;
        }
        self.shared.stopped_pids.lock().extend(pids.iter().copied());
        info!(pids = ?pids, "Stopped monitoring pids");
    }

    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            info!("Power monitor stopping");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Samples collected so far across all series
    pub fn sample_count(&self) -> usize {
        self.shared.series.lock().values().map(Vec::len).sum()
    }

    /// Stops every worker, waits for them and summarizes the series
    pub async fn finish(mut self) -> PowerSummary {
        self.stop();
        self.tx.take();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "Power worker panicked");
            }
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let series = std::mem::take(&mut *self.shared.series.lock());
        summarize(&series)
    }
}

pub struct PowerHandler {
    settings: PowerConfig,
    sampler: Arc<dyn PowerSampler>,
    monitor: Option<PowerMonitor>,
}

impl PowerHandler {
    pub fn new(settings: PowerConfig, sampler: Arc<dyn PowerSampler>) -> Self {
        Self {
            settings,
            sampler,
            monitor: None,
        }
    }
}

impl PowerHandler {
    /// Finishes the monitor and writes its summary. Runs once; later calls
    /// find no monitor and do nothing.
    async fn write_summary(&mut self) -> PluginResult<()> {
        let Some(monitor) = self.monitor.take() else {
            return Ok(());
        };
        let summary = monitor.finish().await;
        let path = self.settings.output_file.clone();
        info!(
            processes = summary.processes.len(),
            total_energy_joules = summary.total_energy_joules,
            output = %path.display(),
            "Writing power summary"
        );
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &summary))
            .await
            .map_err(|e| PluginError::Task(e.to_string()))??;
        Ok(())
    }

    /// A global stop (request or `max_runtime`) ends the plugin
    async fn complete_if_stopped(&mut self) -> PluginResult<Flow> {
        match self.monitor.as_ref() {
            Some(monitor) if monitor.is_stopped() => {
                self.write_summary().await?;
                Ok(Flow::Complete)
            }
            _ => Ok(Flow::Continue),
        }
    }
}

#[async_trait]
impl EventHandler for PowerHandler {
    async fn on_start(&mut self, _ctx: &mut PluginContext) -> PluginResult<Flow> {
        self.monitor = Some(PowerMonitor::start(&self.settings, Arc::clone(&self.sampler)));
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, event: Event, _ctx: &mut PluginContext) -> PluginResult<Flow> {
        let Some(monitor) = self.monitor.as_ref() else {
            return Ok(Flow::Continue);
        };
        match event {
            Event::MonitorPowerStart(request) => {
                let task = MonitorTask::from(&request);
                if let Err(e) = monitor.submit(task).await {
                    warn!(pids = ?request.pids, error = %e, "Monitor request rejected");
                }
            }
            Event::MonitorPowerStop(request) => monitor.stop_pids(&request.pids),
            _ => {}
        }
        self.complete_if_stopped().await
    }

    async fn on_idle(&mut self, _ctx: &mut PluginContext) -> PluginResult<Flow> {
        self.complete_if_stopped().await
    }

    async fn drain(&mut self, _ctx: &mut PluginContext) -> PluginResult<()> {
        self.write_summary().await
    }
}

/// Asks the power monitor to sample the calling process until stopped
pub async fn request_self_monitoring(ctx: &mut PluginContext) -> PluginResult<()> {
    // Pids fit in i32 on every platform with a power sampler.
    let pid = std::process::id() as i32;
    let request = MonitorPowerStart::new(vec![pid], vec![MonitorType::Cpu], "", 0)?;
    info!(pid, plugin = %ctx.identity().name, "Requesting power monitoring");
    ctx.publish(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn settings(interval_ms: u64, max_runtime_secs: Option<u64>) -> PowerConfig {
        PowerConfig {
            workers: 2,
            task_queue_capacity: 4,
            sample_interval_ms: interval_ms,
            max_runtime_secs,
            ..PowerConfig::default()
        }
    }

    fn sampler() -> Arc<dyn PowerSampler> {
        Arc::new(StaticSampler::new(StaticWatts {
            cpu: 5.0,
            gpu: 20.0,
            dram: 1.0,
        }))
    }

    fn task(pids: Vec<i32>, duration: Option<Duration>) -> MonitorTask {
        MonitorTask {
            pids,
            monitor_types: vec![MonitorType::All],
            start_at: None,
            duration,
        }
    }

    fn sample(offset_ms: i64, watts: f64) -> PowerSample {
        let base = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        PowerSample {
            timestamp: base + TimeDelta::milliseconds(offset_ms),
            watts,
        }
    }

    #[test]
    fn test_trapezoid_energy() {
        let mut series = SeriesMap::new();
        series.insert(
            (42, MonitorType::Cpu),
            vec![sample(0, 5.0), sample(1_000, 5.0), sample(2_000, 10.0)],
        );
        series.insert((42, MonitorType::Gpu), vec![sample(0, 30.0)]);
        series.insert((7, MonitorType::Dram), Vec::new());

        let summary = summarize(&series);
        let cpu = &summary.processes["42"]["cpu"];
        assert!((cpu.energy_joules - 12.5).abs() < 1e-9);
        assert!((cpu.average_watts - 6.25).abs() < 1e-9);
        assert_eq!(cpu.samples, 3);
        assert_eq!(cpu.end_time - cpu.start_time, TimeDelta::seconds(2));

        let gpu = &summary.processes["42"]["gpu"];
        assert_eq!(gpu.energy_joules, 0.0);
        assert_eq!(gpu.average_watts, 30.0);

        assert!(!summary.processes.contains_key("7"));
        assert!((summary.total_energy_joules - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_static_sampler_expands_all() {
        let readings = StaticSampler::new(StaticWatts {
            cpu: 1.0,
            gpu: 2.0,
            dram: 3.0,
        })
        .sample(&[1], &[MonitorType::All])
        .unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[&MonitorType::Gpu], 2.0);
    }

    #[test]
    fn test_task_from_request() {
        let request =
            MonitorPowerStart::new(vec![10, 11], vec![MonitorType::Cpu], "", 30).unwrap();
        let task = MonitorTask::from(&request);
        assert_eq!(task.pids, vec![10, 11]);
        assert_eq!(task.start_at, None);
        assert_eq!(task.duration, Some(Duration::from_secs(30)));

        let forever =
            MonitorPowerStart::new(vec![1], vec![MonitorType::Gpu], "2030-01-01T00:00:00Z", 0)
                .unwrap();
        let task = MonitorTask::from(&forever);
        assert!(task.start_at.is_some());
        assert_eq!(task.duration, None);
    }

    #[tokio::test]
    async fn test_stopped_pid_stops_growing() {
        let monitor = PowerMonitor::start(&settings(10, None), sampler());
        monitor.submit(task(vec![1, 2], None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        monitor.stop_pids(&[2]);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let summary = monitor.finish().await;
        let pid1 = &summary.processes["1"]["cpu"];
        let pid2 = &summary.processes["2"]["cpu"];
        assert!(pid1.samples > pid2.samples);
        assert_eq!(summary.processes["1"].len(), 3);
        assert!((pid1.average_watts - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_task_duration_bounds_sampling() {
        let monitor = PowerMonitor::start(&settings(10, None), sampler());
        monitor
            .submit(task(vec![3], Some(Duration::from_millis(50))))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let settled = monitor.sample_count();
        assert!(settled > 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.sample_count(), settled);
        assert!(!monitor.is_stopped());
    }

    #[tokio::test]
    async fn test_max_runtime_raises_stop_flag() {
        let monitor = PowerMonitor::start(&settings(10, Some(0)), sampler());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(monitor.is_stopped());
        assert_eq!(
            monitor.submit(task(vec![1], None)).await,
            Err(PowerError::Stopped)
        );
        let summary = monitor.finish().await;
        assert!(summary.processes.is_empty());
    }

    #[tokio::test]
    async fn test_empty_stop_stops_everything() {
        let monitor = PowerMonitor::start(&settings(10, None), sampler());
        monitor.submit(task(vec![5], None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        monitor.stop_pids(&[]);
        assert!(monitor.is_stopped());

        // Workers exit promptly once stopped.
        let summary = tokio::time::timeout(Duration::from_secs(1), monitor.finish())
            .await
            .unwrap();
        assert!(summary.processes.contains_key("5"));
    }
}
