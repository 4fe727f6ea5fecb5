//! Oracle: per-image bookkeeping and global completion.
//!
//! Every lifecycle event is merged into an [`OracleRecord`] keyed by image
//! uuid and persisted to a JSON file shared by all oracle instances:
//!
//! ```text
//!   flock(<output>.lock)   exclusive, released when the handle closes
//!        |
//!   read <output> -> merge update -> temp file -> rename over <output>
//! ```
//!
//! The lock is held by the kernel, so a writer that dies mid-update never
//! leaves the file locked. The `.lock` file itself stays on disk.
//!
//! The [`CompletionDetector`] decides when the run is over; the oracle then
//! broadcasts `PluginTerminate("*")`.

use async_trait::async_trait;
use camtrap_core::config::OracleConfig;
use camtrap_core::PersistenceError;
use camtrap_events::{Event, ImageLabelScore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{EventHandler, Flow, PluginContext};
use crate::error::{PluginError, PluginResult};
use crate::persist::write_json_atomic;
use crate::termination::CompletionDetector;

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// What the oracle knows about one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleRecord {
    #[serde(default)]
    pub image_format: String,
    #[serde(default)]
    pub receiving_ts: Option<String>,
    #[serde(default)]
    pub scoring_ts: Option<String>,
    #[serde(default)]
    pub scores: Vec<ImageLabelScore>,
    #[serde(default)]
    pub store_delete_ts: Option<String>,
    /// Store destination, or "Delete"
    #[serde(default)]
    pub decision: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    New,
    Received { ts: String },
    Scored { ts: String, scores: Vec<ImageLabelScore> },
    Stored { ts: String, destination: String },
    Deleted { ts: String },
}

/// One event's contribution to a record. Image bytes are never carried.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub image_format: String,
    pub change: RecordChange,
}

impl RecordUpdate {
    pub fn from_event(event: &Event) -> Option<(Uuid, RecordUpdate)> {
        let (uuid, image_format, change) = match event {
            Event::NewImage(e) => (e.image_uuid, &e.image_format, RecordChange::New),
            Event::ImageReceived(e) => (
                e.image_uuid,
                &e.image_format,
                RecordChange::Received {
                    ts: e.event_create_ts.clone(),
                },
            ),
            Event::ImageScored(e) => (
                e.image_uuid,
                &e.image_format,
                RecordChange::Scored {
                    ts: e.event_create_ts.clone(),
                    scores: e.scores.clone(),
                },
            ),
            Event::ImageStored(e) => (
                e.image_uuid,
                &e.image_format,
                RecordChange::Stored {
                    ts: e.event_create_ts.clone(),
                    destination: e.destination.clone(),
                },
            ),
            Event::ImageDeleted(e) => (
                e.image_uuid,
                &e.image_format,
                RecordChange::Deleted {
                    ts: e.event_create_ts.clone(),
                },
            ),
            _ => return None,
        };
        Some((
            uuid,
            RecordUpdate {
                image_format: image_format.clone(),
                change,
            },
        ))
    }
}

impl OracleRecord {
    /// Merges `update` into the record. Fields are set, never cleared.
    pub fn apply(&mut self, update: &RecordUpdate) {
        if self.image_format.is_empty() {
            self.image_format = update.image_format.clone();
        }
        match &update.change {
            RecordChange::New => {}
            RecordChange::Received { ts } => self.receiving_ts = Some(ts.clone()),
            RecordChange::Scored { ts, scores } => {
                self.scoring_ts = Some(ts.clone());
                if !scores.is_empty() {
                    self.scores = scores.clone();
                }
            }
            RecordChange::Stored { ts, destination } => {
                self.store_delete_ts = Some(ts.clone());
                self.decision = Some(destination.clone());
            }
            RecordChange::Deleted { ts } => {
                self.store_delete_ts = Some(ts.clone());
                self.decision = Some("Delete".to_string());
            }
        }
    }
}

/// Exclusive lock on the `.lock` file; released when dropped
#[cfg(unix)]
type LockGuard = nix::fcntl::Flock<File>;

/// Without flock only the open handle is held: writers in other processes
/// are not excluded.
#[cfg(not(unix))]
type LockGuard = File;

/// The record file, shared across processes through a lock file
#[derive(Debug, Clone)]
pub struct OracleStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl OracleStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock_file(&self) -> Result<File, PersistenceError> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                PersistenceError::write_failed(self.lock_path.display().to_string(), e.to_string())
            })
    }

    #[cfg(unix)]
    fn try_lock(&self) -> Result<LockGuard, PersistenceError> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let file = self.open_lock_file()?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                PersistenceError::LockContended {
                    path: self.lock_path.display().to_string(),
                }
            } else {
                PersistenceError::write_failed(self.lock_path.display().to_string(), errno.to_string())
            }
        })
    }

    #[cfg(not(unix))]
    fn try_lock(&self) -> Result<LockGuard, PersistenceError> {
        self.open_lock_file()
    }

    /// Blocks with exponential backoff until the lock is taken or the
    /// timeout passes. Only called from the blocking pool.
    fn lock(&self) -> Result<LockGuard, PersistenceError> {
        if let Some(dir) = self.lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                PersistenceError::write_failed(self.lock_path.display().to_string(), e.to_string())
            })?;
        }

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(e) if e.is_transient() => {
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(PersistenceError::LockTimeout {
                            path: self.lock_path.display().to_string(),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(backoff.min(self.lock_timeout - waited));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current records. A missing or empty file holds none.
    pub fn load(&self) -> Result<BTreeMap<String, OracleRecord>, PersistenceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(PersistenceError::corrupt(
                    self.path.display().to_string(),
                    e.to_string(),
                ))
            }
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents)
            .map_err(|e| PersistenceError::corrupt(self.path.display().to_string(), e.to_string()))
    }

    /// Read-modify-write of one record under the lock. Blocking.
    pub fn update(&self, image_uuid: Uuid, update: &RecordUpdate) -> Result<(), PersistenceError> {
        let _guard = self.lock()?;
        let mut records = self.load()?;
        records
            .entry(image_uuid.to_string())
            .or_default()
            .apply(update);
        write_json_atomic(&self.path, &records)
    }
}

pub struct OracleHandler {
    store: Arc<OracleStore>,
    detector: CompletionDetector,
    persisted: u64,
    skipped: u64,
}

impl OracleHandler {
    pub fn new(config: &OracleConfig) -> Self {
        Self {
            store: Arc::new(OracleStore::new(
                config.output_file.clone(),
                config.lock_timeout(),
            )),
            detector: CompletionDetector::new(config.producers.iter().cloned(), config.quiescence()),
            persisted: 0,
            skipped: 0,
        }
    }

    pub fn store(&self) -> &OracleStore {
        &self.store
    }

    pub fn detector(&self) -> &CompletionDetector {
        &self.detector
    }

    async fn persist(&mut self, image_uuid: Uuid, update: RecordUpdate) -> PluginResult<()> {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.update(image_uuid, &update))
            .await
            .map_err(|e| PluginError::Task(e.to_string()))?;
        match result {
            Ok(()) => self.persisted += 1,
            Err(e) => {
                self.skipped += 1;
                warn!(image_uuid = %image_uuid, error = %e, "Skipped oracle record update");
            }
        }
        Ok(())
    }

    async fn check_complete(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        if self.detector.poll(Instant::now()) {
            ctx.broadcast_terminate().await?;
            return Ok(Flow::Complete);
        }
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl EventHandler for OracleHandler {
    async fn handle(&mut self, event: Event, ctx: &mut PluginContext) -> PluginResult<Flow> {
        self.detector.observe(&event, Instant::now());
        if let Some((image_uuid, update)) = RecordUpdate::from_event(&event) {
            debug!(image_uuid = %image_uuid, kind = %event.kind(), "Oracle update");
            self.persist(image_uuid, update).await?;
        }
        self.check_complete(ctx).await
    }

    async fn on_idle(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        self.check_complete(ctx).await
    }

    async fn drain(&mut self, _ctx: &mut PluginContext) -> PluginResult<()> {
        info!(
            images = self.detector.image_count(),
            terminal = self.detector.terminal_count(),
            persisted = self.persisted,
            skipped = self.skipped,
            output = %self.store.path().display(),
            "Oracle finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camtrap_events::ids::image_uuid;
    use camtrap_events::{ImageDeleted, ImageReceived, ImageScored, ImageStored, NewImage};
    use std::thread;

    fn update(event: impl Into<Event>) -> (Uuid, RecordUpdate) {
        RecordUpdate::from_event(&event.into()).unwrap()
    }

    #[test]
    fn test_record_merges_lifecycle() {
        let id = image_uuid("a.jpg");
        let mut record = OracleRecord::default();

        record.apply(&update(NewImage::new(id, "jpg", vec![1, 2, 3])).1);
        assert_eq!(record.image_format, "jpg");
        assert!(record.receiving_ts.is_none());

        let received = ImageReceived::new(id, "jpg");
        record.apply(&update(received.clone()).1);
        assert_eq!(record.receiving_ts.as_deref(), Some(received.event_create_ts.as_str()));

        record.apply(&update(ImageScored::new(id, "jpg", vec![ImageLabelScore::new("animal", 0.9)])).1);
        assert_eq!(record.scores, vec![ImageLabelScore::new("animal", 0.9)]);
        assert!(record.scoring_ts.is_some());

        record.apply(&update(ImageStored::new(id, "jpg", "Save")).1);
        assert_eq!(record.decision.as_deref(), Some("Save"));
        assert!(record.store_delete_ts.is_some());
        // Earlier fields survive later updates.
        assert!(record.receiving_ts.is_some());
    }

    #[test]
    fn test_delete_decision() {
        let id = image_uuid("b.jpg");
        let mut record = OracleRecord::default();
        record.apply(&update(ImageDeleted::new(id, "png")).1);
        assert_eq!(record.decision.as_deref(), Some("Delete"));
        assert_eq!(record.image_format, "png");
    }

    #[test]
    fn test_non_image_events_ignored() {
        let event: Event = camtrap_events::PluginTerminate::wildcard().into();
        assert!(RecordUpdate::from_event(&event).is_none());
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = OracleStore::new(dir.path().join("out/mapping.json"), Duration::from_secs(1));
        assert!(store.load().unwrap().is_empty());

        let (id, up) = update(ImageReceived::new(image_uuid("c.jpg"), "jpg"));
        store.update(id, &up).unwrap();
        let (_, up) = update(ImageStored::new(id, "jpg", "ReduceSave"));
        store.update(id, &up).unwrap();

        let records = store.load().unwrap();
        let record = &records[&id.to_string()];
        assert_eq!(record.decision.as_deref(), Some("ReduceSave"));
        assert!(record.receiving_ts.is_some());
        // The lock file stays behind but nobody holds it.
        assert!(dir.path().join("out/mapping.json.lock").exists());
        assert!(store.try_lock().is_ok());
    }

    #[test]
    fn test_leftover_lock_file_does_not_block_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        // Left by a writer that was killed while holding the lock.
        fs::write(dir.path().join("mapping.json.lock"), "4242").unwrap();
        let store = OracleStore::new(&path, Duration::from_millis(50));

        let (id, up) = update(ImageDeleted::new(image_uuid("stale.jpg"), "jpg"));
        store.update(id, &up).unwrap();

        let records = store.load().unwrap();
        assert_eq!(records[&id.to_string()].decision.as_deref(), Some("Delete"));
    }

    #[test]
    fn test_corrupt_file_is_reported_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        fs::write(&path, "{ not json").unwrap();
        let store = OracleStore::new(&path, Duration::from_secs(1));

        let (id, up) = update(ImageReceived::new(image_uuid("d.jpg"), "jpg"));
        let err = store.update(id, &up).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
        // The lock is released even on failure.
        assert!(store.try_lock().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = OracleStore::new(dir.path().join("mapping.json"), Duration::from_millis(50));
        let _held = store.try_lock().unwrap();

        let (id, up) = update(ImageReceived::new(image_uuid("e.jpg"), "jpg"));
        let err = store.update(id, &up).unwrap_err();
        assert!(matches!(err, PersistenceError::LockTimeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        let writers = 4;
        let per_writer = 25;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = OracleStore::new(path, Duration::from_secs(30));
                    for i in 0..per_writer {
                        let id = image_uuid(&format!("writer{w}/img{i}.jpg"));
                        let (_, up) = update(ImageReceived::new(id, "jpg"));
                        store.update(id, &up).unwrap();
                        let (_, up) = update(ImageDeleted::new(id, "jpg"));
                        store.update(id, &up).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = OracleStore::new(&path, Duration::from_secs(1)).load().unwrap();
        assert_eq!(records.len(), writers * per_writer);
        assert!(records
            .values()
            .all(|r| r.receiving_ts.is_some() && r.decision.as_deref() == Some("Delete")));
    }
}
