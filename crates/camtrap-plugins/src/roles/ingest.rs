//! Image ingestion producer.
//!
//! In batch mode it emits one `NewImage` per file in the source directory,
//! announces `PluginTerminating`, then waits until every emitted image is
//! stored or deleted before broadcasting `PluginTerminate("*")`. Images are
//! emitted one per dispatcher step so completion events arriving meanwhile
//! are consumed as they come.
//!
//! In watch mode it emits each image written into the directory after
//! startup and runs until terminated.

use async_trait::async_trait;
use camtrap_core::config::{ImageOrdering, IngestConfig, IngestMode};
use camtrap_events::ids::image_uuid_for_path;
use camtrap_events::{Event, NewImage};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::dispatcher::{EventHandler, Flow, PluginContext};
use crate::error::{PluginError, PluginResult};
use crate::roles::power::request_self_monitoring;
use crate::termination::ProgressTracker;

/// An image found in the source directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub path: PathBuf,
    /// Lower-cased file extension
    pub format: String,
    pub modified: SystemTime,
}

/// Order in which images are emitted
pub trait OrderingStrategy: Send + Sync {
    fn order(&self, images: &mut [SourceImage]);
}

/// Oldest first; ties broken by path
pub struct ByModifiedTime;

impl OrderingStrategy for ByModifiedTime {
    fn order(&self, images: &mut [SourceImage]) {
        images.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    }
}

pub struct ByFileName;

impl OrderingStrategy for ByFileName {
    fn order(&self, images: &mut [SourceImage]) {
        images.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    }
}

pub fn strategy_for(ordering: ImageOrdering) -> Box<dyn OrderingStrategy> {
    match ordering {
        ImageOrdering::ModifiedTime => Box::new(ByModifiedTime),
        ImageOrdering::FileName => Box::new(ByFileName),
    }
}

/// Lower-cased extension of `path` when it is one of `extensions`
fn image_format(path: &Path, extensions: &[String]) -> Option<String> {
    let format = path.extension()?.to_str()?.to_ascii_lowercase();
    extensions
        .iter()
        .any(|accepted| accepted.eq_ignore_ascii_case(&format))
        .then_some(format)
}

/// Regular files in `dir` whose extension is one of `extensions`
/// (case-insensitive). Order is unspecified.
pub fn list_images(dir: &Path, extensions: &[String]) -> std::io::Result<Vec<SourceImage>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(format) = image_format(&path, extensions) else {
            continue;
        };
        images.push(SourceImage {
            path,
            format,
            modified: metadata.modified()?,
        });
    }
    Ok(images)
}

/// True for events that mean a file in the directory is complete: closed
/// after writing, or renamed into place.
fn is_finished_file(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

/// Images completed in a directory after the watch started
pub struct DirectoryWatcher {
    rx: flume::Receiver<(PathBuf, String)>,
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Watches `dir` (not its subdirectories) for images with one of
    /// `extensions`
    pub fn new(dir: &Path, extensions: Vec<String>) -> notify::Result<Self> {
        let (tx, rx) = flume::unbounded();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if is_finished_file(&event.kind) => {
                    for path in event.paths {
                        if let Some(format) = image_format(&path, &extensions) {
                            let _ = tx.send((path, format));
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Directory watch error"),
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            rx,
            _watcher: watcher,
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Next completed image, without waiting
    pub fn try_next(&self) -> Option<(PathBuf, String)> {
        self.rx.try_recv().ok()
    }
}

pub struct IngestHandler {
    config: IngestConfig,
    strategy: Box<dyn OrderingStrategy>,
    tracker: ProgressTracker,
    /// Batch images not emitted yet
    queue: VecDeque<SourceImage>,
    watcher: Option<DirectoryWatcher>,
    deadline: Option<Instant>,
}

impl IngestHandler {
    pub fn new(config: IngestConfig) -> Self {
        let strategy = strategy_for(config.ordering);
        Self::with_strategy(config, strategy)
    }

    pub fn with_strategy(config: IngestConfig, strategy: Box<dyn OrderingStrategy>) -> Self {
        Self {
            config,
            strategy,
            tracker: ProgressTracker::new(),
            queue: VecDeque::new(),
            watcher: None,
            deadline: None,
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.tracker
    }

    async fn emit(&mut self, path: &Path, format: String, ctx: &mut PluginContext) -> PluginResult<()> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable image");
                return Ok(());
            }
        };
        let uuid = image_uuid_for_path(path);
        debug!(path = %path.display(), image_uuid = %uuid, bytes = bytes.len(), "NewImage");
        ctx.publish(NewImage::new(uuid, format, bytes)).await?;
        self.tracker.record_emitted(uuid);
        Ok(())
    }

    /// Every batch image is out: announce, then wait for the stragglers
    async fn close_emission(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        self.tracker.close();
        ctx.announce_terminating().await?;

        if self.tracker.emitted() == 0 {
            info!("No images to emit");
            return self.finish(ctx).await;
        }
        if self.tracker.is_complete() {
            info!(images = self.tracker.emitted(), "Every emitted image finished");
            return self.finish(ctx).await;
        }
        info!(
            emitted = self.tracker.emitted(),
            pending = self.tracker.pending(),
            "All images emitted"
        );
        self.deadline =
            Some(Instant::now() + Duration::from_secs(self.config.completion_timeout_secs));
        Ok(Flow::Continue)
    }

    async fn finish(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        ctx.broadcast_terminate().await?;
        Ok(Flow::Complete)
    }

    async fn check_deadline(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                warn!(
                    emitted = self.tracker.emitted(),
                    pending = self.tracker.pending(),
                    "Gave up waiting for downstream completion"
                );
                self.finish(ctx).await
            }
            _ => Ok(Flow::Continue),
        }
    }
}

#[async_trait]
impl EventHandler for IngestHandler {
    fn is_producer(&self) -> bool {
        true
    }

    async fn on_start(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        if self.config.monitor_power {
            request_self_monitoring(ctx).await?;
        }

        if self.config.mode == IngestMode::Watch {
            let watcher =
                DirectoryWatcher::new(&self.config.source_dir, self.config.extensions.clone())?;
            info!(source_dir = %self.config.source_dir.display(), "Watching for new images");
            self.watcher = Some(watcher);
            return Ok(Flow::Continue);
        }

        let dir = self.config.source_dir.clone();
        let extensions = self.config.extensions.clone();
        let mut images = tokio::task::spawn_blocking(move || list_images(&dir, &extensions))
            .await
            .map_err(|e| PluginError::Task(e.to_string()))??;
        self.strategy.order(&mut images);

        info!(
            source_dir = %self.config.source_dir.display(),
            images = images.len(),
            "Emitting images"
        );
        self.queue = images.into();
        if self.queue.is_empty() {
            return self.close_emission(ctx).await;
        }
        Ok(Flow::Continue)
    }

    fn has_backlog(&self) -> bool {
        !self.queue.is_empty() || self.watcher.as_ref().is_some_and(DirectoryWatcher::has_pending)
    }

    async fn on_backlog(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        if let Some(image) = self.queue.pop_front() {
            self.emit(&image.path, image.format, ctx).await?;
            if self.queue.is_empty() {
                return self.close_emission(ctx).await;
            }
            return Ok(Flow::Continue);
        }

        if let Some((path, format)) = self.watcher.as_ref().and_then(DirectoryWatcher::try_next) {
            info!(path = %path.display(), "New image detected");
            self.emit(&path, format, ctx).await?;
        }
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, event: Event, ctx: &mut PluginContext) -> PluginResult<Flow> {
        let finished = match &event {
            Event::ImageStored(e) => Some(e.image_uuid),
            Event::ImageDeleted(e) => Some(e.image_uuid),
            _ => None,
        };

        if let Some(uuid) = finished {
            if self.tracker.record_terminal(uuid) {
                debug!(
                    image_uuid = %uuid,
                    finished = self.tracker.finished(),
                    emitted = self.tracker.emitted(),
                    "Image finished"
                );
                if self.tracker.is_complete() {
                    info!(images = self.tracker.emitted(), "Every emitted image finished");
                    return self.finish(ctx).await;
                }
            }
        }

        self.check_deadline(ctx).await
    }

    async fn on_idle(&mut self, ctx: &mut PluginContext) -> PluginResult<Flow> {
        self.check_deadline(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, ExitReason};
    use camtrap_bus::{Broker, BrokerConfig, BusHandle};
    use camtrap_client::{ClientConfig, Role, Socket};
    use camtrap_core::config::DispatcherConfig;
    use camtrap_core::{PipelineConfig, PluginIdentity};
    use camtrap_events::{EventKind, ImageDeleted};
    use camtrap_filter::SubscriptionSet;
    use std::fs::{self, File};
    use std::sync::Arc;

    fn touch(dir: &Path, name: &str, modified: SystemTime) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        path
    }

    fn names(images: &[SourceImage]) -> Vec<String> {
        images
            .iter()
            .map(|i| i.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_lists_only_accepted_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        touch(dir.path(), "a.JPG", now);
        touch(dir.path(), "b.png", now);
        touch(dir.path(), "c.jpeg", now);
        touch(dir.path(), "notes.txt", now);
        touch(dir.path(), ".DS_Store", now);
        fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let mut images = list_images(dir.path(), &IngestConfig::default().extensions).unwrap();
        ByFileName.order(&mut images);

        assert_eq!(names(&images), vec!["a.JPG", "b.png", "c.jpeg"]);
        assert_eq!(images[0].format, "jpg");
    }

    #[test]
    fn test_modified_time_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        touch(dir.path(), "late.jpg", base + Duration::from_secs(60));
        touch(dir.path(), "early.jpg", base);
        touch(dir.path(), "tie-b.jpg", base + Duration::from_secs(30));
        touch(dir.path(), "tie-a.jpg", base + Duration::from_secs(30));

        let mut images = list_images(dir.path(), &["jpg".to_string()]).unwrap();
        strategy_for(ImageOrdering::ModifiedTime).order(&mut images);

        assert_eq!(
            names(&images),
            vec!["early.jpg", "tie-a.jpg", "tie-b.jpg", "late.jpg"]
        );
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_images(&dir.path().join("absent"), &["jpg".to_string()]).is_err());
    }

    /// Deletes every image it is offered
    struct DeleteEverything;

    #[async_trait]
    impl EventHandler for DeleteEverything {
        async fn handle(&mut self, event: Event, ctx: &mut PluginContext) -> PluginResult<Flow> {
            if let Event::NewImage(image) = event {
                ctx.publish(ImageDeleted::new(image.image_uuid, image.image_format))
                    .await?;
            }
            Ok(Flow::Continue)
        }
    }

    async fn dispatcher_on<H: EventHandler>(
        bus: &BusHandle,
        name: &str,
        kinds: &[EventKind],
        recv_queue_capacity: usize,
        handler: H,
    ) -> Dispatcher<H> {
        let mut client = ClientConfig::new(bus.local_addrs()[0].to_string());
        client.reconnect.enabled = false;
        client.recv_queue_capacity = recv_queue_capacity;
        let identity = PluginIdentity::new(name);
        let subscriber = Socket::connect(
            client.clone(),
            &identity,
            Role::Subscriber,
            SubscriptionSet::from_kinds(kinds),
        )
        .await
        .unwrap();
        let publisher = Socket::connect(client, &identity, Role::Publisher, SubscriptionSet::default())
            .await
            .unwrap();
        let ctx = PluginContext::new(identity, Arc::new(PipelineConfig::default()), publisher);
        let settings = DispatcherConfig {
            poll_timeout_ms: 50,
            max_idle_timeouts: None,
            max_transport_errors: 3,
            announce_started: true,
        };
        Dispatcher::new(handler, ctx, subscriber, &settings)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_events_beyond_receive_queue_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let images = 200;
        for i in 0..images {
            fs::write(dir.path().join(format!("IMG_{i:04}.jpg")), [0xFF, 0xD8, i as u8]).unwrap();
        }
        let bus = Broker::start(BrokerConfig::ephemeral()).await.unwrap();

        let deleter = dispatcher_on(
            &bus,
            "image_storing_plugin",
            &[EventKind::NewImage, EventKind::PluginTerminate],
            4096,
            DeleteEverything,
        )
        .await;
        let deleter = tokio::spawn(deleter.run());

        let config = IngestConfig {
            source_dir: dir.path().to_path_buf(),
            completion_timeout_secs: 60,
            ..IngestConfig::default()
        };
        let ingest = dispatcher_on(
            &bus,
            "image_generating_plugin",
            &[EventKind::ImageStored, EventKind::ImageDeleted, EventKind::PluginTerminate],
            16,
            IngestHandler::new(config),
        )
        .await;

        let started = Instant::now();
        let (handler, reason) = tokio::time::timeout(Duration::from_secs(30), ingest.run())
            .await
            .expect("ingest hung");
        assert_eq!(reason, ExitReason::Completed);
        assert_eq!(handler.progress().emitted(), images);
        assert_eq!(handler.progress().finished(), images);
        assert!(started.elapsed() < Duration::from_secs(60));

        let (_, reason) = tokio::time::timeout(Duration::from_secs(5), deleter)
            .await
            .expect("deleter hung")
            .unwrap();
        assert_eq!(reason, ExitReason::Terminated);
        bus.shutdown();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_watcher_reports_images_written_after_start() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("before.jpg"), b"old").unwrap();
        let watcher = DirectoryWatcher::new(dir.path(), IngestConfig::default().extensions).unwrap();

        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::write(dir.path().join("after.JPG"), b"new").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match watcher.try_next() {
                Some(image) => seen.push(image),
                None if !seen.is_empty() => break,
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }

        assert_eq!(seen.len(), 1, "{seen:?}");
        let (path, format) = &seen[0];
        assert_eq!(path.file_name().unwrap(), "after.JPG");
        assert_eq!(format, "jpg");
        assert_eq!(image_uuid_for_path(path), image_uuid_for_path(&dir.path().join("after.JPG")));
    }

    #[test]
    fn test_image_format_filter() {
        let accepted = IngestConfig::default().extensions;
        assert_eq!(image_format(Path::new("/x/a.PNG"), &accepted).as_deref(), Some("png"));
        assert_eq!(image_format(Path::new("/x/a.gif"), &accepted), None);
        assert_eq!(image_format(Path::new("/x/README"), &accepted), None);
    }
}
