//! Distributed shutdown.
//!
//! Plugins stop on a `PluginTerminate` naming them (or `"*"`). Two parties
//! decide when the whole pipeline is done and broadcast the wildcard:
//!
//! - the producer, with a [`ProgressTracker`] over the images it emitted;
//! - the oracle, with a [`CompletionDetector`] over everything it observes.
//!
//! Frames from different publishers may reach a subscriber in any order, so
//! the detector accepts a terminal event before the matching `NewImage` and
//! only counts an image as done once it has been quiet for the quiescence
//! window.

use camtrap_events::{Event, PluginTerminate};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// True when `command` targets the plugin with this name or instance id
pub fn is_addressed_to(command: &PluginTerminate, name: &str, uuid: &Uuid) -> bool {
    if command.is_wildcard() || command.target_plugin_name == name {
        return true;
    }
    Uuid::parse_str(&command.target_plugin_uuid)
        .map(|target| target == *uuid)
        .unwrap_or(false)
}

/// Producer-side bookkeeping of emitted and finished images
#[derive(Debug, Default)]
pub struct ProgressTracker {
    emitted: HashSet<Uuid>,
    terminal: HashSet<Uuid>,
    /// No more images will be emitted
    closed: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_emitted(&mut self, image_uuid: Uuid) {
        self.emitted.insert(image_uuid);
    }

    /// Marks the emitted set final; completion is only reported after this
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Records a stored/deleted image. Returns true the first time one of
    /// our own images is seen; foreign or repeated uuids are ignored.
    pub fn record_terminal(&mut self, image_uuid: Uuid) -> bool {
        self.emitted.contains(&image_uuid) && self.terminal.insert(image_uuid)
    }

    pub fn emitted(&self) -> usize {
        self.emitted.len()
    }

    pub fn finished(&self) -> usize {
        self.terminal.len()
    }

    pub fn pending(&self) -> usize {
        self.emitted() - self.finished()
    }

    pub fn is_complete(&self) -> bool {
        self.closed && self.pending() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct ImageActivity {
    last_activity: Instant,
    terminal: bool,
}

/// Oracle-side detection of global completion
#[derive(Debug)]
pub struct CompletionDetector {
    expected_producers: BTreeSet<String>,
    /// Producer name to the number of images known when it announced
    announced: BTreeMap<String, usize>,
    images: HashMap<Uuid, ImageActivity>,
    quiescence: Duration,
    fired: bool,
}

impl CompletionDetector {
    /// `producers` are the plugin names whose `PluginTerminating` must be
    /// seen. With none configured, the first announcement suffices.
    pub fn new<I, S>(producers: I, quiescence: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected_producers: producers.into_iter().map(Into::into).collect(),
            announced: BTreeMap::new(),
            images: HashMap::new(),
            quiescence,
            fired: false,
        }
    }

    pub fn observe(&mut self, event: &Event, now: Instant) {
        match event {
            Event::PluginTerminating(announcement) => {
                let is_producer = self.expected_producers.is_empty()
                    || self.expected_producers.contains(&announcement.plugin_name);
                if is_producer {
                    let known = self.images.len();
                    self.announced
                        .entry(announcement.plugin_name.clone())
                        .or_insert(known);
                    info!(
                        producer = %announcement.plugin_name,
                        images = known,
                        "Producer finished emitting"
                    );
                }
            }
            other => {
                let Some(image_uuid) = other.image_uuid() else {
                    return;
                };
                let terminal = other.kind().is_terminal();
                let entry = self.images.entry(image_uuid).or_insert(ImageActivity {
                    last_activity: now,
                    terminal: false,
                });
                entry.last_activity = now;
                entry.terminal |= terminal;
                debug!(image_uuid = %image_uuid, kind = %other.kind(), terminal = entry.terminal, "Image activity");
            }
        }
    }

    fn producers_done(&self) -> bool {
        if self.expected_producers.is_empty() {
            !self.announced.is_empty()
        } else {
            self.expected_producers
                .iter()
                .all(|name| self.announced.contains_key(name))
        }
    }

    /// Whether the pipeline is done, without consuming the one-shot signal
    pub fn is_complete(&self, now: Instant) -> bool {
        self.producers_done()
            && self.images.values().all(|image| {
                image.terminal
                    && now.saturating_duration_since(image.last_activity) >= self.quiescence
            })
    }

    /// Returns true exactly once, the first time the pipeline is complete
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.fired || !self.is_complete(now) {
            return false;
        }
        self.fired = true;
        info!(images = self.images.len(), "All announced images reached a terminal event");
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn terminal_count(&self) -> usize {
        self.images.values().filter(|image| image.terminal).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camtrap_core::PluginIdentity;
    use camtrap_events::ids::image_uuid;
    use camtrap_events::{
        ImageDeleted, ImageLabelScore, ImageScored, ImageStored, NewImage, PluginTerminating,
    };
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    const PRODUCER: &str = "image_generating_plugin";
    const QUIET: Duration = Duration::from_millis(500);

    #[test]
    fn test_terminate_addressing() {
        let me = PluginIdentity::new("image_scoring_plugin");

        assert!(is_addressed_to(&PluginTerminate::wildcard(), &me.name, &me.uuid));
        assert!(is_addressed_to(
            &PluginTerminate::new("image_scoring_plugin", ""),
            &me.name,
            &me.uuid
        ));
        assert!(is_addressed_to(
            &PluginTerminate::new("", me.uuid.to_string()),
            &me.name,
            &me.uuid
        ));
        assert!(is_addressed_to(
            &PluginTerminate::new("someone_else", "*"),
            &me.name,
            &me.uuid
        ));
        assert!(!is_addressed_to(
            &PluginTerminate::new("oracle_plugin", Uuid::new_v4().to_string()),
            &me.name,
            &me.uuid
        ));
        assert!(!is_addressed_to(
            &PluginTerminate::new("oracle_plugin", "not-a-uuid"),
            &me.name,
            &me.uuid
        ));
    }

    #[test]
    fn test_closed_empty_tracker_is_complete() {
        let mut tracker = ProgressTracker::new();
        tracker.close();
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_progress_tracker_ignores_foreign_and_repeated_images() {
        let mut tracker = ProgressTracker::new();
        assert!(!tracker.is_complete());

        let a = image_uuid("a.jpg");
        let b = image_uuid("b.jpg");
        tracker.record_emitted(a);
        assert!(tracker.record_terminal(a));
        // Still emitting: everything seen so far being done is not enough.
        assert!(!tracker.is_complete());

        tracker.record_emitted(b);
        tracker.close();
        assert_eq!(tracker.pending(), 1);

        assert!(!tracker.record_terminal(a));
        assert!(!tracker.record_terminal(image_uuid("someone-elses.jpg")));
        assert!(!tracker.is_complete());

        assert!(tracker.record_terminal(b));
        assert!(tracker.is_complete());
        assert_eq!(tracker.finished(), 2);
    }

    /// Events of a run with `n` images: the producer's stream (NewImages
    /// then its announcement) in publish order, and everything the other
    /// plugins publish.
    fn run_events(n: usize) -> (Vec<Event>, Vec<Event>) {
        let mut producer = Vec::new();
        let mut others = Vec::new();
        for i in 0..n {
            let id = image_uuid(&format!("/images/{i:03}.jpg"));
            producer.push(NewImage::new(id, "jpg", vec![i as u8]).into());
            others.push(
                ImageScored::new(id, "jpg", vec![ImageLabelScore::new("animal", 0.9)]).into(),
            );
            if i % 3 == 0 {
                others.push(ImageDeleted::new(id, "jpg").into());
            } else {
                others.push(ImageStored::new(id, "jpg", "Save").into());
            }
        }
        producer.push(PluginTerminating::new(PRODUCER, Uuid::new_v4()).into());
        (producer, others)
    }

    /// Random arrival order that keeps each publisher's own order
    fn interleave(producer: Vec<Event>, mut others: Vec<Event>, rng: &mut StdRng) -> Vec<Event> {
        others.shuffle(rng);
        let mut producer = producer.into_iter().peekable();
        let mut others = others.into_iter().peekable();
        let mut arrival = Vec::new();
        loop {
            let take_producer = match (producer.peek(), others.peek()) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(_), Some(_)) => rng.gen_bool(0.5),
            };
            let next = if take_producer { producer.next() } else { others.next() };
            arrival.extend(next);
        }
        arrival
    }

    fn converges(n: usize, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (producer, others) = run_events(n);
        let arrival = interleave(producer, others, &mut rng);

        let start = Instant::now();
        let mut detector = CompletionDetector::new([PRODUCER], QUIET);
        let total = arrival.len();
        let mut announced = false;
        let mut finished = HashSet::new();
        for (i, event) in arrival.iter().enumerate() {
            let now = start + Duration::from_millis(10 * i as u64);
            detector.observe(event, now);

            match event {
                Event::PluginTerminating(_) => announced = true,
                Event::ImageStored(e) => {
                    finished.insert(e.image_uuid);
                }
                Event::ImageDeleted(e) => {
                    finished.insert(e.image_uuid);
                }
                _ => {}
            }
            assert_eq!(
                detector.is_complete(now + QUIET * 10),
                announced && finished.len() == n,
                "wrong completion state at event {i} of {total} (n={n}, seed={seed})"
            );
        }

        let last = start + Duration::from_millis(10 * total as u64);
        if n > 0 {
            assert!(!detector.poll(last), "fired before the quiescence window");
        }
        assert!(detector.poll(last + QUIET));
        assert!(!detector.poll(last + QUIET * 2), "fired twice");
        assert_eq!(detector.image_count(), n);
        assert_eq!(detector.terminal_count(), n);
    }

    #[test]
    fn test_converges_with_no_images() {
        converges(0, 1);
    }

    #[test]
    fn test_converges_with_one_image() {
        for seed in 0..20 {
            converges(1, seed);
        }
    }

    #[test]
    fn test_converges_with_fifty_images_in_shuffled_order() {
        for seed in 0..20 {
            converges(50, seed);
        }
    }

    #[test]
    fn test_waits_for_every_expected_producer() {
        let start = Instant::now();
        let mut detector = CompletionDetector::new([PRODUCER, "second_producer"], QUIET);
        detector.observe(
            &PluginTerminating::new(PRODUCER, Uuid::new_v4()).into(),
            start,
        );
        assert!(!detector.poll(start + QUIET));

        // Announcements from plugins that are not producers do not count.
        detector.observe(
            &PluginTerminating::new("image_scoring_plugin", Uuid::new_v4()).into(),
            start,
        );
        assert!(!detector.poll(start + QUIET));

        detector.observe(
            &PluginTerminating::new("second_producer", Uuid::new_v4()).into(),
            start,
        );
        assert!(detector.poll(start + QUIET));
    }

    #[test]
    fn test_late_activity_restarts_quiescence() {
        let start = Instant::now();
        let id = image_uuid("late.jpg");
        let mut detector = CompletionDetector::new(Vec::<String>::new(), QUIET);

        detector.observe(&ImageStored::new(id, "jpg", "Save").into(), start);
        detector.observe(
            &PluginTerminating::new(PRODUCER, Uuid::new_v4()).into(),
            start,
        );
        // A straggling NewImage for an already-terminal image keeps it terminal
        // but restarts its quiet period.
        let late = start + QUIET;
        detector.observe(&NewImage::new(id, "jpg", vec![]).into(), late);

        assert!(!detector.poll(late + QUIET / 2));
        assert!(detector.poll(late + QUIET));
    }
}
