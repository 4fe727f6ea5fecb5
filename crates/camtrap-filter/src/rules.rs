//! Prefix subscriptions.
//!
//! A subscription is a byte prefix. A frame passes when it starts with the
//! prefix; the empty prefix passes everything. Matching never looks past the
//! prefix, so frames are filtered without being decoded.

use camtrap_events::prefix::tag_for;
use camtrap_events::{EventKind, WILDCARD_TARGET};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Unknown event kind in subscription list: {0}")]
    UnknownKind(String),
}

/// Result of evaluating a frame against a subscription set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Pass,
    Block,
}

impl FilterResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, FilterResult::Pass)
    }

    #[inline]
    pub fn from_bool(pass: bool) -> Self {
        if pass {
            FilterResult::Pass
        } else {
            FilterResult::Block
        }
    }
}

/// A single byte-prefix subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription(Vec<u8>);

impl Subscription {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self(prefix.into())
    }

    /// Subscription to one event kind
    pub fn kind(kind: EventKind) -> Self {
        Self(tag_for(kind).to_vec())
    }

    /// The empty prefix, matching every frame
    pub fn everything() -> Self {
        Self(Vec::new())
    }

    pub fn prefix(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn matches(&self, frame: &[u8]) -> bool {
        frame.starts_with(&self.0)
    }
}

/// The set of prefixes one subscriber listens to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSet {
    prefixes: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new(prefixes: Vec<Subscription>) -> Self {
        let mut set = Self::default();
        for prefix in prefixes {
            set.insert(prefix);
        }
        set
    }

    pub fn everything() -> Self {
        Self::new(vec![Subscription::everything()])
    }

    pub fn from_kinds(kinds: &[EventKind]) -> Self {
        Self::new(kinds.iter().copied().map(Subscription::kind).collect())
    }

    /// Parses kind names such as `ImageScored`. `"*"` subscribes to everything.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, FilterError> {
        let mut set = Self::default();
        for name in names {
            let name = name.as_ref().trim();
            if name == WILDCARD_TARGET {
                set.insert(Subscription::everything());
                continue;
            }
            let kind =
                EventKind::from_name(name).ok_or_else(|| FilterError::UnknownKind(name.to_string()))?;
            set.insert(Subscription::kind(kind));
        }
        Ok(set)
    }

    /// Adds a prefix, ignoring duplicates
    pub fn insert(&mut self, subscription: Subscription) {
        if !self.prefixes.contains(&subscription) {
            self.prefixes.push(subscription);
        }
    }

    pub fn remove(&mut self, subscription: &Subscription) -> bool {
        let before = self.prefixes.len();
        self.prefixes.retain(|s| s != subscription);
        before != self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.prefixes.iter()
    }

    /// Raw prefixes, as sent in a connection handshake
    pub fn to_prefixes(&self) -> Vec<Vec<u8>> {
        self.prefixes.iter().map(|s| s.0.clone()).collect()
    }

    pub fn from_prefixes(prefixes: Vec<Vec<u8>>) -> Self {
        Self::new(prefixes.into_iter().map(Subscription).collect())
    }

    /// A set with no prefixes blocks everything.
    #[inline]
    pub fn evaluate(&self, frame: &[u8]) -> FilterResult {
        FilterResult::from_bool(self.prefixes.iter().any(|s| s.matches(frame)))
    }
}

/// Counters for filter evaluations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub total: u64,
    pub passes: u64,
    pub blocks: u64,
}

impl FilterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: FilterResult) {
        self.total += 1;
        match result {
            FilterResult::Pass => self.passes += 1,
            FilterResult::Block => self.blocks += 1,
        }
    }

    /// Pass rate as a percentage
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passes as f64 / self.total as f64) * 100.0
        }
    }
}

impl fmt::Display for FilterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FilterStats(total: {}, passes: {}, blocks: {}, pass_rate: {:.2}%)",
            self.total,
            self.passes,
            self.blocks,
            self.pass_rate()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camtrap_events::prefix::prepend;

    fn frame(kind: EventKind) -> Vec<u8> {
        prepend(tag_for(kind), b"body")
    }

    #[test]
    fn test_kind_subscription_matches_only_its_kind() {
        let sub = Subscription::kind(EventKind::ImageScored);
        assert!(sub.matches(&frame(EventKind::ImageScored)));
        assert!(!sub.matches(&frame(EventKind::ImageStored)));
        assert!(!sub.matches(&[0x03]));
    }

    #[test]
    fn test_empty_prefix_matches_everything() {
        let set = SubscriptionSet::everything();
        for kind in EventKind::ALL {
            assert!(set.evaluate(&frame(kind)).is_pass());
        }
        assert!(set.evaluate(&[]).is_pass());
    }

    #[test]
    fn test_empty_set_blocks_everything() {
        let set = SubscriptionSet::default();
        assert_eq!(set.evaluate(&frame(EventKind::NewImage)), FilterResult::Block);
    }

    #[test]
    fn test_from_names() {
        let set = SubscriptionSet::from_names(&["ImageStored", "ImageDeletedEvent"]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.evaluate(&frame(EventKind::ImageDeleted)).is_pass());
        assert!(!set.evaluate(&frame(EventKind::NewImage)).is_pass());

        assert_eq!(
            SubscriptionSet::from_names(&["ImageResized"]),
            Err(FilterError::UnknownKind("ImageResized".to_string()))
        );
        assert!(SubscriptionSet::from_names(&["*"])
            .unwrap()
            .evaluate(&frame(EventKind::MonitorPowerStop))
            .is_pass());
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut set = SubscriptionSet::from_kinds(&[EventKind::NewImage, EventKind::NewImage]);
        assert_eq!(set.len(), 1);
        assert!(set.remove(&Subscription::kind(EventKind::NewImage)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_stats() {
        let set = SubscriptionSet::from_kinds(&[EventKind::NewImage]);
        let mut stats = FilterStats::new();
        stats.record(set.evaluate(&frame(EventKind::NewImage)));
        stats.record(set.evaluate(&frame(EventKind::ImageScored)));
        assert_eq!(stats.total, 2);
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.pass_rate(), 50.0);
    }
}
