//! Link status shared between a [`Socket`](crate::Socket) and its connection task.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Lost the bus, retrying with backoff
    Reconnecting,
    /// Shut down by the owner
    Closed,
    /// Gave up; the socket will not recover
    Failed,
}

#[derive(Debug)]
pub struct LinkStatus {
    state: RwLock<LinkState>,
    frames_received: AtomicU64,
    /// Frames dropped because the receive queue was full
    frames_dropped: AtomicU64,
    /// Failed attempts since the last successful connect
    reconnect_attempts: AtomicU64,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStatus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LinkState::Connecting),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    pub fn mark_connected(&self) {
        self.set_state(LinkState::Connected);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn is_failed(&self) -> bool {
        self.state() == LinkState::Failed
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_link_is_connecting() {
        let status = LinkStatus::new();
        assert_eq!(status.state(), LinkState::Connecting);
        assert!(!status.is_connected());
        assert!(!status.is_failed());
    }

    #[test]
    fn test_connect_resets_reconnect_attempts() {
        let status = LinkStatus::new();
        status.record_reconnect();
        status.record_reconnect();
        assert_eq!(status.reconnect_attempts(), 2);

        status.mark_connected();
        assert!(status.is_connected());
        assert_eq!(status.reconnect_attempts(), 0);
    }

    #[test]
    fn test_dropped_frames_count_separately() {
        let status = LinkStatus::new();
        status.record_received();
        status.record_received();
        status.record_dropped();
        assert_eq!(status.frames_received(), 2);
        assert_eq!(status.frames_dropped(), 1);
    }

    #[test]
    fn test_failed_link() {
        let status = LinkStatus::new();
        status.mark_connected();
        status.set_state(LinkState::Failed);
        assert!(status.is_failed());
        assert!(!status.is_connected());
    }
}
