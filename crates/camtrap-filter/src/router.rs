//! Subscription table used by the bus hub to pick the recipients of a frame.
//!
//! Concurrent reads and writes go through `DashMap`; connections register and
//! unregister while the forwarding loop routes frames.

use crate::rules::{FilterResult, FilterStats, SubscriptionSet};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

/// Bus-assigned connection identifier
pub type SubscriberId = u64;

/// One registered subscriber
pub struct SubscriberRoute {
    pub id: SubscriberId,
    /// Plugin name announced in the handshake
    pub plugin_name: String,
    pub subscriptions: SubscriptionSet,
    stats: RwLock<FilterStats>,
}

impl SubscriberRoute {
    pub fn new(id: SubscriberId, plugin_name: impl Into<String>, subscriptions: SubscriptionSet) -> Self {
        Self {
            id,
            plugin_name: plugin_name.into(),
            subscriptions,
            stats: RwLock::new(FilterStats::new()),
        }
    }

    #[inline]
    pub fn evaluate(&self, frame: &[u8]) -> FilterResult {
        let result = self.subscriptions.evaluate(frame);
        self.stats.write().record(result);

        trace!(
            subscriber = self.id,
            plugin = %self.plugin_name,
            result = ?result,
            "Subscription evaluation"
        );

        result
    }

    pub fn stats(&self) -> FilterStats {
        self.stats.read().clone()
    }
}

/// Subscribers whose prefixes matched a frame, in registration order
#[derive(Debug, Clone, Default)]
pub struct RoutingResult {
    pub destinations: Vec<SubscriberId>,
}

impl RoutingResult {
    #[inline]
    pub fn has_destinations(&self) -> bool {
        !self.destinations.is_empty()
    }
}

/// All live subscribers of a bus hub
#[derive(Default)]
pub struct SubscriptionTable {
    routes: DashMap<SubscriberId, Arc<SubscriberRoute>>,
    order: RwLock<Vec<SubscriberId>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a subscriber
    pub fn add(&self, route: SubscriberRoute) {
        let id = route.id;
        debug!(
            subscriber = id,
            plugin = %route.plugin_name,
            prefixes = route.subscriptions.len(),
            "Subscriber registered"
        );
        if self.routes.insert(id, Arc::new(route)).is_none() {
            self.order.write().push(id);
        }
    }

    pub fn remove(&self, id: SubscriberId) -> Option<Arc<SubscriberRoute>> {
        let route = self.routes.remove(&id).map(|(_, r)| r);
        self.order.write().retain(|existing| *existing != id);
        if route.is_some() {
            debug!(subscriber = id, "Subscriber removed");
        }
        route
    }

    pub fn get(&self, id: SubscriberId) -> Option<Arc<SubscriberRoute>> {
        self.routes.get(&id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Subscribers that should receive `frame`, excluding `origin`.
    pub fn route(&self, frame: &[u8], origin: Option<SubscriberId>) -> RoutingResult {
        let mut result = RoutingResult::default();
        for id in self.order.read().iter() {
            if Some(*id) == origin {
                continue;
            }
            if let Some(route) = self.routes.get(id) {
                if route.evaluate(frame).is_pass() {
                    result.destinations.push(*id);
                }
            }
        }

        trace!(destinations = ?result.destinations, "Frame routed");
        result
    }

    pub fn get_all_stats(&self) -> Vec<(SubscriberId, FilterStats)> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.routes.get(id).map(|r| (*id, r.stats())))
            .collect()
    }

    pub fn clear(&self) {
        self.routes.clear();
        self.order.write().clear();
    }
}
