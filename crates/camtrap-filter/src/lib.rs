//! Prefix-based subscription filtering for bus frames.
//!
//! - [`rules`]: subscriptions and subscription sets (prefix match, empty prefix = everything)
//! - [`router`]: the bus hub's table of live subscribers
//! - [`defaults`]: per-role default subscriptions
//!
//! # Example
//!
//! ```rust
//! use camtrap_events::prefix::{prepend, tag_for};
//! use camtrap_events::EventKind;
//! use camtrap_filter::{SubscriberRoute, SubscriptionSet, SubscriptionTable};
//!
//! let table = SubscriptionTable::new();
//! table.add(SubscriberRoute::new(
//!     7,
//!     "image_scoring_plugin",
//!     SubscriptionSet::from_kinds(&[EventKind::NewImage]),
//! ));
//!
//! let frame = prepend(tag_for(EventKind::NewImage), b"...");
//! assert_eq!(table.route(&frame, None).destinations, vec![7]);
//! ```

pub mod defaults;
pub mod router;
pub mod rules;

pub use defaults::{default_kinds, resolve_subscriptions};
pub use router::{RoutingResult, SubscriberId, SubscriberRoute, SubscriptionTable};
pub use rules::{FilterError, FilterResult, FilterStats, Subscription, SubscriptionSet};
