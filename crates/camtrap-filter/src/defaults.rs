//! Subscriptions each plugin role needs out of the box.

use crate::rules::{FilterError, SubscriptionSet};
use camtrap_core::config::PluginSettings;
use camtrap_core::PluginRole;
use camtrap_events::EventKind;

/// Event kinds a role consumes unless configured otherwise.
pub fn default_kinds(role: PluginRole) -> &'static [EventKind] {
    match role {
        PluginRole::ImageGenerating => &[
            EventKind::ImageStored,
            EventKind::ImageDeleted,
            EventKind::PluginTerminate,
        ],
        PluginRole::ImageReceiving | PluginRole::ImageScoring => {
            &[EventKind::NewImage, EventKind::PluginTerminate]
        }
        PluginRole::ImageStoring => &[EventKind::ImageScored, EventKind::PluginTerminate],
        PluginRole::Oracle => &[
            EventKind::NewImage,
            EventKind::ImageReceived,
            EventKind::ImageScored,
            EventKind::ImageStored,
            EventKind::ImageDeleted,
            EventKind::PluginTerminating,
            EventKind::PluginTerminate,
        ],
        PluginRole::PowerMeasuring => &[
            EventKind::MonitorPowerStart,
            EventKind::MonitorPowerStop,
            EventKind::PluginTerminate,
        ],
        PluginRole::Observer => &EventKind::ALL,
    }
}

/// Subscriptions for a role, honouring a configured override.
///
/// `PluginTerminate` is always added so every plugin can be shut down.
pub fn resolve_subscriptions(
    role: PluginRole,
    settings: &PluginSettings,
) -> Result<SubscriptionSet, FilterError> {
    let mut set = match &settings.subscriptions {
        Some(names) => SubscriptionSet::from_names(names)?,
        None => SubscriptionSet::from_kinds(default_kinds(role)),
    };
    set.insert(crate::rules::Subscription::kind(EventKind::PluginTerminate));
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camtrap_events::prefix::{prepend, tag_for};

    #[test]
    fn test_every_role_hears_terminate() {
        let frame = prepend(tag_for(EventKind::PluginTerminate), b"");
        for role in PluginRole::ALL {
            let set = resolve_subscriptions(role, &PluginSettings::default()).unwrap();
            assert!(set.evaluate(&frame).is_pass(), "{role} misses PluginTerminate");
        }
    }

    #[test]
    fn test_override_replaces_defaults() {
        let settings = PluginSettings {
            subscriptions: Some(vec!["ImageStored".to_string()]),
            ..Default::default()
        };
        let set = resolve_subscriptions(PluginRole::Oracle, &settings).unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set
            .evaluate(&prepend(tag_for(EventKind::NewImage), b""))
            .is_pass());
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let settings = PluginSettings {
            subscriptions: Some(vec!["Bogus".to_string()]),
            ..Default::default()
        };
        assert!(resolve_subscriptions(PluginRole::ImageScoring, &settings).is_err());
    }
}
