//! Topic/subscription naming convention helpers.
//!
//! A subscription name must be `<TopicName>_<Suffix>`: everything before the
//! first underscore names the parent topic. Administrative provisioning
//! relies on this to derive the topic a subscription hangs off, and the
//! dead-letter retry engine relies on it when re-targeting redeliveries.

use crate::error::BusError;

/// Topic a subscription belongs to (the segment before the first `_`).
pub fn topic_of_subscription(subscription: &str) -> Result<&str, BusError> {
    validate_subscription_name(subscription)?;
    Ok(subscription
        .split('_')
        .next()
        .unwrap_or_default())
}

/// Check the `<TopicName>_<Suffix>` shape: both sides non-empty.
pub fn validate_subscription_name(subscription: &str) -> Result<(), BusError> {
    match subscription.split_once('_') {
        Some((topic, suffix)) if !topic.is_empty() && !suffix.is_empty() => Ok(()),
        _ => Err(BusError::InvalidNaming(subscription.to_string())),
    }
}
