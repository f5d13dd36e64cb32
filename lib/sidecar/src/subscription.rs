//! Programmatic subscriptions and CloudEvents delivery types.

use serde::{Deserialize, Serialize};

/// One entry of the `GET /dapr/subscribe` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Pub/sub component name.
    pub pubsubname: String,
    /// Topic to subscribe to.
    pub topic: String,
    /// Application route the sidecar delivers events to.
    pub route: String,
}

impl Subscription {
    /// Creates a subscription entry.
    pub fn new(
        pubsubname: impl Into<String>,
        topic: impl Into<String>,
        route: impl Into<String>,
    ) -> Self {
        Self {
            pubsubname: pubsubname.into(),
            topic: topic.into(),
            route: route.into(),
        }
    }
}

/// CloudEvents envelope the sidecar wraps published payloads in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent<T> {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specversion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubsubname: Option<String>,
    pub data: T,
}

/// Delivery outcome reported back to the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TopicEventStatus {
    /// Processed; do not redeliver.
    Success,
    /// Transient failure; redeliver.
    Retry,
    /// Unprocessable; discard without redelivery.
    Drop,
}

/// Body returned from a subscription route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEventResponse {
    pub status: TopicEventStatus,
}

impl TopicEventResponse {
    #[must_use]
    pub const fn success() -> Self {
        Self {
            status: TopicEventStatus::Success,
        }
    }

    #[must_use]
    pub const fn retry() -> Self {
        Self {
            status: TopicEventStatus::Retry,
        }
    }

    #[must_use]
    pub const fn drop() -> Self {
        Self {
            status: TopicEventStatus::Drop,
        }
    }
}
