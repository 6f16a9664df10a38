//! Lifecycle event envelope and the pub/sub subscriber.
//!
//! State-changing scripts publish events on the queue's `events` channel in
//! the same atomic step as the transition itself. Locally, the worker fans
//! the same envelope out on a typed broadcast channel so in-process callers
//! never need a Redis round-trip.

use crate::error::QueueError;
use crate::keys::QueueKeys;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lifecycle event kinds carried on the per-queue channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Active,
    Completed,
    Failed,
    Progress,
    Stalled,
}

impl EventKind {
    /// Wire tag, also used as the metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Progress => "progress",
            Self::Stalled => "stalled",
        }
    }
}

/// The wire envelope: `{event, jobId, name, timestamp, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEvent {
    pub event: EventKind,
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub name: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    /// Return value (completed), failure reason (failed) or progress payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Subscriber over the queue's pub/sub channel.
///
/// Needs a dedicated connection: Redis pub/sub takes the connection out of
/// command mode, so the shared `ConnectionManager` cannot be used here.
pub struct EventSubscriber {
    pubsub: redis::aio::PubSub,
    channel: String,
}

impl EventSubscriber {
    /// Subscribe to a queue's events channel.
    pub async fn connect(client: &redis::Client, keys: &QueueKeys) -> Result<Self, QueueError> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&keys.events).await?;
        Ok(Self {
            pubsub,
            channel: keys.events.clone(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Consume the subscriber as a stream of decoded events. Messages that
    /// fail to decode are logged and skipped.
    pub fn into_stream(self) -> impl Stream<Item = QueueEvent> {
        let channel = self.channel;
        self.pubsub.into_on_message().filter_map(move |msg| {
            let channel = channel.clone();
            async move {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping undecodable event payload");
                        return None;
                    }
                };
                match serde_json::from_str::<QueueEvent>(&payload) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping malformed event");
                        None
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serde_round_trip() {
        let event = QueueEvent {
            event: EventKind::Completed,
            job_id: "job-1".to_string(),
            name: "bootstrap-sync".to_string(),
            timestamp: 1_700_000_000_000,
            data: Some(json!({"synced": 42})),
        };

        let raw = serde_json::to_string(&event).unwrap();
        let back: QueueEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_kind_tags_are_lowercase() {
        assert_eq!(serde_json::to_string(&EventKind::Active).unwrap(), "\"active\"");
        assert_eq!(
            serde_json::to_string(&EventKind::Stalled).unwrap(),
            "\"stalled\""
        );
        // as_str matches the serde tag.
        for kind in [
            EventKind::Active,
            EventKind::Completed,
            EventKind::Failed,
            EventKind::Progress,
            EventKind::Stalled,
        ] {
            let tag = serde_json::to_string(&kind).unwrap();
            assert_eq!(tag, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_event_without_data_omits_field() {
        let event = QueueEvent {
            event: EventKind::Active,
            job_id: "job-1".to_string(),
            name: "meta".to_string(),
            timestamp: 1,
            data: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "active");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_event_decodes_lua_payload() {
        // Shape produced by the transition scripts.
        let raw = r#"{"event":"failed","jobId":"j1","name":"meta","timestamp":1700000000000,"data":"stalled"}"#;
        let event: QueueEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event, EventKind::Failed);
        assert_eq!(event.job_id, "j1");
        assert_eq!(event.data, Some(json!("stalled")));
    }
}
