//! Outbound event bus
//!
//! The pipeline publishes alarm lifecycle and history events for the
//! dashboard. Emission never fails from the caller's point of view; sink
//! errors are logged.

use async_trait::async_trait;
use errors::IgnisResult;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Topic names
pub mod topics {
    pub const ALARM_OPENED: &str = "pci:alarm:on";
    pub const ALARM_CLOSED: &str = "pci:alarm:off";
    pub const HISTORY_NEW: &str = "event:new";
    pub const SIMULATION_RESOLVED: &str = "pci:simulation:resolved";
}

/// Outbound event-bus contract
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, topic: &str, payload: Value);
}

/// One emitted message
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

/// In-process fan-out
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<BusMessage>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, topic: &str, payload: Value) {
        // No subscribers is not an error
        let _ = self.tx.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
    }
}

/// Publishes JSON payloads on `{prefix}:{topic}`
pub struct RedisSink {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisSink {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> IgnisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("Redis event sink: {}", url);
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }
}

/// Channel and message text of one Redis publication
fn publication(prefix: &str, topic: &str, payload: &Value) -> (String, String) {
    let channel = if prefix.is_empty() {
        topic.to_string()
    } else {
        format!("{prefix}:{topic}")
    };
    (channel, payload.to_string())
}

#[async_trait]
impl EventSink for RedisSink {
    async fn emit(&self, topic: &str, payload: Value) {
        let (channel, message) = publication(&self.prefix, topic, &payload);
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = conn.publish(&channel, message).await;
        match result {
            Ok(receivers) => debug!("Published {} to {} subscribers", channel, receivers),
            Err(e) => warn!("Publish {} failed: {}", channel, e),
        }
    }
}

/// Logs every emission
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, topic: &str, payload: Value) {
        info!(topic = topic, payload = %payload, "Event");
    }
}

/// Which sink the binary builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    Redis,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_sink_fans_out() {
        let sink = BroadcastSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        sink.emit(topics::ALARM_OPENED, json!({"id": 1})).await;

        let msg = a.recv().await.unwrap();
        assert_eq!(msg.topic, "pci:alarm:on");
        assert_eq!(msg.payload["id"], 1);
        assert_eq!(b.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastSink::new(1);
        sink.emit(topics::HISTORY_NEW, json!({})).await;
    }

    #[test]
    fn test_redis_publication_channel_and_message() {
        let payload = json!({"id": 3, "status": "ACTIVE"});

        let (channel, message) = publication("ignis", topics::ALARM_OPENED, &payload);
        assert_eq!(channel, "ignis:pci:alarm:on");
        assert_eq!(message, r#"{"id":3,"status":"ACTIVE"}"#);

        let (channel, _) = publication("", topics::HISTORY_NEW, &payload);
        assert_eq!(channel, "event:new");
    }

    #[tokio::test]
    #[ignore = "Requires Redis connection"]
    async fn test_redis_sink_publishes() {
        use futures::StreamExt;

        let url = "redis://localhost:6379";
        let mut pubsub = redis::Client::open(url)
            .unwrap()
            .get_async_pubsub()
            .await
            .unwrap();
        pubsub.subscribe("ignis-test:pci:alarm:off").await.unwrap();

        let sink = RedisSink::connect(url, "ignis-test").await.unwrap();
        sink.emit(topics::ALARM_CLOSED, json!({"id": 9})).await;

        let mut messages = Box::pin(pubsub.on_message());
        let msg = messages.next().await.unwrap();
        assert_eq!(msg.get_channel_name(), "ignis-test:pci:alarm:off");
        let text: String = msg.get_payload().unwrap();
        assert_eq!(text, r#"{"id":9}"#);
    }

    #[test]
    fn test_sink_kind_parse() {
        let kind: SinkKind = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(kind, SinkKind::Redis);
    }
}
