//! Action events published to the message bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use odrive_core::config::EventsConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::SinkError;

pub const EVENT_TYPE: &str = "object-drive-event";
pub const SCHEMA_VERSION: &str = "1.0";

/// One user-visible action and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEvent {
    pub id: String,
    pub schema_version: String,
    pub event_type: String,
    pub action: String,
    pub successful: bool,
    /// Unix seconds.
    pub timestamp: i64,
    pub user_dn: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub originator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ObjectEvent {
    pub fn new(action: &str, user_dn: &str, successful: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            schema_version: SCHEMA_VERSION.into(),
            event_type: EVENT_TYPE.into(),
            action: action.to_string(),
            successful,
            timestamp: chrono::Utc::now().timestamp(),
            user_dn: user_dn.to_string(),
            originator_tokens: Vec::new(),
            object_id: None,
            object_name: None,
            change_token: None,
            content_size: None,
            error: None,
        }
    }

    pub fn with_object(mut self, id: &str, name: &str, change_token: &str, size: i64) -> Self {
        self.object_id = Some(id.to_string());
        self.object_name = Some(name.to_string());
        self.change_token = Some(change_token.to_string());
        self.content_size = Some(size);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Bytes, SinkError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Which actions get published; `*` matches every action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionFilter {
    success: Vec<String>,
    failure: Vec<String>,
}

impl ActionFilter {
    pub fn new(success: Vec<String>, failure: Vec<String>) -> Self {
        Self { success, failure }
    }

    pub fn admits(&self, action: &str, successful: bool) -> bool {
        let list = if successful {
            &self.success
        } else {
            &self.failure
        };
        list.iter().any(|a| a == "*" || a == action)
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SinkError>;
}

/// Core NATS publish; events are notifications, not a work queue.
pub struct NatsPublisher {
    client: async_nats::Client,
}

impl NatsPublisher {
    pub async fn connect(url: &str) -> Result<Self, SinkError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| SinkError::Transport {
                sink: "nats",
                msg: format!("connecting to NATS at {url}: {e}"),
            })?;
        info!("NATS: connected to {url}");
        Ok(Self { client })
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SinkError> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| SinkError::Transport {
                sink: "nats",
                msg: e.to_string(),
            })
    }
}

/// Non-blocking front of the publisher task.
pub struct EventSink {
    tx: Option<mpsc::Sender<ObjectEvent>>,
    filter: ActionFilter,
    dropped: AtomicU64,
}

impl EventSink {
    /// A sink that accepts and discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            filter: ActionFilter::default(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Start the publisher task on the current runtime.
    pub fn start(publisher: Arc<dyn Publisher>, cfg: &EventsConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<ObjectEvent>(cfg.queue_bound.max(1));
        let topic = cfg.topic.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let payload = match event.to_bytes() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(action = %event.action, error = %e, "event not serializable");
                        continue;
                    }
                };
                if let Err(e) = publisher.publish(&topic, payload).await {
                    warn!(topic = %topic, action = %event.action, error = %e, "event publish failed");
                }
            }
            debug!("event publisher exiting");
        });
        Self {
            tx: Some(tx),
            filter: ActionFilter::new(
                cfg.publish_success_actions.clone(),
                cfg.publish_failure_actions.clone(),
            ),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Hand an event to the publisher if its action is wanted. Never blocks.
    pub fn emit(&self, event: ObjectEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if !self.filter.admits(&event.action, event.successful) {
            return;
        }
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(action = %event.action, "event queue unavailable; dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Captured(Mutex<Vec<(String, ObjectEvent)>>);

    #[async_trait]
    impl Publisher for Captured {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SinkError> {
            let event: ObjectEvent = serde_json::from_slice(&payload)?;
            self.0.lock().unwrap().push((topic.to_string(), event));
            Ok(())
        }
    }

    fn cfg(success: &[&str], failure: &[&str]) -> EventsConfig {
        EventsConfig {
            publish_success_actions: success.iter().map(|s| s.to_string()).collect(),
            publish_failure_actions: failure.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn settle(captured: &Captured, n: usize) {
        for _ in 0..100 {
            if captured.0.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_filter_wildcard_and_names() {
        let f = ActionFilter::new(vec!["*".into()], vec!["create".into()]);
        assert!(f.admits("anything", true));
        assert!(f.admits("create", false));
        assert!(!f.admits("read", false));
        assert!(!ActionFilter::default().admits("create", true));
    }

    #[tokio::test]
    async fn test_sink_publishes_admitted_events_to_topic() {
        let captured = Arc::new(Captured::default());
        let sink = EventSink::start(captured.clone(), &cfg(&["create"], &[]));
        sink.emit(ObjectEvent::new("create", "cn=alice", true).with_object("ab", "a.txt", "t1", 5));
        sink.emit(ObjectEvent::new("read", "cn=alice", true));
        sink.emit(ObjectEvent::new("create", "cn=alice", false).with_error("denied"));
        settle(&captured, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let got = captured.0.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "odrive-event");
        assert_eq!(got[0].1.object_name.as_deref(), Some("a.txt"));
        assert_eq!(got[0].1.event_type, EVENT_TYPE);
    }

    #[tokio::test]
    async fn test_disabled_sink_is_silent() {
        let sink = EventSink::disabled();
        assert!(!sink.is_enabled());
        sink.emit(ObjectEvent::new("create", "cn=alice", true));
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_event_json_is_camel_case() {
        let v = serde_json::to_value(ObjectEvent::new("delete", "cn=a", true)).unwrap();
        assert_eq!(v["schemaVersion"], "1.0");
        assert_eq!(v["userDn"], "cn=a");
        assert!(v.get("objectId").is_none());
    }
}
