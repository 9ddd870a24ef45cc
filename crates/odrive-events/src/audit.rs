//! Audit records, queued per event type and submitted in batches.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odrive_core::config::AuditConfig;
use odrive_core::proto::audit_service_client::AuditServiceClient;
use odrive_core::proto::{AuditEvent, SubmitAuditEventsRequest};
use serde::Serialize;
use tokio::sync::Notify;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::SinkError;

pub const RESULT_SUCCESS: &str = "SUCCESS";
pub const RESULT_FAILURE: &str = "FAILURE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub event_type: String,
    pub action: String,
    pub result: String,
    pub initiator: String,
    pub object_id: String,
    pub object_name: String,
    pub acm: String,
    pub created_on: DateTime<Utc>,
    pub additional_info: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn new(event_type: &str, action: &str, success: bool, initiator: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            action: action.to_string(),
            result: if success { RESULT_SUCCESS } else { RESULT_FAILURE }.to_string(),
            initiator: initiator.to_string(),
            object_id: String::new(),
            object_name: String::new(),
            acm: String::new(),
            created_on: Utc::now(),
            additional_info: BTreeMap::new(),
        }
    }

    pub fn with_object(mut self, id: &str, name: &str, acm: &str) -> Self {
        self.object_id = id.to_string();
        self.object_name = name.to_string();
        self.acm = acm.to_string();
        self
    }

    pub fn with_info(mut self, key: &str, value: impl Into<String>) -> Self {
        self.additional_info.insert(key.to_string(), value.into());
        self
    }

    fn into_proto(self) -> AuditEvent {
        AuditEvent {
            event_type: self.event_type,
            action: self.action,
            result: self.result,
            initiator: self.initiator,
            object_id: self.object_id,
            object_name: self.object_name,
            acm: self.acm,
            created_on: self.created_on.timestamp_millis(),
            additional_info: self.additional_info.into_iter().collect::<HashMap<_, _>>(),
        }
    }
}

/// Where batches go.
#[async_trait]
pub trait AuditClient: Send + Sync {
    /// Submit records that all share `event_type`.
    async fn submit(&self, event_type: &str, records: Vec<AuditRecord>) -> Result<(), SinkError>;

    fn name(&self) -> &str;
}

#[derive(Clone)]
pub struct GrpcAuditClient {
    client: AuditServiceClient<Channel>,
}

impl GrpcAuditClient {
    pub fn connect_lazy(endpoint: &str, timeout: Duration) -> Result<Self, SinkError> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| SinkError::Transport {
                sink: "audit",
                msg: e.to_string(),
            })?
            .timeout(timeout)
            .connect_timeout(timeout)
            .connect_lazy();
        debug!(endpoint, "audit service client configured");
        Ok(Self {
            client: AuditServiceClient::new(channel),
        })
    }
}

#[async_trait]
impl AuditClient for GrpcAuditClient {
    async fn submit(&self, event_type: &str, records: Vec<AuditRecord>) -> Result<(), SinkError> {
        let reply = self
            .client
            .clone()
            .submit_audit_events(SubmitAuditEventsRequest {
                event_type: event_type.to_string(),
                events: records.into_iter().map(AuditRecord::into_proto).collect(),
            })
            .await
            .map_err(|status| SinkError::Transport {
                sink: "audit",
                msg: format!("{}: {}", status.code(), status.message()),
            })?
            .into_inner();
        if !reply.accepted {
            return Err(SinkError::Rejected {
                sink: "audit",
                messages: reply.messages,
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "grpc"
    }
}

/// Writes each record to the log under the `audit` target.
pub struct LogAuditClient;

#[async_trait]
impl AuditClient for LogAuditClient {
    async fn submit(&self, event_type: &str, records: Vec<AuditRecord>) -> Result<(), SinkError> {
        for r in records {
            info!(
                target: "audit",
                event_type,
                action = %r.action,
                result = %r.result,
                initiator = %r.initiator,
                object_id = %r.object_id,
                created_on = %r.created_on.to_rfc3339(),
                "audit"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[derive(Debug, Clone)]
pub struct AuditSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Records held per event type; the oldest is dropped beyond this
    pub queue_bound: usize,
}

impl From<&AuditConfig> for AuditSettings {
    fn from(cfg: &AuditConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms.max(1)),
            queue_bound: cfg.queue_bound.max(1),
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self::from(&AuditConfig::default())
    }
}

pub struct AuditSink {
    client: Arc<dyn AuditClient>,
    settings: AuditSettings,
    queues: Mutex<HashMap<String, VecDeque<AuditRecord>>>,
    wake: Notify,
    dropped: AtomicU64,
    submitted: AtomicU64,
}

impl AuditSink {
    /// Build the sink and start its flush worker on the current runtime.
    pub fn start(client: Arc<dyn AuditClient>, settings: AuditSettings) -> Arc<Self> {
        let sink = Arc::new(Self {
            client,
            settings,
            queues: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            dropped: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
        });
        tokio::spawn(Self::worker(Arc::downgrade(&sink)));
        info!(
            client = sink.client.name(),
            batch_size = sink.settings.batch_size,
            "audit sink started"
        );
        sink
    }

    /// Queue a record. Never blocks on the audit service.
    pub fn record(&self, record: AuditRecord) {
        let full_batch = {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            let queue = queues.entry(record.event_type.clone()).or_default();
            if queue.len() >= self.settings.queue_bound {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = %record.event_type, "audit queue full; dropped oldest");
            }
            queue.push_back(record);
            queue.len() >= self.settings.batch_size
        };
        if full_batch {
            self.wake.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.values().map(VecDeque::len).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Submit everything queued right now, one batch at a time.
    ///
    /// A failed batch goes back to the front of its queue for the next flush.
    pub async fn flush(&self) {
        let taken: Vec<(String, Vec<AuditRecord>)> = {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            queues
                .iter_mut()
                .filter(|(_, q)| !q.is_empty())
                .map(|(t, q)| (t.clone(), q.drain(..).collect()))
                .collect()
        };

        for (event_type, records) in taken {
            let mut rest = records.into_iter().peekable();
            while rest.peek().is_some() {
                let batch: Vec<AuditRecord> = rest.by_ref().take(self.settings.batch_size).collect();
                let n = batch.len() as u64;
                match self.client.submit(&event_type, batch.clone()).await {
                    Ok(()) => {
                        self.submitted.fetch_add(n, Ordering::Relaxed);
                        debug!(event_type = %event_type, n, "audit batch submitted");
                    }
                    Err(e) => {
                        warn!(event_type = %event_type, n, error = %e, "audit submit failed; requeued");
                        let mut unsent = batch;
                        unsent.extend(rest);
                        self.requeue(&event_type, unsent);
                        break;
                    }
                }
            }
        }
    }

    fn requeue(&self, event_type: &str, unsent: Vec<AuditRecord>) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(event_type.to_string()).or_default();
        for r in unsent.into_iter().rev() {
            queue.push_front(r);
        }
        while queue.len() > self.settings.queue_bound {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn worker(weak: Weak<Self>) {
        loop {
            let Some(sink) = weak.upgrade() else {
                break;
            };
            tokio::select! {
                _ = sink.wake.notified() => {}
                _ = tokio::time::sleep(sink.settings.flush_interval) => {}
            }
            sink.flush().await;
        }
        debug!("audit worker exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<(String, Vec<AuditRecord>)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl AuditClient for Recorder {
        async fn submit(&self, event_type: &str, records: Vec<AuditRecord>) -> Result<(), SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::Transport {
                    sink: "audit",
                    msg: "down".into(),
                });
            }
            self.batches
                .lock()
                .unwrap()
                .push((event_type.to_string(), records));
            Ok(())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    fn settings(batch_size: usize, queue_bound: usize) -> AuditSettings {
        AuditSettings {
            batch_size,
            // Long enough that tests drive flushing themselves.
            flush_interval: Duration::from_secs(3600),
            queue_bound,
        }
    }

    fn rec(event_type: &str, n: usize) -> AuditRecord {
        AuditRecord::new(event_type, "ACCESS", true, "cn=alice").with_info("n", n.to_string())
    }

    #[tokio::test]
    async fn test_batches_per_type_in_fifo_order() {
        let client = Arc::new(Recorder::default());
        let sink = AuditSink::start(client.clone(), settings(2, 100));
        for i in 0..3 {
            sink.record(rec("EventCreate", i));
        }
        sink.record(rec("EventAccess", 0));
        sink.flush().await;

        let batches = client.batches.lock().unwrap().clone();
        let creates: Vec<_> = batches
            .iter()
            .filter(|(t, _)| t == "EventCreate")
            .map(|(_, r)| r.iter().map(|r| r.additional_info["n"].clone()).collect::<Vec<_>>())
            .collect();
        assert_eq!(creates, vec![vec!["0", "1"], vec!["2"]]);
        assert_eq!(batches.iter().filter(|(t, _)| t == "EventAccess").count(), 1);
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.submitted(), 4);
    }

    #[tokio::test]
    async fn test_bound_drops_oldest() {
        let client = Arc::new(Recorder::default());
        let sink = AuditSink::start(client.clone(), settings(100, 2));
        for i in 0..5 {
            sink.record(rec("EventCreate", i));
        }
        assert_eq!(sink.pending(), 2);
        assert_eq!(sink.dropped(), 3);
        sink.flush().await;
        let batches = client.batches.lock().unwrap().clone();
        let kept: Vec<_> = batches[0].1.iter().map(|r| r.additional_info["n"].clone()).collect();
        assert_eq!(kept, vec!["3", "4"]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued() {
        let client = Arc::new(Recorder::default());
        client.fail.store(true, Ordering::SeqCst);
        let sink = AuditSink::start(client.clone(), settings(10, 100));
        sink.record(rec("EventCreate", 0));
        sink.flush().await;
        assert_eq!(sink.pending(), 1);

        client.fail.store(false, Ordering::SeqCst);
        sink.flush().await;
        assert_eq!(sink.pending(), 0);
        assert_eq!(client.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_batch_wakes_worker() {
        let client = Arc::new(Recorder::default());
        let sink = AuditSink::start(client.clone(), settings(2, 100));
        sink.record(rec("EventCreate", 0));
        sink.record(rec("EventCreate", 1));
        for _ in 0..100 {
            if sink.submitted() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.submitted(), 2);
    }

    #[test]
    fn test_record_to_proto() {
        let r = AuditRecord::new("EventCreate", "CREATE", false, "cn=bob")
            .with_object("abcd", "a.txt", r#"{"classif":"U"}"#)
            .with_info("URL", "/objects");
        let p = r.clone().into_proto();
        assert_eq!(p.result, RESULT_FAILURE);
        assert_eq!(p.object_name, "a.txt");
        assert_eq!(p.additional_info.get("URL").map(String::as_str), Some("/objects"));
        assert_eq!(p.created_on, r.created_on.timestamp_millis());
    }
}
