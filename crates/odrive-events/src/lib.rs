//! odrive-events: fire-and-forget sinks for request outcomes.
//!
//! - [`AuditSink`] queues audit records per event type and a background
//!   worker submits them in batches to the audit service.
//! - [`EventSink`] publishes one JSON event per user-visible action to a
//!   NATS subject, filtered by configured success/failure action names.
//!
//! Neither sink ever blocks or fails a request: overflow is dropped and
//! counted, transport errors are logged.

pub mod audit;
pub mod event;

pub use audit::{AuditClient, AuditRecord, AuditSettings, AuditSink, GrpcAuditClient, LogAuditClient};
pub use event::{ActionFilter, EventSink, NatsPublisher, ObjectEvent, Publisher};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("{sink} transport error: {msg}")]
    Transport { sink: &'static str, msg: String },

    #[error("{sink} rejected submission: {}", messages.join("/"))]
    Rejected {
        sink: &'static str,
        messages: Vec<String>,
    },

    #[error("serializing event: {0}")]
    Serialize(#[from] serde_json::Error),
}
