//! Transport seam for the OPC UA client stack
//!
//! A `UaTransport` establishes sessions against one endpoint at a time and
//! hands back a command handle (`UaSession`) plus a stream of session
//! events. Data changes, keepalive verdicts, and session teardown all arrive
//! through that stream, which keeps the acquisition state machine
//! independent of any particular wire binding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::sample::Value;

/// Session-level parameters resolved from config defaults and per-server
/// overrides
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
}

/// One monitored item as requested on the server
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemRequest {
    pub node_id: String,
    pub sampling_interval_ms: u64,
    /// Server-side queue depth for this item
    pub queue_size: u32,
    pub discard_oldest: bool,
}

/// A dequeued monitored-item value as delivered by the wire stack
#[derive(Debug, Clone)]
pub struct ValueUpdate {
    pub node_id: String,
    pub value: Value,
    /// Declared data type name; empty means derive from the value
    pub data_type: String,
    pub status_code: u32,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Events emitted by an established session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// One publish response worth of dequeued values
    DataChange(Vec<ValueUpdate>),
    /// Keepalive reported an invalid session, closed connection, or
    /// communication error
    KeepAliveFailed { status_code: u32 },
    /// The server or the stack closed the session
    SessionClosed { reason: String },
}

pub type EventStream = mpsc::Receiver<SessionEvent>;

/// Factory for sessions against a single endpoint.
#[async_trait]
pub trait UaTransport: Send + Sync + 'static {
    /// Establish a session. The returned stream ends when the session dies;
    /// a `SessionClosed` or `KeepAliveFailed` event usually precedes that.
    async fn connect(
        &self,
        endpoint_url: &str,
        options: &SessionOptions,
    ) -> Result<(Box<dyn UaSession>, EventStream)>;
}

/// Command handle for one established session.
#[async_trait]
pub trait UaSession: Send + Sync {
    /// Replace the session's subscription with the given monitored items at
    /// the given publishing interval.
    async fn apply_subscription(
        &self,
        publishing_interval_ms: u64,
        items: Vec<MonitoredItemRequest>,
    ) -> Result<()>;

    /// Tear the session down. Idempotent.
    async fn close(&self);
}
