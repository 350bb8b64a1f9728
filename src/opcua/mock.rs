//! Scripted in-memory transport
//!
//! Stands in for a wire OPC UA stack in tests and in the `check`
//! connectivity dry-run. Tests drive connected sessions through
//! [`MockSessionHandle`]: inject data changes, fail keepalives, close
//! sessions, and script connect failures per endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::{Result, SiphonError};
use crate::opcua::transport::{
    EventStream, MonitoredItemRequest, SessionEvent, SessionOptions, UaSession, UaTransport,
    ValueUpdate,
};
use crate::sample::Value;

type StoredSubscription = Option<(u64, Vec<MonitoredItemRequest>)>;

/// Driver handle for one scripted session
#[derive(Clone)]
pub struct MockSessionHandle {
    tx: mpsc::Sender<SessionEvent>,
    subscription: Arc<Mutex<StoredSubscription>>,
    closed: Arc<AtomicBool>,
}

impl MockSessionHandle {
    /// Inject a single good-quality value change.
    pub async fn emit_value(&self, node_id: &str, value: Value) {
        self.emit_update(ValueUpdate {
            node_id: node_id.to_string(),
            data_type: value.type_name().to_string(),
            value,
            status_code: 0,
            source_timestamp: Some(Utc::now()),
            server_timestamp: None,
        })
        .await;
    }

    /// Inject a fully specified value update.
    pub async fn emit_update(&self, update: ValueUpdate) {
        let _ = self.tx.send(SessionEvent::DataChange(vec![update])).await;
    }

    /// Script a bad keepalive, which the session reacts to by reconnecting.
    pub async fn fail_keepalive(&self, status_code: u32) {
        let _ = self
            .tx
            .send(SessionEvent::KeepAliveFailed { status_code })
            .await;
    }

    /// Script a server-side session close.
    pub async fn close_session(&self, reason: &str) {
        let _ = self
            .tx
            .send(SessionEvent::SessionClosed {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Last subscription applied to this session, if any.
    pub fn subscription(&self) -> StoredSubscription {
        self.subscription.lock().unwrap().clone()
    }

    /// Whether `close` has been called on the session handle.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct MockSession {
    handle: MockSessionHandle,
}

#[async_trait]
impl UaSession for MockSession {
    async fn apply_subscription(
        &self,
        publishing_interval_ms: u64,
        items: Vec<MonitoredItemRequest>,
    ) -> Result<()> {
        *self.handle.subscription.lock().unwrap() = Some((publishing_interval_ms, items));
        Ok(())
    }

    async fn close(&self) {
        self.handle.closed.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct MockInner {
    /// Remaining scripted connect failures per endpoint
    fail_connects: HashMap<String, u32>,
    /// Latest session handle per endpoint
    sessions: HashMap<String, MockSessionHandle>,
    connect_counts: HashMap<String, u32>,
}

/// Scripted transport; endpoints connect successfully unless told otherwise.
#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts against `endpoint` fail.
    pub fn fail_next_connects(&self, endpoint: &str, n: u32) {
        self.inner
            .lock()
            .unwrap()
            .fail_connects
            .insert(endpoint.to_string(), n);
    }

    /// Number of successful connects against `endpoint`.
    pub fn connect_count(&self, endpoint: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .connect_counts
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Driver handle for the latest session on `endpoint`.
    pub fn session(&self, endpoint: &str) -> Option<MockSessionHandle> {
        self.inner.lock().unwrap().sessions.get(endpoint).cloned()
    }
}

#[async_trait]
impl UaTransport for MockTransport {
    async fn connect(
        &self,
        endpoint_url: &str,
        _options: &SessionOptions,
    ) -> Result<(Box<dyn UaSession>, EventStream)> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(remaining) = inner.fail_connects.get_mut(endpoint_url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SiphonError::Transport(format!(
                    "connection refused by {} (scripted)",
                    endpoint_url
                )));
            }
        }

        *inner
            .connect_counts
            .entry(endpoint_url.to_string())
            .or_insert(0) += 1;

        let (tx, rx) = mpsc::channel(256);
        let handle = MockSessionHandle {
            tx,
            subscription: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        inner
            .sessions
            .insert(endpoint_url.to_string(), handle.clone());

        Ok((Box::new(MockSession { handle }), rx))
    }
}
