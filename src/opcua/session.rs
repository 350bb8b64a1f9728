//! Per-endpoint OPC UA session
//!
//! Owns everything under one endpoint: the transport session, the stored
//! subscription definitions, the notification pump, and the reconnect loop.
//!
//! State machine: Disconnected -> Connecting -> Connected; a bad keepalive
//! or a session close moves Connected -> Reconnecting, where capped
//! exponential backoff retries until success or cancellation. `disconnect`
//! tears everything down from any state.
//!
//! The notification path does no I/O beyond the non-blocking queue publish
//! and atomic counter updates.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, SubscriptionDef};
use crate::error::Result;
use crate::opcua::transport::{
    EventStream, MonitoredItemRequest, SessionEvent, SessionOptions, UaSession, UaTransport,
    ValueUpdate,
};
use crate::queue::SampleQueue;
use crate::sample::{quality_label, Sample};

/// Connection state of one server session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }

    /// Priority for the aggregated worst-state view: the most concerning
    /// state wins.
    pub fn severity(&self) -> u8 {
        match self {
            ConnectionState::Connected => 0,
            ConnectionState::Disconnected => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Error => 4,
        }
    }
}

/// Per-server state transition, fanned out to the supervisor
#[derive(Debug, Clone)]
pub struct StateChange {
    pub server_id: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
}

/// Exponential reconnect backoff: doubling from `initial`, capped at `max`,
/// unbounded attempts until cancelled.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }
}

/// Counter snapshot for the status surface
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub samples_received: u64,
    pub last_sample: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct ServerSession {
    config: ServerConfig,
    options: SessionOptions,
    policy: ReconnectPolicy,
    transport: Arc<dyn UaTransport>,
    queue: Arc<SampleQueue>,
    state: Mutex<ConnectionState>,
    /// Stored subscription list; replaced atomically by `subscribe`, read
    /// under a short guard by the notification handler
    subscriptions: RwLock<Vec<SubscriptionDef>>,
    session: tokio::sync::Mutex<Option<Box<dyn UaSession>>>,
    samples_received: AtomicU64,
    last_sample_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
    state_events: broadcast::Sender<StateChange>,
    shutdown: watch::Receiver<bool>,
    /// Set by `disconnect`; stops pumps and reconnect loops
    closed: AtomicBool,
    /// Incremented per established session so stale pumps cannot trigger a
    /// reconnect of their successor
    generation: AtomicU64,
}

impl ServerSession {
    pub fn new(
        config: ServerConfig,
        options: SessionOptions,
        policy: ReconnectPolicy,
        transport: Arc<dyn UaTransport>,
        queue: Arc<SampleQueue>,
        state_events: broadcast::Sender<StateChange>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let subscriptions = config.subscriptions.clone();
        Arc::new(Self {
            config,
            options,
            policy,
            transport,
            queue,
            state: Mutex::new(ConnectionState::Disconnected),
            subscriptions: RwLock::new(subscriptions),
            session: tokio::sync::Mutex::new(None),
            samples_received: AtomicU64::new(0),
            last_sample_ms: AtomicI64::new(0),
            last_error: Mutex::new(None),
            state_events,
            shutdown,
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn stats(&self) -> SessionStats {
        let ms = self.last_sample_ms.load(Ordering::Relaxed);
        SessionStats {
            state: self.state(),
            samples_received: self.samples_received.load(Ordering::Relaxed),
            last_sample: (ms > 0).then(|| Utc.timestamp_millis_opt(ms).single()).flatten(),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.lock().unwrap();
            let from = *state;
            if from == to {
                return;
            }
            *state = to;
            from
        };
        debug!(server = %self.config.id, from = from.as_str(), to = to.as_str(), "session state");
        let _ = self.state_events.send(StateChange {
            server_id: self.config.id.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock().unwrap() = Some(message);
    }

    /// Establish the session and apply the stored subscriptions.
    ///
    /// A no-op when already Connected. On failure the session lands in
    /// Error and the caller may retry.
    pub async fn connect(self: Arc<Self>) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            debug!(server = %self.config.id, "already connected");
            return Ok(());
        }
        self.closed.store(false, Ordering::Release);
        self.set_state(ConnectionState::Connecting);

        match self
            .transport
            .connect(&self.config.endpoint_url, &self.options)
            .await
        {
            Ok((session, events)) => {
                *self.session.lock().await = Some(session);
                if let Err(e) = self.apply_stored_subscription().await {
                    self.record_error(e.to_string());
                    self.set_state(ConnectionState::Error);
                    return Err(e);
                }
                self.set_state(ConnectionState::Connected);
                info!(server = %self.config.id, endpoint = %self.config.endpoint_url, "session established");
                self.spawn_pump(events);
                Ok(())
            }
            Err(e) => {
                self.record_error(e.to_string());
                self.set_state(ConnectionState::Error);
                warn!(server = %self.config.id, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Replace the stored subscription list and apply it to the live
    /// session, if any. The requested publishing interval is the minimum
    /// over the supplied definitions.
    pub async fn subscribe(&self, defs: Vec<SubscriptionDef>) -> Result<()> {
        *self.subscriptions.write().unwrap() = defs;
        self.apply_stored_subscription().await
    }

    async fn apply_stored_subscription(&self) -> Result<()> {
        let request = {
            let defs = self.subscriptions.read().unwrap();
            let enabled: Vec<&SubscriptionDef> = defs.iter().filter(|d| d.enabled).collect();
            if enabled.is_empty() {
                None
            } else {
                let publishing = enabled
                    .iter()
                    .map(|d| d.publishing_interval_ms)
                    .min()
                    .unwrap_or(1_000);
                let items = enabled
                    .iter()
                    .map(|d| MonitoredItemRequest {
                        node_id: d.node_id.clone(),
                        sampling_interval_ms: d.sampling_interval_ms,
                        queue_size: d.queue_size,
                        discard_oldest: d.discard_oldest,
                    })
                    .collect::<Vec<_>>();
                Some((publishing, items))
            }
        };
        let Some((publishing, items)) = request else {
            return Ok(());
        };

        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) => {
                debug!(
                    server = %self.config.id,
                    items = items.len(),
                    publishing_interval_ms = publishing,
                    "applying subscription"
                );
                session.apply_subscription(publishing, items).await
            }
            // Applied on the next connect
            None => Ok(()),
        }
    }

    fn spawn_pump(self: Arc<Self>, events: EventStream) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tokio::spawn(async move { self.pump(generation, events).await });
    }

    /// Consume session events until the session dies or shutdown fires.
    async fn pump(self: Arc<Self>, generation: u64, mut events: EventStream) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::DataChange(updates)) => self.handle_data_change(updates),
                    Some(SessionEvent::KeepAliveFailed { status_code }) => {
                        warn!(server = %self.config.id, status_code, "keepalive failed");
                        self.record_error(format!("keepalive failed with status {status_code:#010x}"));
                        self.begin_reconnect(generation);
                        return;
                    }
                    Some(SessionEvent::SessionClosed { reason }) => {
                        if self.closed.load(Ordering::Acquire) {
                            return;
                        }
                        warn!(server = %self.config.id, reason = %reason, "session closed");
                        self.record_error(format!("session closed: {reason}"));
                        self.begin_reconnect(generation);
                        return;
                    }
                    None => {
                        if self.closed.load(Ordering::Acquire) || *shutdown.borrow() {
                            return;
                        }
                        self.begin_reconnect(generation);
                        return;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Build and publish samples for one notification. Browse paths are
    /// looked up from the stored definitions under a short read guard; on a
    /// miss the node id stands in.
    fn handle_data_change(&self, updates: Vec<ValueUpdate>) {
        let received_at = Utc::now();

        let resolved: Vec<(ValueUpdate, String, String)> = {
            let defs = self.subscriptions.read().unwrap();
            updates
                .into_iter()
                .map(|update| {
                    let (display_name, browse_path) =
                        match defs.iter().find(|d| d.node_id == update.node_id) {
                            Some(def) => {
                                let name = if def.display_name.is_empty() {
                                    update.node_id.clone()
                                } else {
                                    def.display_name.clone()
                                };
                                let path = if def.browse_path.is_empty() {
                                    name.clone()
                                } else {
                                    def.browse_path.clone()
                                };
                                (name, path)
                            }
                            None => (update.node_id.clone(), update.node_id.clone()),
                        };
                    (update, display_name, browse_path)
                })
                .collect()
        };

        for (update, display_name, browse_path) in resolved {
            let data_type = if update.data_type.is_empty() {
                update.value.type_name().to_string()
            } else {
                update.data_type
            };
            let sample = Sample {
                server_id: self.config.id.clone(),
                server_name: self.config.display_name().to_string(),
                timestamp_utc: received_at,
                node_id: update.node_id,
                display_name,
                browse_path,
                data_type,
                value: update.value,
                status_code: update.status_code,
                quality: quality_label(update.status_code).to_string(),
                source_timestamp: update.source_timestamp,
                server_timestamp: update.server_timestamp,
            };
            if self.queue.publish(sample) {
                self.samples_received.fetch_add(1, Ordering::Relaxed);
                self.last_sample_ms
                    .store(received_at.timestamp_millis(), Ordering::Relaxed);
            }
        }
    }

    fn begin_reconnect(self: Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        if self.closed.load(Ordering::Acquire) || *self.shutdown.borrow() {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        tokio::spawn(async move { self.reconnect_loop().await });
    }

    /// Backoff-and-retry until the endpoint comes back or we are cancelled.
    /// Always reconnects against the configured endpoint URL.
    async fn reconnect_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut attempt: u32 = 0;
        loop {
            if self.closed.load(Ordering::Acquire) || *shutdown.borrow() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            let delay = self.policy.delay(attempt);
            info!(server = %self.config.id, attempt = attempt + 1, ?delay, "reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
            if self.closed.load(Ordering::Acquire) {
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            match self
                .transport
                .connect(&self.config.endpoint_url, &self.options)
                .await
            {
                Ok((session, events)) => {
                    *self.session.lock().await = Some(session);
                    if let Err(e) = self.apply_stored_subscription().await {
                        warn!(server = %self.config.id, error = %e, "re-subscription failed");
                        self.record_error(e.to_string());
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    self.set_state(ConnectionState::Connected);
                    info!(server = %self.config.id, "reconnected");
                    self.spawn_pump(events);
                    return;
                }
                Err(e) => {
                    debug!(server = %self.config.id, error = %e, "reconnect attempt failed");
                    self.record_error(e.to_string());
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Tear down the subscription and session. Idempotent.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcua::mock::MockTransport;
    use crate::sample::Value;

    const ENDPOINT: &str = "opc.tcp://mock:4840";

    fn sub(node_id: &str, display_name: &str, browse_path: &str, publishing: u64) -> SubscriptionDef {
        SubscriptionDef {
            node_id: node_id.to_string(),
            display_name: display_name.to_string(),
            browse_path: browse_path.to_string(),
            sampling_interval_ms: 100,
            publishing_interval_ms: publishing,
            queue_size: 10,
            discard_oldest: true,
            enabled: true,
        }
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        queue: Arc<SampleQueue>,
        session: Arc<ServerSession>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn fixture(subscriptions: Vec<SubscriptionDef>) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let queue = Arc::new(SampleQueue::new(128));
        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = ServerConfig {
            id: "srv-a".to_string(),
            name: "Line A".to_string(),
            endpoint_url: ENDPOINT.to_string(),
            enabled: true,
            session_timeout_ms: None,
            keepalive_interval_ms: None,
            subscriptions,
        };
        let session = ServerSession::new(
            config,
            SessionOptions {
                session_timeout_ms: 60_000,
                keepalive_interval_ms: 5_000,
            },
            ReconnectPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
            },
            Arc::clone(&transport) as Arc<dyn UaTransport>,
            Arc::clone(&queue),
            events,
            shutdown_rx,
        );
        Fixture {
            transport,
            queue,
            session,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_connect_applies_subscription() {
        let fx = fixture(vec![
            sub("ns=2;s=A", "A", "Plant/A", 500),
            sub("ns=2;s=B", "B", "Plant/B", 200),
        ]);
        Arc::clone(&fx.session).connect().await.unwrap();
        assert_eq!(fx.session.state(), ConnectionState::Connected);

        let handle = fx.transport.session(ENDPOINT).unwrap();
        let (publishing, items) = handle.subscription().unwrap();
        // Minimum publishing interval across the definitions
        assert_eq!(publishing, 200);
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_idempotent() {
        let fx = fixture(vec![sub("ns=2;s=A", "A", "Plant/A", 500)]);
        Arc::clone(&fx.session).connect().await.unwrap();
        Arc::clone(&fx.session).connect().await.unwrap();
        assert_eq!(fx.transport.connect_count(ENDPOINT), 1);
    }

    #[tokio::test]
    async fn test_notification_builds_sample() {
        let fx = fixture(vec![sub("ns=2;s=Temp", "Temperature", "Plant/Line1/Temp", 500)]);
        Arc::clone(&fx.session).connect().await.unwrap();

        let handle = fx.transport.session(ENDPOINT).unwrap();
        handle.emit_value("ns=2;s=Temp", Value::Double(21.5)).await;

        assert!(fx.queue.wait_non_empty(Duration::from_secs(1)).await);
        let sample = fx.queue.try_pop().unwrap();
        assert_eq!(sample.server_id, "srv-a");
        assert_eq!(sample.server_name, "Line A");
        assert_eq!(sample.node_id, "ns=2;s=Temp");
        assert_eq!(sample.display_name, "Temperature");
        assert_eq!(sample.browse_path, "Plant/Line1/Temp");
        assert_eq!(sample.value, Value::Double(21.5));
        assert_eq!(sample.quality, "good");
        assert!(sample.source_timestamp.is_some());

        let stats = fx.session.stats();
        assert_eq!(stats.samples_received, 1);
        assert!(stats.last_sample.is_some());
    }

    #[tokio::test]
    async fn test_unknown_node_falls_back_to_node_id() {
        let fx = fixture(vec![sub("ns=2;s=Known", "Known", "Plant/Known", 500)]);
        Arc::clone(&fx.session).connect().await.unwrap();

        let handle = fx.transport.session(ENDPOINT).unwrap();
        handle.emit_value("ns=2;s=Surprise", Value::Int32(1)).await;

        assert!(fx.queue.wait_non_empty(Duration::from_secs(1)).await);
        let sample = fx.queue.try_pop().unwrap();
        assert_eq!(sample.display_name, "ns=2;s=Surprise");
        assert_eq!(sample.browse_path, "ns=2;s=Surprise");
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error_state() {
        let fx = fixture(vec![sub("ns=2;s=A", "A", "Plant/A", 500)]);
        fx.transport.fail_next_connects(ENDPOINT, 1);

        assert!(Arc::clone(&fx.session).connect().await.is_err());
        assert_eq!(fx.session.state(), ConnectionState::Error);
        assert!(fx.session.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn test_keepalive_failure_triggers_reconnect_with_backoff() {
        let fx = fixture(vec![sub("ns=2;s=A", "A", "Plant/A", 500)]);
        Arc::clone(&fx.session).connect().await.unwrap();

        // Two reconnect attempts fail, the third succeeds
        fx.transport.fail_next_connects(ENDPOINT, 2);
        let handle = fx.transport.session(ENDPOINT).unwrap();
        handle.fail_keepalive(0x8086_0000).await;

        // Backoff is 10 ms, 20 ms, 40 ms with the test policy
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fx.session.state(), ConnectionState::Connected);
        assert_eq!(fx.transport.connect_count(ENDPOINT), 2);

        // The re-established session carries the stored subscription
        let handle = fx.transport.session(ENDPOINT).unwrap();
        assert!(handle.subscription().is_some());

        // And notifications flow again
        handle.emit_value("ns=2;s=A", Value::Bool(true)).await;
        assert!(fx.queue.wait_non_empty(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_session_closed_triggers_reconnect() {
        let fx = fixture(vec![sub("ns=2;s=A", "A", "Plant/A", 500)]);
        Arc::clone(&fx.session).connect().await.unwrap();

        let handle = fx.transport.session(ENDPOINT).unwrap();
        handle.close_session("server shutdown").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.session.state(), ConnectionState::Connected);
        assert_eq!(fx.transport.connect_count(ENDPOINT), 2);
    }

    #[tokio::test]
    async fn test_disconnect_tears_down() {
        let fx = fixture(vec![sub("ns=2;s=A", "A", "Plant/A", 500)]);
        Arc::clone(&fx.session).connect().await.unwrap();

        let handle = fx.transport.session(ENDPOINT).unwrap();
        fx.session.disconnect().await;

        assert_eq!(fx.session.state(), ConnectionState::Disconnected);
        assert!(handle.is_closed());

        // A close event arriving after disconnect does not resurrect it
        handle.close_session("late event").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.session.state(), ConnectionState::Disconnected);
        assert_eq!(fx.transport.connect_count(ENDPOINT), 1);
    }

    #[tokio::test]
    async fn test_subscribe_replaces_definitions() {
        let fx = fixture(vec![sub("ns=2;s=A", "A", "Plant/A", 500)]);
        Arc::clone(&fx.session).connect().await.unwrap();

        fx.session
            .subscribe(vec![sub("ns=2;s=B", "B", "Plant/B", 100)])
            .await
            .unwrap();

        let handle = fx.transport.session(ENDPOINT).unwrap();
        let (publishing, items) = handle.subscription().unwrap();
        assert_eq!(publishing, 100);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].node_id, "ns=2;s=B");
    }

    #[test]
    fn test_reconnect_policy_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(4), Duration::from_secs(60));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_state_severity_ordering() {
        assert!(ConnectionState::Error.severity() > ConnectionState::Reconnecting.severity());
        assert!(ConnectionState::Reconnecting.severity() > ConnectionState::Connecting.severity());
        assert!(ConnectionState::Connecting.severity() > ConnectionState::Disconnected.severity());
        assert!(ConnectionState::Disconnected.severity() > ConnectionState::Connected.severity());
    }
}
