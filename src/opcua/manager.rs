//! Multi-server session manager
//!
//! Owns the map from server id to session, fans connects and disconnects
//! out concurrently, and aggregates per-server connection states into the
//! single UI-visible state. Per-server state changes are forwarded on a
//! broadcast channel shared by all sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::opcua::session::{ConnectionState, ReconnectPolicy, ServerSession, StateChange};
use crate::opcua::transport::{SessionOptions, UaTransport};
use crate::queue::SampleQueue;

/// Outcome of a `connect_all` fan-out; partial success is the expected case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectSummary {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
}

/// Per-server row of the status snapshot
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    pub samples_received: u64,
    pub last_sample: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Session defaults applied where a server carries no override
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub session_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
}

pub struct ServerManager {
    transport: Arc<dyn UaTransport>,
    queue: Arc<SampleQueue>,
    defaults: SessionDefaults,
    policy: ReconnectPolicy,
    servers: RwLock<HashMap<String, Arc<ServerSession>>>,
    state_events: broadcast::Sender<StateChange>,
    shutdown: watch::Receiver<bool>,
}

impl ServerManager {
    pub fn new(
        transport: Arc<dyn UaTransport>,
        queue: Arc<SampleQueue>,
        defaults: SessionDefaults,
        policy: ReconnectPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state_events, _) = broadcast::channel(256);
        Self {
            transport,
            queue,
            defaults,
            policy,
            servers: RwLock::new(HashMap::new()),
            state_events,
            shutdown,
        }
    }

    /// Subscribe to per-server state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_events.subscribe()
    }

    fn options_for(&self, config: &ServerConfig) -> SessionOptions {
        SessionOptions {
            session_timeout_ms: config
                .session_timeout_ms
                .unwrap_or(self.defaults.session_timeout_ms),
            keepalive_interval_ms: config
                .keepalive_interval_ms
                .unwrap_or(self.defaults.keepalive_interval_ms),
        }
    }

    /// Fetch or create the session for a config. Creation does not connect.
    async fn ensure_session(&self, config: &ServerConfig) -> Arc<ServerSession> {
        let mut servers = self.servers.write().await;
        if let Some(session) = servers.get(&config.id) {
            return Arc::clone(session);
        }
        let session = ServerSession::new(
            config.clone(),
            self.options_for(config),
            self.policy.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.queue),
            self.state_events.clone(),
            self.shutdown.clone(),
        );
        servers.insert(config.id.clone(), Arc::clone(&session));
        session
    }

    /// Connect every enabled, valid server concurrently. Individual
    /// failures are logged and do not cancel the others; already-Connected
    /// sessions are left untouched.
    pub async fn connect_all(&self, configs: &[ServerConfig]) -> ConnectSummary {
        let mut pending = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            if let Err(e) = config.validate() {
                warn!(server = %config.id, error = %e, "rejecting invalid server config");
                continue;
            }
            let session = self.ensure_session(config).await;
            pending.push(async move {
                let id = session.id().to_string();
                (id, Arc::clone(&session).connect().await)
            });
        }

        let attempted = pending.len();
        let mut connected = 0;
        for (id, result) in join_all(pending).await {
            match result {
                Ok(()) => connected += 1,
                Err(e) => warn!(server = %id, error = %e, "server connect failed"),
            }
        }
        let summary = ConnectSummary {
            attempted,
            connected,
            failed: attempted - connected,
        };
        info!(
            attempted = summary.attempted,
            connected = summary.connected,
            failed = summary.failed,
            "server connect fan-out complete"
        );
        summary
    }

    /// Idempotent add-and-connect. A no-op when the id is already Connected.
    pub async fn add_server(&self, config: ServerConfig) -> Result<()> {
        config.validate()?;
        if !config.enabled {
            return Ok(());
        }
        let session = self.ensure_session(&config).await;
        if session.state() == ConnectionState::Connected {
            return Ok(());
        }
        session.connect().await
    }

    /// Tear down and drop one server. Silently ignores unknown ids.
    pub async fn remove_server(&self, id: &str) {
        let removed = self.servers.write().await.remove(id);
        if let Some(session) = removed {
            session.disconnect().await;
            info!(server = %id, "server removed");
        }
    }

    /// Fan-out disconnect; awaits all sessions.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<ServerSession>> =
            self.servers.read().await.values().cloned().collect();
        join_all(sessions.iter().map(|s| s.disconnect())).await;
    }

    /// Worst state across all sessions, by severity. An empty manager
    /// reports Disconnected.
    pub async fn aggregate_state(&self) -> ConnectionState {
        self.servers
            .read()
            .await
            .values()
            .map(|s| s.state())
            .max_by_key(|s| s.severity())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Status rows for the snapshot, sorted by server id.
    pub async fn server_statuses(&self) -> Vec<ServerStatus> {
        let servers = self.servers.read().await;
        let mut statuses: Vec<ServerStatus> = servers
            .values()
            .map(|session| {
                let stats = session.stats();
                ServerStatus {
                    id: session.id().to_string(),
                    name: session.config().display_name().to_string(),
                    state: stats.state,
                    samples_received: stats.samples_received,
                    last_sample: stats.last_sample,
                    last_error: stats.last_error,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub async fn server_count(&self) -> usize {
        self.servers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionDef;
    use crate::opcua::mock::MockTransport;
    use crate::sample::Value;
    use std::time::Duration;

    fn server(id: &str, endpoint: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            name: String::new(),
            endpoint_url: endpoint.to_string(),
            enabled: true,
            session_timeout_ms: None,
            keepalive_interval_ms: None,
            subscriptions: vec![SubscriptionDef {
                node_id: format!("ns=2;s={}.Value", id),
                display_name: "Value".to_string(),
                browse_path: format!("Plant/{}/Value", id),
                sampling_interval_ms: 100,
                publishing_interval_ms: 500,
                queue_size: 10,
                discard_oldest: true,
                enabled: true,
            }],
        }
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        queue: Arc<SampleQueue>,
        manager: ServerManager,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let queue = Arc::new(SampleQueue::new(128));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = ServerManager::new(
            Arc::clone(&transport) as Arc<dyn UaTransport>,
            Arc::clone(&queue),
            SessionDefaults {
                session_timeout_ms: 60_000,
                keepalive_interval_ms: 5_000,
            },
            ReconnectPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
            },
            shutdown_rx,
        );
        Fixture {
            transport,
            queue,
            manager,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_connect_all_partial_success() {
        let fx = fixture();
        fx.transport.fail_next_connects("opc.tcp://b:4840", 10);

        let configs = vec![
            server("srv-a", "opc.tcp://a:4840"),
            server("srv-b", "opc.tcp://b:4840"),
        ];
        let summary = fx.manager.connect_all(&configs).await;

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.connected, 1);
        assert_eq!(summary.failed, 1);
        // The failing sibling did not cancel the healthy one
        assert_eq!(fx.transport.connect_count("opc.tcp://a:4840"), 1);
    }

    #[tokio::test]
    async fn test_connect_all_twice_is_stable() {
        let fx = fixture();
        let configs = vec![
            server("srv-a", "opc.tcp://a:4840"),
            server("srv-b", "opc.tcp://b:4840"),
        ];

        let first = fx.manager.connect_all(&configs).await;
        let second = fx.manager.connect_all(&configs).await;

        assert_eq!(first.connected, 2);
        assert_eq!(second.connected, 2);
        assert_eq!(fx.manager.server_count().await, 2);
        // Already-connected sessions are not re-established
        assert_eq!(fx.transport.connect_count("opc.tcp://a:4840"), 1);
        assert_eq!(fx.transport.connect_count("opc.tcp://b:4840"), 1);
    }

    #[tokio::test]
    async fn test_disabled_and_invalid_servers_skipped() {
        let fx = fixture();
        let mut disabled = server("srv-off", "opc.tcp://off:4840");
        disabled.enabled = false;
        let invalid = server("", "opc.tcp://nameless:4840");

        let summary = fx
            .manager
            .connect_all(&[disabled, invalid, server("srv-a", "opc.tcp://a:4840")])
            .await;

        assert_eq!(summary.attempted, 1);
        assert_eq!(fx.manager.server_count().await, 1);
    }

    #[tokio::test]
    async fn test_samples_carry_right_server_id() {
        let fx = fixture();
        fx.manager
            .connect_all(&[
                server("srv-a", "opc.tcp://a:4840"),
                server("srv-b", "opc.tcp://b:4840"),
            ])
            .await;

        for (endpoint, node) in [
            ("opc.tcp://a:4840", "ns=2;s=srv-a.Value"),
            ("opc.tcp://b:4840", "ns=2;s=srv-b.Value"),
        ] {
            let handle = fx.transport.session(endpoint).unwrap();
            for n in 0..3 {
                handle.emit_value(node, Value::Int32(n)).await;
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut by_server: HashMap<String, usize> = HashMap::new();
        while let Some(sample) = fx.queue.try_pop() {
            assert!(sample.node_id.contains(&sample.server_id));
            *by_server.entry(sample.server_id).or_insert(0) += 1;
        }
        assert_eq!(by_server.get("srv-a"), Some(&3));
        assert_eq!(by_server.get("srv-b"), Some(&3));
    }

    #[tokio::test]
    async fn test_aggregate_state_worst_wins() {
        let fx = fixture();
        assert_eq!(fx.manager.aggregate_state().await, ConnectionState::Disconnected);

        fx.transport.fail_next_connects("opc.tcp://b:4840", 10);
        fx.manager
            .connect_all(&[
                server("srv-a", "opc.tcp://a:4840"),
                server("srv-b", "opc.tcp://b:4840"),
            ])
            .await;

        // srv-a Connected, srv-b Error: the aggregate reflects the worst
        assert_eq!(fx.manager.aggregate_state().await, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_add_server_idempotent() {
        let fx = fixture();
        let config = server("srv-a", "opc.tcp://a:4840");

        fx.manager.add_server(config.clone()).await.unwrap();
        fx.manager.add_server(config).await.unwrap();

        assert_eq!(fx.manager.server_count().await, 1);
        assert_eq!(fx.transport.connect_count("opc.tcp://a:4840"), 1);
    }

    #[tokio::test]
    async fn test_remove_server_tears_down() {
        let fx = fixture();
        fx.manager
            .add_server(server("srv-a", "opc.tcp://a:4840"))
            .await
            .unwrap();
        let handle = fx.transport.session("opc.tcp://a:4840").unwrap();

        fx.manager.remove_server("srv-a").await;
        assert_eq!(fx.manager.server_count().await, 0);
        assert!(handle.is_closed());

        // Unknown id is silently ignored
        fx.manager.remove_server("srv-a").await;
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let fx = fixture();
        fx.manager
            .connect_all(&[
                server("srv-a", "opc.tcp://a:4840"),
                server("srv-b", "opc.tcp://b:4840"),
            ])
            .await;

        fx.manager.disconnect_all().await;
        assert_eq!(fx.manager.aggregate_state().await, ConnectionState::Disconnected);
        for status in fx.manager.server_statuses().await {
            assert_eq!(status.state, ConnectionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_state_change_events_forwarded() {
        let fx = fixture();
        let mut events = fx.manager.subscribe();

        fx.manager
            .add_server(server("srv-a", "opc.tcp://a:4840"))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.server_id, "srv-a");
        assert_eq!(first.from, ConnectionState::Disconnected);
        assert_eq!(first.to, ConnectionState::Connecting);

        let second = events.recv().await.unwrap();
        assert_eq!(second.from, ConnectionState::Connecting);
        assert_eq!(second.to, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_server_statuses_sorted() {
        let fx = fixture();
        fx.manager
            .connect_all(&[
                server("srv-c", "opc.tcp://c:4840"),
                server("srv-a", "opc.tcp://a:4840"),
            ])
            .await;

        let statuses = fx.manager.server_statuses().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "srv-a");
        assert_eq!(statuses[1].id, "srv-c");
    }
}
