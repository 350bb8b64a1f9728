//! Supervisor: wiring and lifetime
//!
//! Builds the pipeline from a configuration snapshot, owns every worker
//! task, and exposes the control surface: `start`, `stop`, `snapshot`,
//! `force_mode`. Health events drive the coordinator's mode; any transition
//! to Healthy also triggers a recovery pass over pending fallback files.
//!
//! Shutdown is ordered: stop the health monitor and the recovery worker,
//! disconnect the sessions, close the ingress queue, and only then signal
//! the coordinator to drain. The coordinator runs on its own shutdown
//! channel so it keeps consuming while the producers wind down; its final
//! drain cannot start until nothing can publish anymore, which is what
//! guarantees no residual sample is stranded in the queue.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use mongodb::options::ClientOptions;
use mongodb::Client;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::AgentConfig;
use crate::coordinator::{
    CoordinatorConfig, CoordinatorStats, ModeOverride, PersistenceCoordinator, PersistenceMode,
};
use crate::error::{Result, SiphonError};
use crate::health::{Health, HealthConfig, HealthEvent, HealthMonitor};
use crate::opcua::manager::{ServerManager, SessionDefaults};
use crate::opcua::session::{ConnectionState, ReconnectPolicy};
use crate::opcua::transport::UaTransport;
use crate::queue::{QueueStats, SampleQueue};
use crate::recovery::RecoveryWorker;
use crate::sink::{FallbackSink, MongoProbe, MongoSink, MongoSinkConfig, SampleSink};

/// Copy of the aggregated runtime state for hosts and dashboards
#[derive(Debug, Clone)]
pub struct RuntimeSnapshot {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub health: Health,
    pub mode: PersistenceMode,
    pub circuit: Option<CircuitState>,
    pub aggregate_state: ConnectionState,
    pub servers: Vec<crate::opcua::manager::ServerStatus>,
    pub queue: QueueStats,
    pub persistence: CoordinatorStats,
    pub pending_fallback_files: usize,
    /// Mean ingest rate since start, samples per second
    pub samples_per_second: f64,
}

impl RuntimeSnapshot {
    fn stopped() -> Self {
        Self {
            running: false,
            started_at: None,
            health: Health::Unknown,
            mode: PersistenceMode::Stopped,
            circuit: None,
            aggregate_state: ConnectionState::Disconnected,
            servers: Vec::new(),
            queue: QueueStats {
                depth: 0,
                capacity: 0,
                total_enqueued: 0,
                total_dropped: 0,
                closed: true,
            },
            persistence: CoordinatorStats::default(),
            pending_fallback_files: 0,
            samples_per_second: 0.0,
        }
    }
}

struct Runtime {
    started_at: DateTime<Utc>,
    started_instant: Instant,
    shutdown_tx: watch::Sender<bool>,
    /// Separate signal for the coordinator, sent only once the sessions are
    /// down and the queue is closed
    drain_tx: watch::Sender<bool>,
    queue: Arc<SampleQueue>,
    breaker: Arc<CircuitBreaker>,
    coordinator: Arc<PersistenceCoordinator>,
    coordinator_task: JoinHandle<()>,
    health: Arc<HealthMonitor>,
    health_task: JoinHandle<()>,
    observer_task: JoinHandle<()>,
    recovery: Arc<RecoveryWorker>,
    manager: Arc<ServerManager>,
    fallback: Arc<FallbackSink>,
}

pub struct Supervisor {
    config: AgentConfig,
    transport: Arc<dyn UaTransport>,
    runtime: Mutex<Option<Runtime>>,
}

impl Supervisor {
    pub fn new(config: AgentConfig, transport: Arc<dyn UaTransport>) -> Self {
        Self {
            config,
            transport,
            runtime: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Wire the pipeline and bring the agent up.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(SiphonError::AlreadyRunning);
        }
        self.config.validate()?;
        info!(servers = self.config.servers.len(), "starting acquisition agent");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(SampleQueue::new(self.config.queue_capacity));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: self.config.breaker_failure_threshold,
            cooldown: self.config.breaker_cooldown(),
        }));

        let mut client_options = ClientOptions::parse(&self.config.connection_string).await?;
        client_options.app_name = Some("siphon".to_string());
        client_options.server_selection_timeout = Some(self.config.write_timeout());
        let client = Client::with_options(client_options)?;

        let primary = Arc::new(MongoSink::new(
            &client,
            MongoSinkConfig {
                database: self.config.database.clone(),
                collection: self.config.collection.clone(),
                write_timeout: self.config.write_timeout(),
                ttl: self.config.ttl(),
            },
            Arc::clone(&breaker),
        ));

        let fallback = Arc::new(FallbackSink::new(self.config.fallback_dir())?);
        if let Err(e) = fallback.health_check().await {
            warn!(error = %e, dir = %fallback.data_dir().display(), "fallback directory not writable");
        }

        let probe = MongoProbe::connect(
            &self.config.connection_string,
            &self.config.database,
            self.config.health_probe_timeout(),
        )
        .await?;
        let health = Arc::new(HealthMonitor::new(
            Arc::new(probe),
            HealthConfig {
                interval: self.config.health_interval(),
                probe_timeout: self.config.health_probe_timeout(),
                degraded_latency: self.config.health_latency_degraded(),
                failure_threshold: self.config.health_failure_threshold,
            },
        ));

        let recovery = Arc::new(RecoveryWorker::new(
            Arc::clone(&fallback),
            Arc::clone(&primary) as Arc<dyn SampleSink>,
            health.watch(),
            self.config.batch_size,
            self.config.archive_retention(),
        ));

        let initial_override = if self.config.dry_run {
            Some(ModeOverride::DryRun)
        } else if self.config.force_fallback {
            Some(ModeOverride::ForceFallback)
        } else {
            None
        };
        let coordinator = Arc::new(PersistenceCoordinator::new(
            Arc::clone(&queue),
            Arc::clone(&primary) as Arc<dyn SampleSink>,
            Arc::clone(&fallback),
            CoordinatorConfig {
                batch_size: self.config.batch_size,
                batch_timeout: self.config.batch_timeout(),
            },
            initial_override,
        ));

        let manager = Arc::new(ServerManager::new(
            Arc::clone(&self.transport),
            Arc::clone(&queue),
            SessionDefaults {
                session_timeout_ms: self.config.default_session_timeout_ms,
                keepalive_interval_ms: self.config.default_keepalive_interval_ms,
            },
            ReconnectPolicy::default(),
            shutdown_rx.clone(),
        ));

        let health_task = tokio::spawn(Arc::clone(&health).run(shutdown_rx.clone()));
        // The coordinator gets its own shutdown channel: it must outlive the
        // general shutdown signal and keep consuming until the sessions are
        // torn down and the queue is closed
        let (drain_tx, drain_rx) = watch::channel(false);
        let coordinator_task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run(drain_rx).await })
        };
        let observer_task = tokio::spawn(Self::observe_health(
            health.subscribe(),
            Arc::clone(&coordinator),
            Arc::clone(&recovery),
            shutdown_rx.clone(),
        ));

        let summary = manager.connect_all(&self.config.servers).await;
        if summary.failed > 0 {
            warn!(failed = summary.failed, "some servers did not connect; reconnect loops own them now");
        }

        *runtime = Some(Runtime {
            started_at: Utc::now(),
            started_instant: Instant::now(),
            shutdown_tx,
            drain_tx,
            queue,
            breaker,
            coordinator,
            coordinator_task,
            health,
            health_task,
            observer_task,
            recovery,
            manager,
            fallback,
        });
        info!("acquisition agent started");
        Ok(())
    }

    /// Health observer: moves the coordinator's mode and triggers recovery
    /// on every transition into Healthy.
    async fn observe_health(
        mut events: broadcast::Receiver<HealthEvent>,
        coordinator: Arc<PersistenceCoordinator>,
        recovery: Arc<RecoveryWorker>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => match event.current {
                        Health::Unhealthy => {
                            coordinator.apply_health(Health::Unhealthy);
                        }
                        Health::Healthy => {
                            coordinator.apply_health(Health::Healthy);
                            Arc::clone(&recovery).start(shutdown.clone());
                        }
                        Health::Degraded | Health::Unknown => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "health observer lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Ordered teardown; see the module docs. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return Ok(());
        };
        info!("stopping acquisition agent");
        let _ = runtime.shutdown_tx.send(true);

        if runtime.health_task.await.is_err() {
            error!("health task panicked during shutdown");
        }
        runtime.recovery.wait_idle().await;
        if runtime.observer_task.await.is_err() {
            error!("health observer panicked during shutdown");
        }
        runtime.manager.disconnect_all().await;

        // No handler can publish into a closed queue. Only now is the
        // coordinator told to stop, so its final drain runs after the last
        // possible publish and sweeps everything that remains.
        runtime.queue.close();
        let _ = runtime.drain_tx.send(true);
        if runtime.coordinator_task.await.is_err() {
            error!("coordinator task panicked during shutdown");
        }

        info!("acquisition agent stopped");
        Ok(())
    }

    /// Set or clear the operator mode override.
    pub async fn force_mode(&self, override_mode: Option<ModeOverride>) -> Result<()> {
        let runtime = self.runtime.lock().await;
        let Some(runtime) = runtime.as_ref() else {
            return Err(SiphonError::Config("agent is not running".to_string()));
        };
        runtime.coordinator.force(override_mode);
        Ok(())
    }

    /// Copy of the current runtime state.
    pub async fn snapshot(&self) -> RuntimeSnapshot {
        let runtime = self.runtime.lock().await;
        let Some(runtime) = runtime.as_ref() else {
            return RuntimeSnapshot::stopped();
        };

        let queue = runtime.queue.stats();
        let elapsed = runtime.started_instant.elapsed().as_secs_f64();
        let samples_per_second = if elapsed > 0.0 {
            queue.total_enqueued as f64 / elapsed
        } else {
            0.0
        };
        let pending_fallback_files = runtime.fallback.list_pending().await.map(|p| p.len()).unwrap_or(0);

        RuntimeSnapshot {
            running: true,
            started_at: Some(runtime.started_at),
            health: runtime.health.current(),
            mode: runtime.coordinator.mode(),
            circuit: Some(runtime.breaker.state()),
            aggregate_state: runtime.manager.aggregate_state().await,
            servers: runtime.manager.server_statuses().await,
            queue,
            persistence: runtime.coordinator.stats(),
            pending_fallback_files,
            samples_per_second,
        }
    }
}
