//! Health monitoring of the primary store
//!
//! A single background task probes the primary on a fixed cadence through a
//! dedicated, aggressively-timed probe connection, classifies the result,
//! and publishes a `HealthEvent` only when the classification changes.
//!
//! Classification is pure logic in [`Classifier`], fed with the probe
//! round-trip (or its absence); the worker task supplies the actual I/O.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Primary store health as seen by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    /// No probe has completed yet
    #[default]
    Unknown,
    Healthy,
    /// Reachable but slow, or failing but below the failure threshold
    Degraded,
    /// Repeated probe failures
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Unknown => "unknown",
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unhealthy => "unhealthy",
        }
    }
}

/// Emitted on every classification change
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub previous: Health,
    pub current: Health,
    /// Round-trip of the probe that triggered the change, when it succeeded
    pub latency: Option<Duration>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Probe cadence
    pub interval: Duration,
    /// Per-probe deadline
    pub probe_timeout: Duration,
    /// Successful round-trip above this is Degraded
    pub degraded_latency: Duration,
    /// Consecutive failures before Unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            degraded_latency: Duration::from_millis(500),
            failure_threshold: 3,
        }
    }
}

/// Liveness probe seam; implemented over a dedicated client connection.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// Pure classification state machine.
#[derive(Debug)]
pub struct Classifier {
    degraded_latency: Duration,
    failure_threshold: u32,
    consecutive_failures: u32,
}

impl Classifier {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            degraded_latency: config.degraded_latency,
            failure_threshold: config.failure_threshold,
            consecutive_failures: 0,
        }
    }

    /// Classify one probe outcome. `latency` is `None` on failure or probe
    /// timeout.
    pub fn classify(&mut self, latency: Option<Duration>) -> Health {
        match latency {
            Some(rtt) => {
                self.consecutive_failures = 0;
                if rtt <= self.degraded_latency {
                    Health::Healthy
                } else {
                    Health::Degraded
                }
            }
            None => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    Health::Unhealthy
                } else {
                    Health::Degraded
                }
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Background health monitor for the primary store.
pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
    classifier: Mutex<Classifier>,
    current_tx: watch::Sender<Health>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, config: HealthConfig) -> Self {
        let (current_tx, _) = watch::channel(Health::Unknown);
        let (events, _) = broadcast::channel(64);
        Self {
            classifier: Mutex::new(Classifier::new(&config)),
            probe,
            config,
            current_tx,
            events,
        }
    }

    /// Current classification without probing
    pub fn current(&self) -> Health {
        *self.current_tx.borrow()
    }

    /// Watch channel carrying the current classification
    pub fn watch(&self) -> watch::Receiver<Health> {
        self.current_tx.subscribe()
    }

    /// Subscribe to classification-change events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Force a probe before returning the resulting classification.
    pub async fn check_now(&self) -> Health {
        self.probe_once().await
    }

    /// Worker loop: probe, classify, publish on change, sleep.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.config.interval,
            probe_timeout = ?self.config.probe_timeout,
            "health monitor started"
        );
        loop {
            self.probe_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("health monitor stopped");
    }

    /// One probe + classify + publish cycle. Serialized with the periodic
    /// loop so `check_now` cannot interleave with it.
    async fn probe_once(&self) -> Health {
        let mut classifier = self.classifier.lock().await;

        let started = Instant::now();
        let latency = match tokio::time::timeout(self.config.probe_timeout, self.probe.probe()).await
        {
            Ok(Ok(())) => Some(started.elapsed()),
            Ok(Err(e)) => {
                debug!(error = %e, "health probe failed");
                None
            }
            Err(_) => {
                debug!(timeout = ?self.config.probe_timeout, "health probe timed out");
                None
            }
        };
        let health = classifier.classify(latency);
        drop(classifier);

        self.publish(health, latency);
        health
    }

    fn publish(&self, current: Health, latency: Option<Duration>) {
        let previous = *self.current_tx.borrow();
        if previous == current {
            return;
        }
        self.current_tx.send_replace(current);
        let event = HealthEvent {
            previous,
            current,
            latency,
            at: Utc::now(),
        };
        match current {
            Health::Unhealthy => {
                warn!(from = previous.as_str(), to = current.as_str(), "primary store unhealthy")
            }
            _ => info!(from = previous.as_str(), to = current.as_str(), "health changed"),
        }
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct StubProbe {
        fail: AtomicBool,
        delay: Mutex<Duration>,
        calls: AtomicU64,
    }

    impl StubProbe {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
                delay: Mutex::new(Duration::ZERO),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for StubProbe {
        async fn probe(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let delay = *self.delay.lock().await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::Relaxed) {
                Err(crate::error::SiphonError::Transport("probe refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            degraded_latency: Duration::from_millis(20),
            failure_threshold: 3,
        }
    }

    #[test]
    fn test_classifier_fast_success_is_healthy() {
        let mut c = Classifier::new(&HealthConfig::default());
        assert_eq!(c.classify(Some(Duration::from_millis(5))), Health::Healthy);
        assert_eq!(c.consecutive_failures(), 0);
    }

    #[test]
    fn test_classifier_slow_success_is_degraded() {
        let mut c = Classifier::new(&HealthConfig::default());
        assert_eq!(c.classify(Some(Duration::from_millis(800))), Health::Degraded);
    }

    #[test]
    fn test_classifier_failures_escalate() {
        let mut c = Classifier::new(&HealthConfig::default());
        assert_eq!(c.classify(None), Health::Degraded);
        assert_eq!(c.classify(None), Health::Degraded);
        assert_eq!(c.classify(None), Health::Unhealthy);
        assert_eq!(c.classify(None), Health::Unhealthy);
        assert_eq!(c.consecutive_failures(), 4);
    }

    #[test]
    fn test_classifier_success_resets_failures() {
        let mut c = Classifier::new(&HealthConfig::default());
        c.classify(None);
        c.classify(None);
        assert_eq!(c.classify(Some(Duration::from_millis(1))), Health::Healthy);
        assert_eq!(c.consecutive_failures(), 0);
        // The next failure starts a fresh streak
        assert_eq!(c.classify(None), Health::Degraded);
    }

    #[test]
    fn test_classifier_boundary_latency() {
        let cfg = HealthConfig::default();
        let mut c = Classifier::new(&cfg);
        // Exactly at the threshold is still healthy
        assert_eq!(c.classify(Some(cfg.degraded_latency)), Health::Healthy);
    }

    #[tokio::test]
    async fn test_check_now_classifies() {
        let probe = Arc::new(StubProbe::new());
        let monitor = HealthMonitor::new(probe.clone(), config());

        assert_eq!(monitor.current(), Health::Unknown);
        assert_eq!(monitor.check_now().await, Health::Healthy);
        assert_eq!(monitor.current(), Health::Healthy);
    }

    #[tokio::test]
    async fn test_events_only_on_change() {
        let probe = Arc::new(StubProbe::new());
        let monitor = HealthMonitor::new(probe.clone(), config());
        let mut events = monitor.subscribe();

        monitor.check_now().await;
        monitor.check_now().await;
        monitor.check_now().await;

        // One Unknown -> Healthy event, nothing for the repeats
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.previous, Health::Unknown);
        assert_eq!(ev.current, Health::Healthy);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold() {
        let probe = Arc::new(StubProbe::new());
        probe.fail.store(true, Ordering::Relaxed);
        let monitor = HealthMonitor::new(probe.clone(), config());

        assert_eq!(monitor.check_now().await, Health::Degraded);
        assert_eq!(monitor.check_now().await, Health::Degraded);
        assert_eq!(monitor.check_now().await, Health::Unhealthy);

        // Recovery flips straight back to Healthy
        probe.fail.store(false, Ordering::Relaxed);
        assert_eq!(monitor.check_now().await, Health::Healthy);
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        let probe = Arc::new(StubProbe::new());
        *probe.delay.lock().await = Duration::from_millis(200);
        let monitor = HealthMonitor::new(probe.clone(), config());

        assert_eq!(monitor.check_now().await, Health::Degraded);
    }

    #[tokio::test]
    async fn test_run_loop_probes_and_stops() {
        let probe = Arc::new(StubProbe::new());
        let monitor = Arc::new(HealthMonitor::new(probe.clone(), config()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&monitor).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(probe.calls.load(Ordering::Relaxed) >= 2);
        assert_eq!(monitor.current(), Health::Healthy);
    }
}
