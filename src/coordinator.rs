//! Persistence coordinator
//!
//! Single consumer of the ingress queue. Assembles batches (up to the
//! configured size, flushed at the latest after the batch deadline) and
//! routes them to the active sink:
//!
//! - Primary: write to the primary; on failure, divert the current batch to
//!   the fallback sink before proceeding
//! - Fallback: write to the fallback only
//! - DryRun: count and discard, never touch a sink
//! - Stopped: shutdown drain, applying the last live policy
//!
//! Health events move the mode (Unhealthy -> Fallback, Healthy -> Primary;
//! Degraded changes nothing). Manual overrides take precedence over the
//! health-driven selection. A fallback write failure is the only sanctioned
//! data-loss path; it increments the permanent-loss counter and is logged at
//! error level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::health::Health;
use crate::queue::SampleQueue;
use crate::sample::Sample;
use crate::sink::{FallbackSink, SampleSink};

/// Which sink the coordinator consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    Primary,
    Fallback,
    DryRun,
    Stopped,
}

impl PersistenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceMode::Primary => "primary",
            PersistenceMode::Fallback => "fallback",
            PersistenceMode::DryRun => "dry-run",
            PersistenceMode::Stopped => "stopped",
        }
    }
}

/// Operator override, taking precedence over health-driven selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeOverride {
    ForceFallback,
    DryRun,
}

/// Emitted whenever the effective mode changes
#[derive(Debug, Clone)]
pub struct ModeChange {
    pub previous: PersistenceMode,
    pub current: PersistenceMode,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum samples per batch
    pub batch_size: usize,
    /// Flush deadline measured from the start of batch assembly
    pub batch_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_timeout: Duration::from_secs(1),
        }
    }
}

/// Counter snapshot for the status surface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub batches_flushed: u64,
    pub samples_to_primary: u64,
    pub samples_to_fallback: u64,
    pub samples_discarded: u64,
    pub samples_lost: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches_flushed: AtomicU64,
    samples_to_primary: AtomicU64,
    samples_to_fallback: AtomicU64,
    samples_discarded: AtomicU64,
    samples_lost: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            samples_to_primary: self.samples_to_primary.load(Ordering::Relaxed),
            samples_to_fallback: self.samples_to_fallback.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
            samples_lost: self.samples_lost.load(Ordering::Relaxed),
        }
    }
}

/// How long the consumer sleeps between shutdown checks while idle
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub struct PersistenceCoordinator {
    queue: Arc<SampleQueue>,
    primary: Arc<dyn SampleSink>,
    fallback: Arc<FallbackSink>,
    config: CoordinatorConfig,
    /// Health-driven mode; overridden by `override_mode` when set
    health_mode: watch::Sender<PersistenceMode>,
    override_mode: std::sync::Mutex<Option<ModeOverride>>,
    mode_events: broadcast::Sender<ModeChange>,
    counters: Counters,
}

impl PersistenceCoordinator {
    pub fn new(
        queue: Arc<SampleQueue>,
        primary: Arc<dyn SampleSink>,
        fallback: Arc<FallbackSink>,
        config: CoordinatorConfig,
        initial_override: Option<ModeOverride>,
    ) -> Self {
        let (health_mode, _) = watch::channel(PersistenceMode::Primary);
        let (mode_events, _) = broadcast::channel(32);
        Self {
            queue,
            primary,
            fallback,
            config,
            health_mode,
            override_mode: std::sync::Mutex::new(initial_override),
            mode_events,
            counters: Counters::default(),
        }
    }

    /// Effective mode, override included
    pub fn mode(&self) -> PersistenceMode {
        match *self.override_mode.lock().unwrap() {
            Some(ModeOverride::ForceFallback) => PersistenceMode::Fallback,
            Some(ModeOverride::DryRun) => PersistenceMode::DryRun,
            None => *self.health_mode.borrow(),
        }
    }

    pub fn subscribe_mode(&self) -> broadcast::Receiver<ModeChange> {
        self.mode_events.subscribe()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.counters.snapshot()
    }

    /// Apply a health classification to the health-driven mode.
    ///
    /// Returns the (previous, current) health-driven pair when it moved.
    pub fn apply_health(&self, health: Health) -> Option<(PersistenceMode, PersistenceMode)> {
        let target = match health {
            Health::Unhealthy => PersistenceMode::Fallback,
            Health::Healthy => PersistenceMode::Primary,
            Health::Degraded | Health::Unknown => return None,
        };
        let before_effective = self.mode();
        let previous = *self.health_mode.borrow();
        if previous == target {
            return None;
        }
        self.health_mode.send_replace(target);
        info!(from = previous.as_str(), to = target.as_str(), "persistence mode changed");
        self.emit_mode_change(before_effective);
        Some((previous, target))
    }

    /// Set or clear the operator override.
    pub fn force(&self, override_mode: Option<ModeOverride>) {
        let before = self.mode();
        *self.override_mode.lock().unwrap() = override_mode;
        match override_mode {
            Some(ModeOverride::ForceFallback) => warn!("operator forced fallback mode"),
            Some(ModeOverride::DryRun) => warn!("operator forced dry-run mode"),
            None => info!("operator override cleared"),
        }
        self.emit_mode_change(before);
    }

    fn emit_mode_change(&self, before_effective: PersistenceMode) {
        let current = self.mode();
        if current != before_effective {
            let _ = self.mode_events.send(ModeChange {
                previous: before_effective,
                current,
                at: Utc::now(),
            });
        }
    }

    /// Consumer loop. Returns after a shutdown signal once the residual
    /// queue contents have been drained through the active sink.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout = ?self.config.batch_timeout,
            "persistence coordinator started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            // next_batch returns None only when consumption should stop:
            // shutdown signalled, shutdown channel gone, or queue closed
            match self.next_batch(&mut shutdown).await {
                Some(batch) => self.flush(batch).await,
                None => break,
            }
        }
        self.drain().await;
        info!("persistence coordinator stopped");
    }

    /// Assemble one batch: block until the queue is non-empty, then fill up
    /// to `batch_size`, waiting out the remaining deadline for stragglers.
    async fn next_batch(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Vec<Sample>> {
        let max = self.config.batch_size;
        let mut batch = Vec::with_capacity(max);

        // Empty phase: wait for the first sample
        loop {
            if *shutdown.borrow() {
                return None;
            }
            tokio::select! {
                ready = self.queue.wait_non_empty(IDLE_WAIT) => {
                    if ready {
                        break;
                    }
                    if self.queue.is_closed() {
                        return None;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }

        // Fill phase: drain greedily, then wait out the remaining deadline
        let deadline = tokio::time::Instant::now() + self.config.batch_timeout;
        loop {
            while batch.len() < max {
                match self.queue.try_pop() {
                    Some(sample) => batch.push(sample),
                    None => break,
                }
            }
            if batch.len() >= max {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            if !self.queue.wait_non_empty(deadline - now).await {
                break;
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    async fn flush(&self, batch: Vec<Sample>) {
        let mode = self.mode();
        self.flush_with_mode(batch, mode).await;
    }

    async fn flush_with_mode(&self, batch: Vec<Sample>, mode: PersistenceMode) {
        let count = batch.len() as u64;
        match mode {
            PersistenceMode::DryRun => {
                self.counters.samples_discarded.fetch_add(count, Ordering::Relaxed);
                debug!(samples = count, "dry-run batch discarded");
            }
            PersistenceMode::Fallback => {
                self.write_fallback(batch).await;
            }
            PersistenceMode::Primary | PersistenceMode::Stopped => {
                match self.primary.write(&batch).await {
                    Ok(()) => {
                        self.counters.samples_to_primary.fetch_add(count, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            samples = count,
                            "primary write failed, diverting batch to fallback"
                        );
                        self.write_fallback(batch).await;
                    }
                }
            }
        }
        self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    async fn write_fallback(&self, batch: Vec<Sample>) {
        let count = batch.len() as u64;
        match self.fallback.write(&batch).await {
            Ok(()) => {
                self.counters.samples_to_fallback.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.samples_lost.fetch_add(count, Ordering::Relaxed);
                error!(
                    error = %e,
                    lost = count,
                    "fallback write failed, samples permanently lost"
                );
            }
        }
    }

    /// Shutdown drain: push everything left in the queue through the last
    /// live policy.
    async fn drain(&self) {
        let mode = self.mode();
        let mut drained = 0usize;
        let mut batch = Vec::with_capacity(self.config.batch_size);
        loop {
            match self.queue.try_pop() {
                Some(sample) => {
                    batch.push(sample);
                    if batch.len() >= self.config.batch_size {
                        drained += batch.len();
                        self.flush_with_mode(std::mem::take(&mut batch), mode).await;
                    }
                }
                None => break,
            }
        }
        if !batch.is_empty() {
            drained += batch.len();
            self.flush_with_mode(batch, mode).await;
        }
        if drained > 0 {
            info!(samples = drained, mode = mode.as_str(), "drained residual queue on shutdown");
        }
    }
}
