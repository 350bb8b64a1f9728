//! Recovery of fallback files into the primary store
//!
//! A recovery pass replays pending fallback files in chronological order,
//! forwarding their samples to the primary in coordinator-sized batches. A
//! file is archived only once every batch derived from it has been accepted;
//! a failing batch leaves the file in place and ends the pass, because
//! ordering across files is a correctness goal. Replay is at-least-once: a
//! pass halted mid-file is re-read from the start on the next pass, so
//! consumers must tolerate duplicate (serverId, nodeId, sourceTimestamp)
//! tuples.
//!
//! At most one pass runs at a time; duplicate triggers are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::health::Health;
use crate::sink::{FallbackSink, SampleSink};

/// Progress and outcome events for one recovery pass
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    Started,
    InProgress {
        files_archived: u64,
        samples_replayed: u64,
    },
    Completed {
        files_archived: u64,
        samples_replayed: u64,
    },
    Cancelled {
        files_archived: u64,
        samples_replayed: u64,
    },
    Failed {
        files_archived: u64,
        samples_replayed: u64,
        error: String,
    },
}

pub struct RecoveryWorker {
    fallback: Arc<FallbackSink>,
    primary: Arc<dyn SampleSink>,
    health: watch::Receiver<Health>,
    batch_size: usize,
    /// Archive files older than this are purged after a completed pass
    archive_retention: Option<Duration>,
    events: broadcast::Sender<RecoveryEvent>,
    running: AtomicBool,
}

impl RecoveryWorker {
    pub fn new(
        fallback: Arc<FallbackSink>,
        primary: Arc<dyn SampleSink>,
        health: watch::Receiver<Health>,
        batch_size: usize,
        archive_retention: Option<Duration>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            fallback,
            primary,
            health,
            batch_size,
            archive_retention,
            events,
            running: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Launch a recovery pass unless one is already running.
    ///
    /// Returns `true` when a pass was actually started.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("recovery pass already running, trigger ignored");
            return false;
        }
        tokio::spawn(async move {
            let outcome = self.run_pass(shutdown).await;
            self.emit(outcome);
            self.running.store(false, Ordering::Release);
        });
        true
    }

    /// Wait until no pass is running. Used by the ordered shutdown.
    pub async fn wait_idle(&self) {
        while self.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn emit(&self, event: RecoveryEvent) {
        let _ = self.events.send(event);
    }

    async fn run_pass(&self, shutdown: watch::Receiver<bool>) -> RecoveryEvent {
        self.emit(RecoveryEvent::Started);
        let mut files_archived = 0u64;
        let mut samples_replayed = 0u64;

        let pending = match self.fallback.list_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                return RecoveryEvent::Failed {
                    files_archived,
                    samples_replayed,
                    error: e.to_string(),
                }
            }
        };
        if pending.is_empty() {
            debug!("no pending fallback files");
            return RecoveryEvent::Completed {
                files_archived,
                samples_replayed,
            };
        }
        info!(files = pending.len(), "recovery pass started");

        for path in pending {
            if *shutdown.borrow() {
                info!("recovery cancelled by shutdown");
                return RecoveryEvent::Cancelled {
                    files_archived,
                    samples_replayed,
                };
            }

            let samples = match self.fallback.read_file(&path).await {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "cannot read pending file");
                    return RecoveryEvent::Failed {
                        files_archived,
                        samples_replayed,
                        error: e.to_string(),
                    };
                }
            };

            // A file with no valid samples would be retried forever; archive
            // it immediately instead.
            if samples.is_empty() {
                warn!(file = %path.display(), "no valid samples, archiving corrupt file");
                if let Err(e) = self.fallback.archive(&path).await {
                    return RecoveryEvent::Failed {
                        files_archived,
                        samples_replayed,
                        error: e.to_string(),
                    };
                }
                files_archived += 1;
                continue;
            }

            for chunk in samples.chunks(self.batch_size) {
                if *shutdown.borrow() {
                    return RecoveryEvent::Cancelled {
                        files_archived,
                        samples_replayed,
                    };
                }
                // The primary degrading mid-pass halts the replay; the file
                // stays pending and the next pass re-reads it from the start.
                if *self.health.borrow() == Health::Unhealthy {
                    warn!(file = %path.display(), "primary unhealthy, halting recovery");
                    return RecoveryEvent::Failed {
                        files_archived,
                        samples_replayed,
                        error: "primary store became unhealthy".to_string(),
                    };
                }
                match self.primary.write(chunk).await {
                    Ok(()) => {
                        samples_replayed += chunk.len() as u64;
                        self.emit(RecoveryEvent::InProgress {
                            files_archived,
                            samples_replayed,
                        });
                    }
                    Err(e) => {
                        warn!(
                            file = %path.display(),
                            error = %e,
                            "batch replay failed, leaving file pending"
                        );
                        return RecoveryEvent::Failed {
                            files_archived,
                            samples_replayed,
                            error: e.to_string(),
                        };
                    }
                }
            }

            // Every batch from this file is acknowledged; archival is safe
            match self.fallback.archive(&path).await {
                Ok(target) => {
                    files_archived += 1;
                    info!(file = %target.display(), "fallback file recovered and archived");
                    self.emit(RecoveryEvent::InProgress {
                        files_archived,
                        samples_replayed,
                    });
                }
                Err(e) => {
                    return RecoveryEvent::Failed {
                        files_archived,
                        samples_replayed,
                        error: e.to_string(),
                    };
                }
            }
        }

        if let Some(retention) = self.archive_retention {
            if let Err(e) = self.fallback.purge_archive(retention).await {
                warn!(error = %e, "archive purge failed");
            }
        }

        info!(files_archived, samples_replayed, "recovery pass completed");
        RecoveryEvent::Completed {
            files_archived,
            samples_replayed,
        }
    }
}
