/*!
 * Siphon - Industrial data acquisition agent
 *
 * Maintains persistent subscriptions against OPC UA servers, funnels value
 * changes through a bounded drop-oldest queue, and records every sample to
 * MongoDB. When the primary store degrades, batches divert to local
 * append-only daily files which are replayed automatically after recovery.
 *
 * Acquisition liveness is the overriding invariant: no storage failure,
 * slowness, or reconfiguration blocks or drops notifications on the
 * receive path beyond the queue's own drop-oldest policy.
 */

pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod logging;
pub mod opcua;
pub mod queue;
pub mod recovery;
pub mod sample;
pub mod sink;
pub mod supervisor;

// Re-export the types hosts interact with
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{AgentConfig, LogLevel, ServerConfig, SubscriptionDef};
pub use coordinator::{ModeOverride, PersistenceCoordinator, PersistenceMode};
pub use error::{Result, SiphonError};
pub use health::{Health, HealthEvent, HealthMonitor};
pub use opcua::{ConnectionState, MockTransport, ServerManager, UaSession, UaTransport};
pub use queue::SampleQueue;
pub use recovery::{RecoveryEvent, RecoveryWorker};
pub use sample::{Sample, Value};
pub use sink::{FallbackSink, MongoSink, SampleSink};
pub use supervisor::{RuntimeSnapshot, Supervisor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
