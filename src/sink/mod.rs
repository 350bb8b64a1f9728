//! Persistence sinks
//!
//! The coordinator and the recovery worker talk to stores through the
//! `SampleSink` trait: the MongoDB primary and the local file fallback both
//! implement it, and tests substitute in-memory sinks.

mod fallback;
mod mongo;

pub use fallback::FallbackSink;
pub use mongo::{MongoProbe, MongoSink, MongoSinkConfig};

use async_trait::async_trait;

use crate::error::Result;
use crate::sample::Sample;

/// A destination for sample batches.
///
/// `write` returns `Ok` only when the whole batch has been durably accepted
/// (the primary's documented partial-success case included).
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Short label for logs and the status snapshot
    fn name(&self) -> &'static str;

    async fn write(&self, batch: &[Sample]) -> Result<()>;
}
