//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use siphon::config::{ServerConfig, SubscriptionDef};
use siphon::error::{Result, SiphonError};
use siphon::sample::Sample;
use siphon::sink::SampleSink;

/// In-memory stand-in for the primary store, toggleable to fail.
pub struct MemorySink {
    written: Mutex<Vec<Sample>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            written: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn written(&self) -> Vec<Sample> {
        self.written.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.written.lock().unwrap().len()
    }
}

#[async_trait]
impl SampleSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, batch: &[Sample]) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(SiphonError::Transport("primary unavailable".to_string()));
        }
        self.written.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }
}

pub fn subscription(node_id: &str, browse_path: &str) -> SubscriptionDef {
    SubscriptionDef {
        node_id: node_id.to_string(),
        display_name: node_id.rsplit('.').next().unwrap_or(node_id).to_string(),
        browse_path: browse_path.to_string(),
        sampling_interval_ms: 100,
        publishing_interval_ms: 250,
        queue_size: 10,
        discard_oldest: true,
        enabled: true,
    }
}

pub fn server_config(id: &str, endpoint: &str, subscriptions: Vec<SubscriptionDef>) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        name: format!("{} line", id),
        endpoint_url: endpoint.to_string(),
        enabled: true,
        session_timeout_ms: None,
        keepalive_interval_ms: None,
        subscriptions,
    }
}
