/*!
 * Logging and tracing initialization
 */

use std::fs::File;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::AgentConfig;
use crate::error::{Result, SiphonError};

/// Initialize structured logging based on configuration.
///
/// `SIPHON_LOG` (or the generic `RUST_LOG`) overrides the configured level.
pub fn init_logging(config: &AgentConfig) -> Result<()> {
    let level = config.log_level.to_tracing_level();

    let env_filter = EnvFilter::try_from_env("SIPHON_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(format!("siphon={}", level)))
        .map_err(|e| SiphonError::Config(format!("Failed to create log filter: {}", e)))?;

    if let Some(path) = &config.log_file {
        let file = File::create(path)
            .map_err(|e| SiphonError::Config(format!("Failed to create log file: {}", e)))?;

        let fmt_layer = fmt::layer()
            .with_writer(file)
            .with_target(true)
            .with_ansi(false)
            .with_span_events(FmtSpan::NONE)
            .json();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_span_events(FmtSpan::NONE)
            .compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Best-effort logging for tests; safe to call repeatedly.
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("siphon=debug"));
        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}
