/*!
 * Siphon agent binary
 *
 * `run` hosts the supervisor until ctrl-c; `check` is a connectivity
 * dry-run that validates the configuration, probes the primary store, and
 * verifies the fallback directory is writable. Production deployments
 * inject their OPC UA wire binding through `Supervisor::new`; this binary
 * wires the bundled simulation transport.
 */

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use siphon::health::{Health, HealthConfig};
use siphon::opcua::MockTransport;
use siphon::sink::{FallbackSink, MongoProbe};
use siphon::{logging, AgentConfig, Supervisor};

#[derive(Parser)]
#[command(name = "siphon", version, about = "Industrial data acquisition agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent until interrupted
    Run {
        /// Path to the JSON configuration snapshot
        #[arg(long)]
        config: PathBuf,
    },
    /// Validate configuration and probe the primary store, then exit
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Check { config } => check(config).await,
    }
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let config = AgentConfig::load(&path).context("loading configuration")?;
    logging::init_logging(&config).context("initializing logging")?;

    info!(version = siphon::VERSION, "siphon starting");
    info!("using the simulated OPC UA transport; inject a wire binding for production use");

    let supervisor = Supervisor::new(config, Arc::new(MockTransport::new()));
    supervisor.start().await.context("starting agent")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received");

    supervisor.stop().await.context("stopping agent")?;
    let snapshot = supervisor.snapshot().await;
    info!(
        enqueued = snapshot.queue.total_enqueued,
        dropped = snapshot.queue.total_dropped,
        "final counters"
    );
    Ok(())
}

async fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = AgentConfig::load(&path).context("loading configuration")?;
    logging::init_logging(&config).context("initializing logging")?;

    for server in &config.servers {
        match server.validate() {
            Ok(()) => info!(server = %server.id, endpoint = %server.endpoint_url, "server config ok"),
            Err(e) => warn!(error = %e, "server config rejected"),
        }
    }

    let fallback = FallbackSink::new(config.fallback_dir())?;
    match fallback.health_check().await {
        Ok(()) => info!(dir = %fallback.data_dir().display(), "fallback directory writable"),
        Err(e) => warn!(error = %e, "fallback directory not writable"),
    }

    // One-shot probe with the same classification the agent would apply
    let probe = MongoProbe::connect(
        &config.connection_string,
        &config.database,
        config.health_probe_timeout(),
    )
    .await?;
    let monitor = siphon::HealthMonitor::new(
        Arc::new(probe),
        HealthConfig {
            interval: config.health_interval(),
            probe_timeout: config.health_probe_timeout(),
            degraded_latency: config.health_latency_degraded(),
            failure_threshold: 1,
        },
    );
    let health = monitor.check_now().await;
    info!(health = health.as_str(), "primary store probe");

    if health == Health::Unhealthy {
        anyhow::bail!("primary store is unreachable");
    }
    Ok(())
}
