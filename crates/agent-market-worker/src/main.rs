use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_market_store_sqlite::{SqliteMarketStore, StoreConfig};
use agent_market_worker::{SimulatedRunner, WorkerConfig, WorkerPool};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "am-worker")]
#[command(about = "Execution worker for the agent marketplace")]
struct Args {
    #[arg(long, env = "AGENT_MARKET_DB", default_value = "./agent_market.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "AGENT_MARKET_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,
    #[arg(long, env = "AGENT_MARKET_WORKER_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
    #[arg(long, env = "AGENT_MARKET_WORKER_QUEUE_CAPACITY", default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, env = "AGENT_MARKET_WORKER_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,
    #[arg(long, env = "AGENT_MARKET_WORKER_OPERATION_TIMEOUT_MS", default_value_t = 10_000)]
    operation_timeout_ms: u64,
    #[arg(long, env = "AGENT_MARKET_WORKER_RUN_TIMEOUT_MS", default_value_t = 30_000)]
    run_timeout_ms: u64,
    #[arg(long, env = "AGENT_MARKET_WORKER_SIMULATED_RUN_MS", default_value_t = 5000)]
    simulated_run_ms: u64,
}

impl Args {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            queue_capacity: self.queue_capacity,
            poll_interval_ms: self.poll_interval_ms,
            operation_timeout_ms: self.operation_timeout_ms,
            run_timeout_ms: self.run_timeout_ms,
            simulated_run_ms: self.simulated_run_ms,
        }
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            busy_timeout_ms: self.busy_timeout_ms,
            ..StoreConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.worker_config();
    let store_config = args.store_config();

    SqliteMarketStore::open_with_config(&args.db, store_config)
        .and_then(|store| store.migrate())
        .with_context(|| format!("failed to prepare database at {}", args.db.display()))?;

    let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(
        config.simulated_run_ms,
    )));
    let pool = WorkerPool::start(args.db.clone(), store_config, config, runner)?;

    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = pool.poll_pending_once().await {
                    warn!(error = %err, "pending execution poll failed");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("shutdown requested");
                break;
            }
        }
    }

    let snapshot = pool.shutdown().await;
    info!(telemetry = %serde_json::to_string(&snapshot)?, "worker exited");
    Ok(())
}
