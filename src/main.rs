//! `ha-pool` operator CLI.
//!
//! Checks the backing service the way the pool's health watcher does, and
//! prints the effective configuration.
//!
//! ```text
//! ha-pool [--config FILE] probe [--host H] [--port P] [--timeout-ms N]
//! ha-pool [--config FILE] wait [--timeout-secs N]
//! ha-pool [--config FILE] config
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tokio::time;

use ha_pool::config::{load_config, Config};
use ha_pool::health::{ConnectivityObserver, HealthWatcher};
use ha_pool::lifecycle::ShutdownController;
use ha_pool::net::{probe, TcpProbe};
use ha_pool::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "ha-pool")]
#[command(about = "Reachability checks for a highly available connection pool", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one liveness probe; exit code 0 if reachable, 1 otherwise
    Probe {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Watch until the server is reachable
    Wait {
        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    logging::init_logging(&config.observability)?;

    if config.observability.metrics_enabled {
        // Validation already checked the address.
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    match cli.command {
        Commands::Probe { host, port, timeout_ms } => {
            let host = host.unwrap_or_else(|| config.pool.host.clone());
            let port = port.unwrap_or(config.pool.port);
            let timeout = timeout_ms.map_or(config.pool.probe_timeout(), Duration::from_millis);

            let alive = probe::probe(&host, port, timeout).await;
            tracing::info!(host = %host, port, alive, "Probe finished");
            println!("{}", if alive { "reachable" } else { "unreachable" });
            Ok(if alive { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Wait { timeout_secs } => {
            let reachable = wait_until_reachable(&config, Duration::from_secs(timeout_secs)).await;
            Ok(if reachable { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Wakes `main` once the watcher sees the server.
#[derive(Default)]
struct ReadyLatch {
    ready: Notify,
    outages: AtomicUsize,
}

impl ConnectivityObserver for ReadyLatch {
    fn on_disconnected(&self) {
        self.outages.fetch_add(1, Ordering::SeqCst);
        println!("Server host not reachable, waiting...");
    }

    fn on_reachable(&self, _announce: bool) {
        self.ready.notify_one();
    }
}

async fn wait_until_reachable(config: &Config, limit: Duration) -> bool {
    let pool = &config.pool;
    let probe = Arc::new(TcpProbe::new(pool.host.clone(), pool.port, pool.probe_timeout()));
    let latch = Arc::new(ReadyLatch::default());
    let observer: Weak<dyn ConnectivityObserver> = Arc::downgrade(&latch) as Weak<dyn ConnectivityObserver>;
    let lifecycle = ShutdownController::new();

    let watcher = HealthWatcher::new(probe, pool.reconnect_interval(), observer, lifecycle.subscribe());
    watcher.start(true);

    match time::timeout(limit, latch.ready.notified()).await {
        Ok(()) => {
            println!("{}", ha_pool::pool::READY_MESSAGE);
            true
        }
        Err(_) => {
            watcher.abort();
            println!(
                "Gave up after {}s ({} outage reported)",
                limit.as_secs(),
                latch.outages.load(Ordering::SeqCst)
            );
            false
        }
    }
}
