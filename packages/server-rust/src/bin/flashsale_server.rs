//! FlashSale server binary.
//!
//! Wires configuration, logging, metrics, storage, the generation manager,
//! and the HTTP listener together, then serves until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flashsale_core::{Clock, DurableStore, SaleConfig, SystemClock};
use flashsale_server::engine::generation::GenerationManager;
use flashsale_server::network::{NetworkConfig, NetworkModule};
use flashsale_server::storage::{BatchConfig, BatchingStore, MemoryStore, StoreBackend};

#[derive(Debug, Parser)]
#[command(name = "flashsale-server", about = "Flash-sale coordination service")]
struct Args {
    /// Bind address.
    #[arg(long, env = "FLASHSALE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// HTTP port (0 = OS-assigned).
    #[arg(long, env = "FLASHSALE_PORT", default_value_t = 8080)]
    port: u16,

    /// Prometheus exporter port (0 disables the exporter).
    #[arg(long, env = "FLASHSALE_METRICS_PORT", default_value_t = 9090)]
    metrics_port: u16,

    /// Items offered per sale window.
    #[arg(long, env = "FLASHSALE_ITEMS", default_value_t = 10_000)]
    items: usize,

    /// Purchases allowed per user per window.
    #[arg(long, env = "FLASHSALE_USER_LIMIT", default_value_t = 10)]
    user_limit: u64,

    /// Reservation hold duration in milliseconds.
    #[arg(long, env = "FLASHSALE_HOLD_MS", default_value_t = 3_000)]
    hold_ms: u64,

    /// Expiry sweep interval in milliseconds.
    #[arg(long, env = "FLASHSALE_SWEEP_MS", default_value_t = 5_000)]
    sweep_ms: u64,

    /// Sale window length in seconds.
    #[arg(long, env = "FLASHSALE_WINDOW_SECS", default_value_t = 3_600)]
    window_secs: u64,

    /// Drain grace for an outgoing generation, in milliseconds.
    #[arg(long, env = "FLASHSALE_DRAIN_GRACE_MS", default_value_t = 500)]
    drain_grace_ms: u64,

    /// Durable-write acknowledgement timeout in milliseconds.
    #[arg(long, env = "FLASHSALE_ACK_TIMEOUT_MS", default_value_t = 2_000)]
    ack_timeout_ms: u64,

    /// PostgreSQL connection string. Without it the server keeps sale facts
    /// in process memory (no durability across restarts).
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

impl Args {
    fn sale_config(&self) -> SaleConfig {
        SaleConfig {
            items_per_window: self.items,
            per_user_limit: self.user_limit,
            hold_duration: Duration::from_millis(self.hold_ms),
            sweep_interval: Duration::from_millis(self.sweep_ms),
            window_length: Duration::from_secs(self.window_secs),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ..SaleConfig::default()
        }
    }

    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            ..NetworkConfig::default()
        }
    }
}

async fn build_store(args: &Args) -> anyhow::Result<Arc<dyn DurableStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &args.database_url {
        let backend = flashsale_server::storage::PostgresStore::connect(url).await?;
        backend.migrate().await?;
        info!("using PostgreSQL durable store");
        let backend: Arc<dyn StoreBackend> = Arc::new(backend);
        return Ok(BatchingStore::spawn(backend, BatchConfig::default()) as Arc<dyn DurableStore>);
    }

    #[cfg(not(feature = "postgres"))]
    if args.database_url.is_some() {
        anyhow::bail!("DATABASE_URL set but this build lacks the `postgres` feature");
    }

    warn!("no DATABASE_URL: sale facts will not survive a process restart");
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
    Ok(BatchingStore::spawn(backend, BatchConfig::default()) as Arc<dyn DurableStore>)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,flashsale_server=debug,flashsale_core=debug")
        }))
        .init();

    let args = Args::parse();
    let sale_config = args.sale_config();
    sale_config.validate()?;

    if args.metrics_port > 0 {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], args.metrics_port))
            .install()?;
        info!(port = args.metrics_port, "Prometheus exporter listening");
    }

    let store = build_store(&args).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let manager = GenerationManager::bootstrap(sale_config, store, clock).await?;

    let mut network = NetworkModule::new(args.network_config());
    let port = network.start().await?;
    info!(port, items = args.items, "flash-sale service starting");

    let rotation_shutdown = network.shutdown_controller().shutdown_receiver();
    let rotation_timer = manager.spawn_rotation_timer(rotation_shutdown);

    network.serve(Arc::clone(&manager), shutdown_signal()).await?;

    rotation_timer.abort();
    Ok(())
}
