//! RustPKI server: loads configuration, opens the store and serves the
//! engine over HTTP until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use rustpki::api::PkiApi;
use rustpki::config::StorageBackend;
use rustpki::creation::SystemView;
use rustpki::metrics::PrometheusSink;
use rustpki::storage::{InMemoryStorage, LocalStorage, Storage};
use rustpki::{Backend, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rustpki-server", version, about = "X.509 certificate authority engine")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `server.listen`
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    config.validate().context("invalid configuration")?;

    let level: tracing::Level = config
        .logging
        .level
        .parse()
        .context("invalid logging.level")?;
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting RustPKI server");

    let storage: Arc<dyn Storage> = match config.storage.backend {
        StorageBackend::Local => {
            info!("Using file storage at {}", config.storage.path.display());
            Arc::new(LocalStorage::new(&config.storage.path)?)
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage; state is lost on exit");
            Arc::new(InMemoryStorage::new())
        }
    };

    let system = SystemView {
        default_lease_ttl: config.engine.default_lease_ttl()?,
        max_lease_ttl: config.engine.max_lease_ttl()?,
        ..SystemView::default()
    };
    let metrics = PrometheusSink::new();
    let backend = Backend::new(
        storage,
        system,
        metrics.clone(),
        config.engine.mount_uuid.clone(),
    );
    backend.initialize().await?;

    let shutdown = CancellationToken::new();
    let periodic =
        backend.spawn_periodic(config.engine.auto_tidy_poll_interval()?, shutdown.clone());

    let api = PkiApi::new(backend, metrics, config.server.mount_path.clone());
    let addr = config.listen_addr()?;
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let stop = server_shutdown.clone();
        let res = api.serve(addr, async move { stop.cancelled().await }).await;
        server_shutdown.cancel();
        res
    });

    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received shutdown signal (Ctrl+C)");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    server.await??;
    periodic.await?;
    info!("RustPKI server stopped");
    Ok(())
}
