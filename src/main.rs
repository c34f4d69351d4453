//! Expose Engine server
//!
//! HTTP management API plus a background reconciliation loop.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use expose_engine::api::{router, AppState};
use expose_engine::config::{init_tracing, EngineArgs};

#[derive(Parser, Debug)]
#[command(name = "expose-engine", version, about)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "EXPOSE_LISTEN")]
    listen: SocketAddr,

    /// Seconds between background sync passes (0 disables)
    #[arg(long, default_value = "300", env = "SYNC_INTERVAL")]
    sync_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.engine.verbose);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Expose Engine");

    let store = cli.engine.open_store().await?;
    let expose = Arc::new(cli.engine.expose_service(store.clone()).await?);

    if cli.sync_interval > 0 {
        let expose = expose.clone();
        let period = Duration::from_secs(cli.sync_interval);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = expose.sync().sync_all().await {
                    error!(error = %e, "Background sync failed");
                }
            }
        });
    }

    let app = router(AppState::new(expose, store));

    info!(addr = %cli.listen, "Expose Engine listening");
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
