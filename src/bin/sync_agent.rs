//! Sync Agent - Standalone Binary
//!
//! Periodically reconciles stored service records against the DNS and proxy
//! providers. `--once` runs a single pass (for cron-style scheduling).

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use expose_engine::config::{init_tracing, EngineArgs};
use expose_engine::{ProviderSet, SyncService};

/// Sync Agent - repairs drift between service records and providers
#[derive(Parser, Debug)]
#[command(name = "sync-agent", version, about)]
struct Args {
    #[command(flatten)]
    engine: EngineArgs,

    /// Sync interval in seconds
    #[arg(long, default_value = "60", env = "SYNC_INTERVAL")]
    interval: u64,

    /// Run once and exit
    #[arg(long, default_value = "false")]
    once: bool,

    /// Reconcile only these service ids (full pass, including subdomain adoption)
    #[arg(long = "service", value_name = "ID")]
    services: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.engine.verbose);

    let providers: ProviderSet = args.engine.provider_set()?;
    info!(
        interval = args.interval,
        once = args.once,
        providers = %providers.describe(),
        "Starting Sync Agent"
    );

    let store = args.engine.open_store().await?;
    let base_domain = args.engine.base_domain.trim_end_matches('.').to_ascii_lowercase();
    let sync = Arc::new(SyncService::new(store, providers, &base_domain));

    if args.once {
        run_sync(&sync, &args.services).await?;
        return Ok(());
    }

    let mut ticker = interval(Duration::from_secs(args.interval.max(1)));
    loop {
        ticker.tick().await;

        if let Err(e) = run_sync(&sync, &args.services).await {
            error!(error = %e, "Sync cycle failed");
        }
    }
}

async fn run_sync(sync: &SyncService, services: &[String]) -> Result<()> {
    let summary = if services.is_empty() {
        sync.sync_all().await?
    } else {
        sync.sync_services(services).await?
    };

    info!(synced = summary.synced, total = summary.total, "Sync cycle complete");
    Ok(())
}
