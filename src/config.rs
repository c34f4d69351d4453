//! Configuration
//!
//! Command-line flags with environment fallbacks, shared by both binaries,
//! and the wiring that turns them into providers, storage and settings.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::expose::{
    DnsPropagationWaiter, ExposeService, ExposeSettings, HttpProber, PropagationConfig,
    ReachabilityChecker, ReachabilityConfig,
};
use crate::providers::{CloudflareDnsProvider, DnsProvider, NginxProxyManager, ProviderSet, ProxyProvider};
use crate::store::{JsonFileStore, ServiceStore};

const PUBLIC_IP_ENDPOINT: &str = "https://api.ipify.org";

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Zone every exposed subdomain lives under (e.g. "example.com")
    #[arg(long, env = "EXPOSE_BASE_DOMAIN")]
    pub base_domain: String,

    /// Public address for DNS records; detected when omitted
    #[arg(long, env = "EXPOSE_PUBLIC_IP")]
    pub public_ip: Option<String>,

    /// Internal host the reverse proxy forwards to
    #[arg(long, default_value = "127.0.0.1", env = "EXPOSE_TARGET_HOST")]
    pub target_host: String,

    /// Request TLS certificates for new proxy hosts
    #[arg(long, default_value = "true", env = "EXPOSE_SSL", action = clap::ArgAction::Set)]
    pub ssl: bool,

    /// TTL for new DNS records (provider default when omitted)
    #[arg(long, env = "EXPOSE_DNS_TTL")]
    pub dns_ttl: Option<u32>,

    /// JSON file holding service records
    #[arg(long, default_value = "services.json", env = "EXPOSE_STORE_PATH")]
    pub store_path: PathBuf,

    /// Cloudflare API token
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    pub cloudflare_token: Option<String>,

    /// Cloudflare Zone ID
    #[arg(long, env = "CLOUDFLARE_ZONE_ID")]
    pub cloudflare_zone_id: Option<String>,

    /// Nginx Proxy Manager base URL (e.g. "http://npm.lan:81")
    #[arg(long, env = "NPM_URL")]
    pub npm_url: Option<String>,

    #[arg(long, env = "NPM_EMAIL")]
    pub npm_email: Option<String>,

    #[arg(long, env = "NPM_PASSWORD", hide_env_values = true)]
    pub npm_password: Option<String>,

    /// Let's Encrypt account email (defaults to the NPM login email)
    #[arg(long, env = "LETSENCRYPT_EMAIL")]
    pub letsencrypt_email: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    pub verbose: bool,
}

impl EngineArgs {
    /// Providers with complete credentials; partial credentials are a startup error
    pub fn provider_set(&self) -> Result<ProviderSet> {
        let dns: Option<Arc<dyn DnsProvider>> =
            match (&self.cloudflare_token, &self.cloudflare_zone_id) {
                (Some(token), Some(zone_id)) => Some(Arc::new(CloudflareDnsProvider::new(
                    token.clone(),
                    zone_id.clone(),
                    self.base_domain.clone(),
                )?)),
                (None, None) => None,
                _ => anyhow::bail!("Cloudflare needs both CLOUDFLARE_API_TOKEN and CLOUDFLARE_ZONE_ID"),
            };

        let proxy: Option<Arc<dyn ProxyProvider>> =
            match (&self.npm_url, &self.npm_email, &self.npm_password) {
                (Some(url), Some(email), Some(password)) => Some(Arc::new(NginxProxyManager::new(
                    url,
                    email.clone(),
                    password.clone(),
                    self.letsencrypt_email.clone(),
                )?)),
                (None, None, None) => None,
                _ => anyhow::bail!("Nginx Proxy Manager needs NPM_URL, NPM_EMAIL and NPM_PASSWORD"),
            };

        let providers = ProviderSet::new(dns, proxy);
        if providers.is_empty() {
            warn!("No DNS or proxy provider configured; expose requests will be rejected");
        }
        Ok(providers)
    }

    /// Exposure settings, detecting the public IP if it was not given
    pub async fn settings(&self) -> Result<ExposeSettings> {
        let public_ip = match &self.public_ip {
            Some(ip) => ip.clone(),
            None => detect_public_ip().await?,
        };

        Ok(ExposeSettings {
            base_domain: self.base_domain.trim_end_matches('.').to_ascii_lowercase(),
            public_ip,
            target_host: self.target_host.clone(),
            ssl: self.ssl,
            dns_ttl: self.dns_ttl,
        })
    }

    pub async fn open_store(&self) -> Result<Arc<dyn ServiceStore>> {
        Ok(Arc::new(JsonFileStore::open(&self.store_path).await?))
    }

    /// Everything wired around `store` with production probes and resolvers
    pub async fn expose_service(&self, store: Arc<dyn ServiceStore>) -> Result<ExposeService> {
        let providers = self.provider_set()?;
        let settings = self.settings().await?;

        info!(
            base_domain = %settings.base_domain,
            public_ip = %settings.public_ip,
            target_host = %settings.target_host,
            ssl = settings.ssl,
            providers = %providers.describe(),
            "Configured exposure"
        );

        let reachability =
            ReachabilityChecker::new(Arc::new(HttpProber::new()?), ReachabilityConfig::default());
        let propagation = DnsPropagationWaiter::new(PropagationConfig::default())?;

        Ok(ExposeService::new(store, providers, settings, reachability, propagation))
    }
}

async fn detect_public_ip() -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let ip = client
        .get(PUBLIC_IP_ENDPOINT)
        .send()
        .await
        .context("Failed to detect public IP (set EXPOSE_PUBLIC_IP)")?
        .error_for_status()?
        .text()
        .await?
        .trim()
        .to_string();

    ip.parse::<std::net::IpAddr>()
        .with_context(|| format!("Public IP service returned {:?}", ip))?;

    info!(public_ip = %ip, "Detected public IP");
    Ok(ip)
}

/// JSON logs; `RUST_LOG` wins over `--verbose`
pub fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .json()
        .init();
}
