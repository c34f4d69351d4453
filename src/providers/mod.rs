//! Provider Gateways
//!
//! Trait-based contracts for the two external systems an exposure touches:
//! a DNS provider and a reverse-proxy provider. Concrete vendors are picked
//! once at startup and shared as trait objects.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{normalize_hostname, DnsRecord, DnsRecordType, ProxyHost, Scheme};

pub mod cloudflare;
pub mod nginx_proxy_manager;

pub use cloudflare::CloudflareDnsProvider;
pub use nginx_proxy_manager::NginxProxyManager;

/// Request to create a DNS record
#[derive(Debug, Clone)]
pub struct NewDnsRecord {
    /// Label inside the provider's zone
    pub subdomain: String,
    pub ip: String,
    /// Defaults to `A`
    pub record_type: Option<DnsRecordType>,
    /// Defaults to the provider's automatic TTL
    pub ttl: Option<u32>,
}

/// Request to create a proxy host
#[derive(Debug, Clone)]
pub struct NewProxyHost {
    pub domain: String,
    pub target_host: String,
    pub target_port: u16,
    pub target_scheme: Scheme,
    /// Request a TLS certificate for `domain`
    pub ssl: bool,
    /// DNS was already verified, so the provider need not wait before ACME
    pub skip_dns_wait: bool,
}

/// Partial update of a proxy host's upstream
#[derive(Debug, Clone, Default)]
pub struct ProxyHostUpdate {
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub target_scheme: Option<Scheme>,
}

impl ProxyHostUpdate {
    pub fn is_empty(&self) -> bool {
        self.target_host.is_none() && self.target_port.is_none() && self.target_scheme.is_none()
    }
}

/// Result of re-requesting a certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslRetryOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// DNS vendor contract
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Vendor name for logs
    fn name(&self) -> &str;

    async fn create_record(&self, request: &NewDnsRecord) -> Result<DnsRecord>;

    async fn delete_record(&self, record_id: &str) -> Result<()>;

    async fn list_records(&self) -> Result<Vec<DnsRecord>>;

    /// Exact hostname lookup of the `A` record, case and trailing-dot insensitive
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<DnsRecord>> {
        let wanted = normalize_hostname(hostname);
        Ok(self
            .list_records()
            .await?
            .into_iter()
            .find(|r| r.record_type == DnsRecordType::A && normalize_hostname(&r.name) == wanted))
    }
}

/// Reverse-proxy vendor contract
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Vendor name for logs
    fn name(&self) -> &str;

    /// Create a host; TLS failure still returns the host with `ssl_pending`
    async fn create_host(&self, request: &NewProxyHost) -> Result<ProxyHost>;

    async fn update_host(&self, host_id: &str, update: &ProxyHostUpdate) -> Result<ProxyHost>;

    async fn delete_host(&self, host_id: &str) -> Result<()>;

    async fn list_hosts(&self) -> Result<Vec<ProxyHost>>;

    async fn find_by_domain(&self, domain: &str) -> Result<Option<ProxyHost>> {
        Ok(self.list_hosts().await?.into_iter().find(|h| h.serves(domain)))
    }

    async fn retry_ssl(&self, host_id: &str, domain: &str) -> Result<SslRetryOutcome>;
}

/// The configured providers; either may be absent
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub dns: Option<Arc<dyn DnsProvider>>,
    pub proxy: Option<Arc<dyn ProxyProvider>>,
}

impl ProviderSet {
    pub fn new(dns: Option<Arc<dyn DnsProvider>>, proxy: Option<Arc<dyn ProxyProvider>>) -> Self {
        Self { dns, proxy }
    }

    pub fn is_empty(&self) -> bool {
        self.dns.is_none() && self.proxy.is_none()
    }

    /// e.g. "dns=cloudflare proxy=none"
    pub fn describe(&self) -> String {
        format!(
            "dns={} proxy={}",
            self.dns.as_ref().map(|p| p.name()).unwrap_or("none"),
            self.proxy.as_ref().map(|p| p.name()).unwrap_or("none"),
        )
    }
}
