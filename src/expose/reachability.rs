//! Scheme Detection & Reachability
//!
//! Decides whether a backend speaks HTTP or HTTPS and confirms that a freshly
//! exposed domain answers on 443. Both checks are advisory: they never fail
//! a workflow.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{redirect, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::Scheme;

/// Ports where HTTPS is probed first
pub const HTTPS_PORTS: [u16; 4] = [443, 8443, 9443, 10443];

/// Issues a lightweight request and reports the status, if any came back
#[async_trait]
pub trait Prober: Send + Sync {
    async fn head(&self, url: &str, timeout: Duration) -> Option<u16>;
}

/// reqwest-backed prober; backends often run self-signed certificates
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to create probe HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn head(&self, url: &str, timeout: Duration) -> Option<u16> {
        match self.client.head(url).timeout(timeout).send().await {
            Ok(response) => Some(response.status().as_u16()),
            Err(e) => {
                debug!(url = %url, error = %e, "Probe got no response");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReachabilityConfig {
    /// Per-probe timeout for backend scheme detection
    pub probe_timeout: Duration,
    pub https_attempts: u32,
    pub https_interval: Duration,
    /// Per-attempt timeout for public HTTPS verification
    pub https_timeout: Duration,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(2),
            https_attempts: 6,
            https_interval: Duration::from_secs(5),
            https_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ReachabilityChecker {
    prober: Arc<dyn Prober>,
    config: ReachabilityConfig,
}

impl ReachabilityChecker {
    pub fn new(prober: Arc<dyn Prober>, config: ReachabilityConfig) -> Self {
        Self { prober, config }
    }

    /// Detect the backend scheme; `None` keeps whatever was recorded
    pub async fn test_backend_scheme(
        &self,
        host: &str,
        port: u16,
        current: Option<Scheme>,
    ) -> Option<Scheme> {
        let detected = if current == Some(Scheme::Https) || HTTPS_PORTS.contains(&port) {
            if self.is_alive(Scheme::Https, host, port).await {
                Some(Scheme::Https)
            } else if self.is_alive(Scheme::Http, host, port).await {
                Some(Scheme::Http)
            } else {
                None
            }
        } else {
            let (https, http) = tokio::join!(
                self.is_alive(Scheme::Https, host, port),
                self.is_alive(Scheme::Http, host, port)
            );
            match (https, http) {
                (true, _) => Some(Scheme::Https),
                (false, true) => Some(Scheme::Http),
                (false, false) => None,
            }
        };

        match detected {
            Some(scheme) => debug!(host = %host, port, scheme = %scheme, "Detected backend scheme"),
            None => debug!(host = %host, port, "Backend did not answer on either scheme"),
        }
        detected
    }

    /// Any status below 500 means something is listening
    async fn is_alive(&self, scheme: Scheme, host: &str, port: u16) -> bool {
        let url = format!("{}://{}:{}/", scheme, host, port);
        matches!(self.prober.head(&url, self.config.probe_timeout).await, Some(status) if status < 500)
    }

    /// Poll `https://domain/` until it answers or attempts run out
    pub async fn verify_https_reachability(&self, domain: &str) -> bool {
        let url = format!("https://{}/", domain);

        for attempt in 1..=self.config.https_attempts {
            if let Some(status) = self.prober.head(&url, self.config.https_timeout).await {
                info!(domain = %domain, status, attempt, "Domain reachable over HTTPS");
                return true;
            }

            if attempt < self.config.https_attempts {
                tokio::time::sleep(self.config.https_interval).await;
            }
        }

        info!(
            domain = %domain,
            attempts = self.config.https_attempts,
            "HTTPS reachability not confirmed"
        );
        false
    }
}
