//! DNS Propagation Waiter
//!
//! Polls the local resolver until a new name resolves, then checks a public
//! DNS-over-HTTPS resolver for a short window. Only the local phase can fail
//! the wait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DOH_ENDPOINT: &str = "https://cloudflare-dns.com/dns-query";
const DNS_TYPE_A: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationPhase {
    Local,
    Global,
}

/// Reported before every resolver attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationProgress {
    pub attempt: u32,
    pub max_attempts: u32,
    pub phase: PropagationPhase,
    pub elapsed_ms: u64,
}

impl PropagationProgress {
    /// Map onto the DNS step: local 30-70%, global 70-95%
    pub fn step_percent(&self) -> u8 {
        let (start, span) = match self.phase {
            PropagationPhase::Local => (30u32, 40u32),
            PropagationPhase::Global => (70u32, 25u32),
        };
        let max = self.max_attempts.max(1);
        let done = self.attempt.min(max);
        (start + span * done / max) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationOutcome {
    /// Visible locally and at the public resolver
    Global,
    /// Visible locally; the public check ran out of attempts
    LocalOnly,
    /// Never resolved locally
    NotResolved,
}

impl PropagationOutcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PropagationOutcome::NotResolved)
    }
}

/// Polling budget
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    pub local_attempts: u32,
    pub local_interval: Duration,
    /// Attempts x interval gives the ~30 s global buffer window
    pub global_attempts: u32,
    pub global_interval: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            local_attempts: 12,
            local_interval: Duration::from_secs(10),
            global_attempts: 6,
            global_interval: Duration::from_secs(5),
        }
    }
}

/// Something that can tell whether a name currently resolves
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolves(&self, domain: &str) -> bool;
}

/// The host's own resolver
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolves(&self, domain: &str) -> bool {
        match tokio::net::lookup_host((domain, 443)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(domain = %domain, error = %e, "Local lookup failed");
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
}

/// Public resolver queried over DNS-over-HTTPS (JSON API)
pub struct DohResolver {
    http_client: Client,
    endpoint: String,
}

impl DohResolver {
    pub fn new() -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            endpoint: DOH_ENDPOINT.to_string(),
        })
    }

    async fn query_a(&self, domain: &str) -> Result<bool> {
        let url = format!(
            "{}?name={}&type=A",
            self.endpoint,
            urlencoding::encode(domain)
        );

        let response: DohResponse = self
            .http_client
            .get(&url)
            .header("accept", "application/dns-json")
            .send()
            .await
            .context("DoH query failed")?
            .json()
            .await
            .context("Invalid DoH response")?;

        // Status 0 = NOERROR
        Ok(response.status == 0 && response.answer.iter().any(|a| a.record_type == DNS_TYPE_A))
    }
}

#[async_trait]
impl Resolver for DohResolver {
    async fn resolves(&self, domain: &str) -> bool {
        match self.query_a(domain).await {
            Ok(found) => found,
            Err(e) => {
                debug!(domain = %domain, error = %e, "Public lookup failed");
                false
            }
        }
    }
}

/// Two-phase propagation poller
pub struct DnsPropagationWaiter {
    local: Arc<dyn Resolver>,
    global: Arc<dyn Resolver>,
    config: PropagationConfig,
}

impl DnsPropagationWaiter {
    /// System resolver locally, Cloudflare DoH globally
    pub fn new(config: PropagationConfig) -> Result<Self> {
        Ok(Self::with_resolvers(
            Arc::new(SystemResolver),
            Arc::new(DohResolver::new()?),
            config,
        ))
    }

    pub fn with_resolvers(
        local: Arc<dyn Resolver>,
        global: Arc<dyn Resolver>,
        config: PropagationConfig,
    ) -> Self {
        Self {
            local,
            global,
            config,
        }
    }

    /// Wait for `domain`, reporting every attempt through `on_progress`
    pub async fn wait<F>(&self, domain: &str, mut on_progress: F) -> PropagationOutcome
    where
        F: FnMut(PropagationProgress) + Send,
    {
        let started = Instant::now();

        let local = self
            .poll(
                domain,
                PropagationPhase::Local,
                self.local.as_ref(),
                self.config.local_attempts,
                self.config.local_interval,
                started,
                &mut on_progress,
            )
            .await;

        if !local {
            warn!(
                domain = %domain,
                attempts = self.config.local_attempts,
                "DNS did not resolve locally"
            );
            return PropagationOutcome::NotResolved;
        }

        let global = self
            .poll(
                domain,
                PropagationPhase::Global,
                self.global.as_ref(),
                self.config.global_attempts,
                self.config.global_interval,
                started,
                &mut on_progress,
            )
            .await;

        if global {
            info!(domain = %domain, elapsed_ms = started.elapsed().as_millis() as u64, "DNS propagated globally");
            PropagationOutcome::Global
        } else {
            info!(domain = %domain, "DNS resolves locally, public resolver not yet updated");
            PropagationOutcome::LocalOnly
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll<F>(
        &self,
        domain: &str,
        phase: PropagationPhase,
        resolver: &dyn Resolver,
        max_attempts: u32,
        interval: Duration,
        started: Instant,
        on_progress: &mut F,
    ) -> bool
    where
        F: FnMut(PropagationProgress) + Send,
    {
        for attempt in 1..=max_attempts {
            on_progress(PropagationProgress {
                attempt,
                max_attempts,
                phase,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });

            if resolver.resolves(domain).await {
                debug!(domain = %domain, phase = ?phase, attempt, "Resolved");
                return true;
            }

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Resolves after a number of failed lookups
    struct ResolvesAfter {
        failures: u32,
        calls: AtomicU32,
    }

    impl ResolvesAfter {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Resolver for ResolvesAfter {
        async fn resolves(&self, _domain: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.failures
        }
    }

    fn fast_config() -> PropagationConfig {
        PropagationConfig {
            local_attempts: 12,
            local_interval: Duration::ZERO,
            global_attempts: 6,
            global_interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_global_success_after_retries() {
        let local = ResolvesAfter::new(2);
        let global = ResolvesAfter::new(1);
        let waiter = DnsPropagationWaiter::with_resolvers(local.clone(), global.clone(), fast_config());

        let mut reports = Vec::new();
        let outcome = waiter.wait("grafana.example.com", |p| reports.push(p)).await;

        assert_eq!(outcome, PropagationOutcome::Global);
        assert_eq!(local.calls.load(Ordering::SeqCst), 3);
        assert_eq!(global.calls.load(Ordering::SeqCst), 2);
        assert_eq!(reports.len(), 5);
        assert_eq!(reports[0].phase, PropagationPhase::Local);
        assert_eq!(reports[0].max_attempts, 12);
        assert_eq!(reports[4].phase, PropagationPhase::Global);
        assert_eq!(reports[4].attempt, 2);
    }

    #[tokio::test]
    async fn test_local_failure_skips_global_phase() {
        let local = ResolvesAfter::new(u32::MAX);
        let global = ResolvesAfter::new(0);
        let waiter = DnsPropagationWaiter::with_resolvers(local.clone(), global.clone(), fast_config());

        let outcome = waiter.wait("grafana.example.com", |_| {}).await;

        assert_eq!(outcome, PropagationOutcome::NotResolved);
        assert_eq!(local.calls.load(Ordering::SeqCst), 12);
        assert_eq!(global.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_global_exhaustion_is_soft() {
        let waiter = DnsPropagationWaiter::with_resolvers(
            ResolvesAfter::new(0),
            ResolvesAfter::new(u32::MAX),
            fast_config(),
        );

        let outcome = waiter.wait("grafana.example.com", |_| {}).await;
        assert_eq!(outcome, PropagationOutcome::LocalOnly);
        assert!(outcome.is_resolved());
    }

    #[test]
    fn test_step_percent_mapping() {
        let local_first = PropagationProgress {
            attempt: 0,
            max_attempts: 12,
            phase: PropagationPhase::Local,
            elapsed_ms: 0,
        };
        assert_eq!(local_first.step_percent(), 30);

        let local_last = PropagationProgress {
            attempt: 12,
            ..local_first
        };
        assert_eq!(local_last.step_percent(), 70);

        let global_last = PropagationProgress {
            attempt: 6,
            max_attempts: 6,
            phase: PropagationPhase::Global,
            elapsed_ms: 0,
        };
        assert_eq!(global_last.step_percent(), 95);
    }
}
