//! Expose Orchestrator
//!
//! Drives a service through the DNS phase and then the proxy phase, persists
//! the outcome in a single write and hands the service to reconciliation.
//! Also owns unexpose, the single-phase variants, subdomain migration and
//! certificate retries.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::progress::{ExposeAction, ExposeContext, OperationResult, Phase, ProgressSink};
use super::propagation::{DnsPropagationWaiter, PropagationOutcome, PropagationPhase};
use super::reachability::ReachabilityChecker;
use super::ssl::summarize_ssl_error;
use crate::error::{ExposeError, ExposeResult};
use crate::providers::{
    DnsProvider, NewDnsRecord, NewProxyHost, ProviderSet, ProxyHostUpdate, ProxyProvider,
    SslRetryOutcome,
};
use crate::store::ServiceStore;
use crate::sync::SyncService;
use crate::types::{full_domain, DnsRecordType, ExposureSource, ProxyHost, Scheme, ServiceRecord};

/// Deployment-wide exposure settings
#[derive(Debug, Clone)]
pub struct ExposeSettings {
    /// Zone every subdomain lives under
    pub base_domain: String,
    /// Address DNS records point at
    pub public_ip: String,
    /// Internal host the proxy forwards to
    pub target_host: String,
    /// Request certificates for new proxy hosts
    pub ssl: bool,
    pub dns_ttl: Option<u32>,
}

/// What the DNS phase left behind
struct DnsOutcome {
    record_id: String,
    propagation: PropagationOutcome,
}

/// What the proxy phase left behind
struct ProxyOutcome {
    host_id: String,
    ssl_pending: bool,
    ssl_error: Option<String>,
}

/// Result of one best-effort deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// No id was stored, nothing to delete
    NotPresent,
    Failed(String),
}

/// Returned by [`ExposeService::migrate_subdomain`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub domain: String,
    pub previous_subdomain: String,
    pub dns_record_id: Option<String>,
    pub proxy_host_id: Option<String>,
    pub ssl_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_error: Option<String>,
}

pub struct ExposeService {
    store: Arc<dyn ServiceStore>,
    providers: ProviderSet,
    settings: ExposeSettings,
    reachability: ReachabilityChecker,
    propagation: DnsPropagationWaiter,
    sync: SyncService,
}

impl ExposeService {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        providers: ProviderSet,
        settings: ExposeSettings,
        reachability: ReachabilityChecker,
        propagation: DnsPropagationWaiter,
    ) -> Self {
        let sync = SyncService::new(store.clone(), providers.clone(), &settings.base_domain);
        Self {
            store,
            providers,
            settings,
            reachability,
            propagation,
            sync,
        }
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn settings(&self) -> &ExposeSettings {
        &self.settings
    }

    /// Operator-initiated expose
    pub async fn expose(&self, service_id: &str) -> ExposeResult<OperationResult> {
        self.run_expose(service_id, ExposureSource::Manual, ProgressSink::disabled())
            .await
    }

    /// Expose on behalf of service discovery
    pub async fn expose_auto(&self, service_id: &str) -> ExposeResult<OperationResult> {
        self.run_expose(service_id, ExposureSource::Auto, ProgressSink::disabled())
            .await
    }

    pub async fn unexpose(&self, service_id: &str) -> ExposeResult<OperationResult> {
        self.run_unexpose(service_id, ProgressSink::disabled()).await
    }

    pub async fn expose_dns_only(&self, service_id: &str) -> ExposeResult<OperationResult> {
        self.run_expose_dns_only(service_id, ProgressSink::disabled())
            .await
    }

    pub async fn expose_proxy_only(&self, service_id: &str) -> ExposeResult<OperationResult> {
        self.run_expose_proxy_only(service_id, ProgressSink::disabled())
            .await
    }

    /// Full expose, reporting through `sink`
    pub async fn run_expose(
        &self,
        service_id: &str,
        source: ExposureSource,
        sink: ProgressSink,
    ) -> ExposeResult<OperationResult> {
        let mut ctx = ExposeContext::new(service_id, ExposeAction::Expose, sink);
        let outcome = self.expose_inner(&mut ctx, source).await;

        match outcome {
            Ok((result, touched_providers)) => {
                ctx.complete(result.clone());
                if touched_providers {
                    self.reconcile_quietly(service_id).await;
                }
                Ok(result)
            }
            Err(e) => Err(fail(&mut ctx, e)),
        }
    }

    async fn expose_inner(
        &self,
        ctx: &mut ExposeContext,
        source: ExposureSource,
    ) -> ExposeResult<(OperationResult, bool)> {
        let mut service = self.load(ctx.service_id()).await?;
        let domain = service.full_domain(&self.settings.base_domain);

        if self.providers.is_empty() && !service.has_resources() {
            return Err(ExposeError::NoProvidersConfigured);
        }

        info!(
            service_id = %service.id,
            domain = %domain,
            providers = %self.providers.describe(),
            "Exposing service"
        );

        let detected_scheme = self.detect_scheme(&service).await;
        let target_scheme = detected_scheme.or(service.scheme).unwrap_or(Scheme::Http);
        let mut touched_providers = false;

        let dns_record_id = match (service.dns_record_id.clone(), &self.providers.dns) {
            (Some(id), _) => {
                ctx.succeed(Phase::Dns, "Already configured");
                Some(id)
            }
            (None, None) => {
                ctx.succeed(Phase::Dns, "Skipped: no DNS provider configured");
                None
            }
            (None, Some(provider)) => {
                touched_providers = true;
                let outcome = self.dns_phase(ctx, provider.as_ref(), &service, &domain).await?;
                if !outcome.propagation.is_resolved() {
                    let err = ExposeError::PropagationTimeout(domain.clone());
                    return Err(self.keep_dns_record(&mut service, outcome.record_id, err).await);
                }
                Some(outcome.record_id)
            }
        };
        let dns_verified = touched_providers;

        // A short-circuited host keeps its recorded ssl state
        let proxy_host_id = match (service.proxy_host_id.clone(), &self.providers.proxy) {
            (Some(id), _) => {
                ctx.succeed(Phase::Proxy, "Already configured");
                Some(id)
            }
            (None, None) => {
                ctx.succeed(Phase::Proxy, "Skipped: no proxy provider configured");
                None
            }
            (None, Some(provider)) => {
                touched_providers = true;
                let outcome = match self
                    .proxy_phase(ctx, provider.as_ref(), &service, &domain, target_scheme, dns_verified)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        if let (true, Some(record_id)) = (dns_verified, dns_record_id.clone()) {
                            return Err(self.keep_dns_record(&mut service, record_id, e).await);
                        }
                        return Err(e);
                    }
                };
                service.ssl_pending = Some(outcome.ssl_pending);
                service.ssl_error = outcome.ssl_error;
                Some(outcome.host_id)
            }
        };

        if dns_record_id.is_none() && proxy_host_id.is_none() {
            return Err(ExposeError::NoProvidersConfigured);
        }

        service.dns_record_id = dns_record_id;
        service.proxy_host_id = proxy_host_id;
        service.exposure_source = Some(source);
        service.enabled = true;
        if let Some(scheme) = detected_scheme {
            service.scheme = Some(scheme);
        }
        self.persist(&mut service).await?;

        info!(
            service_id = %service.id,
            domain = %domain,
            dns_record_id = ?service.dns_record_id,
            proxy_host_id = ?service.proxy_host_id,
            ssl_pending = ?service.ssl_pending,
            "Service exposed"
        );

        Ok((exposed_result(&service, domain), touched_providers))
    }

    /// Full unexpose, reporting through `sink`
    pub async fn run_unexpose(
        &self,
        service_id: &str,
        sink: ProgressSink,
    ) -> ExposeResult<OperationResult> {
        let mut ctx = ExposeContext::new(service_id, ExposeAction::Unexpose, sink);
        match self.unexpose_inner(&mut ctx).await {
            Ok(result) => {
                ctx.complete(result.clone());
                self.reconcile_quietly(service_id).await;
                Ok(result)
            }
            Err(e) => Err(fail(&mut ctx, e)),
        }
    }

    async fn unexpose_inner(&self, ctx: &mut ExposeContext) -> ExposeResult<OperationResult> {
        let mut service = self.load(ctx.service_id()).await?;
        let domain = service.full_domain(&self.settings.base_domain);
        info!(service_id = %service.id, domain = %domain, "Unexposing service");

        let dns = self.delete_dns_record(ctx, &service).await;
        let proxy = self.delete_proxy_host(ctx, &service).await;

        if dns != DeleteOutcome::Deleted && proxy != DeleteOutcome::Deleted {
            debug!(service_id = %service.id, "Nothing was deleted at the providers");
        }

        service.dns_record_id = None;
        service.proxy_host_id = None;
        service.exposure_source = None;
        service.ssl_pending = None;
        service.ssl_error = None;
        service.enabled = false;
        self.persist(&mut service).await?;

        info!(service_id = %service.id, dns = ?dns, proxy = ?proxy, "Service unexposed");

        Ok(OperationResult {
            success: true,
            domain: Some(domain),
            ..Default::default()
        })
    }

    async fn delete_dns_record(&self, ctx: &mut ExposeContext, service: &ServiceRecord) -> DeleteOutcome {
        let Some(record_id) = &service.dns_record_id else {
            ctx.succeed(Phase::Dns, "No DNS record to remove");
            return DeleteOutcome::NotPresent;
        };
        let Some(provider) = &self.providers.dns else {
            let reason = format!("DNS record {} kept: no DNS provider configured", record_id);
            warn!(service_id = %service.id, record_id = %record_id, "No DNS provider to delete record");
            ctx.warn(Phase::Dns, "DNS record not removed", Some(reason.clone()));
            return DeleteOutcome::Failed(reason);
        };

        ctx.running(Phase::Dns, 50, "Deleting DNS record", None);
        match provider.delete_record(record_id).await {
            Ok(()) => {
                ctx.succeed(Phase::Dns, "DNS record deleted");
                DeleteOutcome::Deleted
            }
            Err(e) => {
                warn!(service_id = %service.id, record_id = %record_id, error = %e, "Failed to delete DNS record");
                let reason = format!("{:#}", e);
                ctx.warn(Phase::Dns, "Failed to delete DNS record", Some(reason.clone()));
                DeleteOutcome::Failed(reason)
            }
        }
    }

    async fn delete_proxy_host(&self, ctx: &mut ExposeContext, service: &ServiceRecord) -> DeleteOutcome {
        let Some(host_id) = &service.proxy_host_id else {
            ctx.succeed(Phase::Proxy, "No proxy host to remove");
            return DeleteOutcome::NotPresent;
        };
        let Some(provider) = &self.providers.proxy else {
            let reason = format!("Proxy host {} kept: no proxy provider configured", host_id);
            warn!(service_id = %service.id, host_id = %host_id, "No proxy provider to delete host");
            ctx.warn(Phase::Proxy, "Proxy host not removed", Some(reason.clone()));
            return DeleteOutcome::Failed(reason);
        };

        ctx.running(Phase::Proxy, 50, "Deleting proxy host", None);
        match provider.delete_host(host_id).await {
            Ok(()) => {
                ctx.succeed(Phase::Proxy, "Proxy host deleted");
                DeleteOutcome::Deleted
            }
            Err(e) => {
                warn!(service_id = %service.id, host_id = %host_id, error = %e, "Failed to delete proxy host");
                let reason = format!("{:#}", e);
                ctx.warn(Phase::Proxy, "Failed to delete proxy host", Some(reason.clone()));
                DeleteOutcome::Failed(reason)
            }
        }
    }

    /// DNS phase alone
    pub async fn run_expose_dns_only(
        &self,
        service_id: &str,
        sink: ProgressSink,
    ) -> ExposeResult<OperationResult> {
        let mut ctx = ExposeContext::new(service_id, ExposeAction::Expose, sink);
        match self.expose_dns_only_inner(&mut ctx).await {
            Ok(result) => {
                ctx.complete(result.clone());
                Ok(result)
            }
            Err(e) => Err(fail(&mut ctx, e)),
        }
    }

    async fn expose_dns_only_inner(&self, ctx: &mut ExposeContext) -> ExposeResult<OperationResult> {
        let mut service = self.load(ctx.service_id()).await?;
        if service.dns_record_id.is_some() {
            return Err(ExposeError::AlreadyExposed {
                service_id: service.id,
                phase: Phase::Dns,
            });
        }
        let provider = self
            .providers
            .dns
            .clone()
            .ok_or(ExposeError::NoProvidersConfigured)?;

        let domain = service.full_domain(&self.settings.base_domain);
        ctx.succeed(Phase::Proxy, "Not part of this operation");

        let outcome = self.dns_phase(ctx, provider.as_ref(), &service, &domain).await?;
        if !outcome.propagation.is_resolved() {
            let err = ExposeError::PropagationTimeout(domain.clone());
            return Err(self.keep_dns_record(&mut service, outcome.record_id, err).await);
        }

        service.dns_record_id = Some(outcome.record_id);
        mark_exposed(&mut service);
        self.persist(&mut service).await?;

        info!(service_id = %service.id, domain = %domain, "DNS exposed");
        Ok(exposed_result(&service, domain))
    }

    /// Proxy phase alone
    pub async fn run_expose_proxy_only(
        &self,
        service_id: &str,
        sink: ProgressSink,
    ) -> ExposeResult<OperationResult> {
        let mut ctx = ExposeContext::new(service_id, ExposeAction::Expose, sink);
        match self.expose_proxy_only_inner(&mut ctx).await {
            Ok(result) => {
                ctx.complete(result.clone());
                Ok(result)
            }
            Err(e) => Err(fail(&mut ctx, e)),
        }
    }

    async fn expose_proxy_only_inner(&self, ctx: &mut ExposeContext) -> ExposeResult<OperationResult> {
        let mut service = self.load(ctx.service_id()).await?;
        if service.proxy_host_id.is_some() {
            return Err(ExposeError::AlreadyExposed {
                service_id: service.id,
                phase: Phase::Proxy,
            });
        }
        let provider = self
            .providers
            .proxy
            .clone()
            .ok_or(ExposeError::NoProvidersConfigured)?;

        let domain = service.full_domain(&self.settings.base_domain);
        ctx.succeed(Phase::Dns, "Not part of this operation");

        let detected_scheme = self.detect_scheme(&service).await;
        let target_scheme = detected_scheme.or(service.scheme).unwrap_or(Scheme::Http);

        let outcome = self
            .proxy_phase(ctx, provider.as_ref(), &service, &domain, target_scheme, false)
            .await?;

        service.proxy_host_id = Some(outcome.host_id);
        service.ssl_pending = Some(outcome.ssl_pending);
        service.ssl_error = outcome.ssl_error;
        if let Some(scheme) = detected_scheme {
            service.scheme = Some(scheme);
        }
        mark_exposed(&mut service);
        self.persist(&mut service).await?;

        info!(service_id = %service.id, domain = %domain, "Proxy exposed");
        Ok(exposed_result(&service, domain))
    }

    /// Re-point exposure at the subdomain the proxy actually serves
    ///
    /// New resources are created and persisted before the old ones are
    /// removed, so the service stays reachable throughout.
    pub async fn migrate_subdomain(&self, service_id: &str) -> ExposeResult<MigrationResult> {
        let mut service = self.load(service_id).await?;
        let target = match &service.exposed_subdomain {
            Some(target) if *target != service.subdomain => target.clone(),
            _ => return Err(ExposeError::NothingToMigrate(service_id.to_string())),
        };
        if self.providers.is_empty() {
            return Err(ExposeError::NoProvidersConfigured);
        }

        let previous_subdomain = service.subdomain.clone();
        let old_dns_record_id = service.dns_record_id.clone();
        let old_proxy_host_id = service.proxy_host_id.clone();
        let domain = full_domain(&target, &self.settings.base_domain);

        info!(
            service_id = %service.id,
            from = %previous_subdomain,
            to = %target,
            "Migrating subdomain"
        );

        // 1. New resources, never reusing existing ids
        let new_record = match &self.providers.dns {
            Some(provider) => Some(
                provider
                    .create_record(&self.dns_request(&target))
                    .await
                    .map_err(|e| ExposeError::provider("Failed to create DNS record", e))?,
            ),
            None => None,
        };

        let new_host = match &self.providers.proxy {
            Some(provider) => {
                let request = self.proxy_request(&domain, &service, service.scheme.unwrap_or(Scheme::Http), false);
                match provider.create_host(&request).await {
                    Ok(host) => Some(host),
                    Err(e) => {
                        if let Some(record) = &new_record {
                            self.rollback_dns(&record.id).await;
                        }
                        return Err(ExposeError::provider("Failed to create proxy host", e));
                    }
                }
            }
            None => None,
        };

        // 2. Make the new state durable
        service.subdomain = target.clone();
        service.dns_record_id = new_record.as_ref().map(|r| r.id.clone());
        service.proxy_host_id = new_host.as_ref().map(|h| h.id.clone());
        service.ssl_pending = new_host.as_ref().map(|h| h.ssl_pending);
        service.ssl_error = new_host.as_ref().and_then(|h| h.ssl_error.clone());
        service.config_warnings = None;
        mark_exposed(&mut service);

        if let Err(e) = self.persist(&mut service).await {
            error!(service_id = %service_id, error = %e, "Persisting migration failed, removing new resources");
            if let Some(host) = &new_host {
                self.rollback_proxy(&host.id).await;
            }
            if let Some(record) = &new_record {
                self.rollback_dns(&record.id).await;
            }
            return Err(e);
        }

        // 3. Certificate retry, then retire the old resources
        if let (Some(host), Some(provider)) = (&new_host, &self.providers.proxy) {
            if host.ssl_pending {
                self.retry_ssl_for(&mut service, provider.as_ref(), &host.id, &domain)
                    .await;
            }
        }

        if let (Some(old_id), Some(provider)) = (&old_dns_record_id, &self.providers.dns) {
            if service.dns_record_id.as_ref() != Some(old_id) {
                if let Err(e) = provider.delete_record(old_id).await {
                    warn!(service_id = %service_id, record_id = %old_id, error = %e, "Failed to delete old DNS record");
                }
            }
        }
        if let (Some(old_id), Some(provider)) = (&old_proxy_host_id, &self.providers.proxy) {
            if service.proxy_host_id.as_ref() != Some(old_id) {
                if let Err(e) = provider.delete_host(old_id).await {
                    warn!(service_id = %service_id, host_id = %old_id, error = %e, "Failed to delete old proxy host");
                }
            }
        }

        info!(service_id = %service_id, domain = %domain, "Subdomain migrated");

        Ok(MigrationResult {
            domain,
            previous_subdomain,
            dns_record_id: service.dns_record_id.clone(),
            proxy_host_id: service.proxy_host_id.clone(),
            ssl_pending: service.ssl_pending.unwrap_or(false),
            ssl_error: service.ssl_error.clone(),
        })
    }

    /// Ask the proxy to issue the certificate again and record the outcome
    pub async fn retry_ssl(&self, service_id: &str) -> ExposeResult<SslRetryOutcome> {
        let mut service = self.load(service_id).await?;
        let host_id = service.proxy_host_id.clone().ok_or_else(|| ExposeError::NotExposed {
            service_id: service_id.to_string(),
            phase: Phase::Proxy,
        })?;
        let provider = self
            .providers
            .proxy
            .clone()
            .ok_or(ExposeError::NoProvidersConfigured)?;
        let domain = service.full_domain(&self.settings.base_domain);

        let outcome = provider
            .retry_ssl(&host_id, &domain)
            .await
            .map_err(|e| ExposeError::provider("Failed to retry certificate", e))?;

        service.ssl_pending = Some(!outcome.success);
        service.ssl_error = outcome.error.clone();
        self.persist(&mut service).await?;

        info!(service_id = %service_id, success = outcome.success, "Certificate retry finished");
        Ok(outcome)
    }

    async fn dns_phase(
        &self,
        ctx: &mut ExposeContext,
        provider: &dyn DnsProvider,
        service: &ServiceRecord,
        domain: &str,
    ) -> ExposeResult<DnsOutcome> {
        ctx.running(Phase::Dns, 5, "Checking for an existing DNS record", None);
        let existing = provider
            .find_by_hostname(domain)
            .await
            .map_err(|e| step_error(ctx, Phase::Dns, ExposeError::provider("Failed to look up DNS record", e)))?;

        let record = match existing {
            Some(record) => {
                info!(service_id = %service.id, record_id = %record.id, "Adopting existing DNS record");
                ctx.running(Phase::Dns, 25, "Using existing DNS record", Some(record.id.clone()));
                record
            }
            None => {
                ctx.running(Phase::Dns, 15, "Creating DNS record", Some(domain.to_string()));
                let record = provider
                    .create_record(&self.dns_request(&service.subdomain))
                    .await
                    .map_err(|e| step_error(ctx, Phase::Dns, ExposeError::provider("Failed to create DNS record", e)))?;
                ctx.running(Phase::Dns, 25, "DNS record created", Some(record.id.clone()));
                record
            }
        };

        let propagation = self
            .propagation
            .wait(domain, |progress| {
                let message = match progress.phase {
                    PropagationPhase::Local => "Waiting for DNS to resolve",
                    PropagationPhase::Global => "Checking public DNS",
                };
                let detail = format!("Attempt {}/{}", progress.attempt, progress.max_attempts);
                ctx.running(Phase::Dns, progress.step_percent(), message, Some(detail));
            })
            .await;

        match propagation {
            PropagationOutcome::Global => ctx.succeed(Phase::Dns, "DNS record propagated"),
            PropagationOutcome::LocalOnly => ctx.succeed(Phase::Dns, "DNS record propagated locally"),
            PropagationOutcome::NotResolved => ctx.fail_step(
                Phase::Dns,
                "DNS did not propagate",
                Some(format!("{} never resolved", domain)),
            ),
        }

        Ok(DnsOutcome {
            record_id: record.id,
            propagation,
        })
    }

    async fn proxy_phase(
        &self,
        ctx: &mut ExposeContext,
        provider: &dyn ProxyProvider,
        service: &ServiceRecord,
        domain: &str,
        scheme: Scheme,
        dns_verified: bool,
    ) -> ExposeResult<ProxyOutcome> {
        ctx.running(Phase::Proxy, 5, "Checking for an existing proxy host", None);
        let existing = provider
            .find_by_domain(domain)
            .await
            .map_err(|e| step_error(ctx, Phase::Proxy, ExposeError::provider("Failed to look up proxy host", e)))?;

        let host = match existing {
            Some(host) => {
                info!(service_id = %service.id, host_id = %host.id, "Adopting existing proxy host");
                let update = self.correction_for(&host, service, scheme);
                if update.is_empty() {
                    host
                } else {
                    ctx.running(Phase::Proxy, 30, "Updating proxy host target", Some(host.id.clone()));
                    provider
                        .update_host(&host.id, &update)
                        .await
                        .map_err(|e| step_error(ctx, Phase::Proxy, ExposeError::provider("Failed to update proxy host", e)))?
                }
            }
            None => {
                let message = if self.settings.ssl {
                    "Creating proxy host and requesting certificate"
                } else {
                    "Creating proxy host"
                };
                ctx.running(Phase::Proxy, 30, message, Some(domain.to_string()));
                let request = self.proxy_request(domain, service, scheme, dns_verified);
                provider
                    .create_host(&request)
                    .await
                    .map_err(|e| step_error(ctx, Phase::Proxy, ExposeError::provider("Failed to create proxy host", e)))?
            }
        };

        if host.ssl_pending {
            let raw = host.ssl_error.clone().unwrap_or_default();
            warn!(service_id = %service.id, host_id = %host.id, error = %raw, "Certificate pending");
            ctx.warn(
                Phase::Proxy,
                "Proxy host created, SSL certificate pending",
                Some(summarize_ssl_error(&raw)),
            );
        } else if self.settings.ssl {
            ctx.running(Phase::Proxy, 80, "Verifying HTTPS reachability", Some(domain.to_string()));
            if self.reachability.verify_https_reachability(domain).await {
                ctx.succeed(Phase::Proxy, "Proxy host ready");
            } else {
                ctx.warn(
                    Phase::Proxy,
                    "Proxy host created, HTTPS not yet reachable",
                    Some(format!("https://{} did not answer", domain)),
                );
            }
        } else {
            ctx.succeed(Phase::Proxy, "Proxy host ready");
        }

        Ok(ProxyOutcome {
            host_id: host.id,
            ssl_pending: host.ssl_pending,
            ssl_error: host.ssl_error,
        })
    }

    /// Fields where an adopted host disagrees with the service
    fn correction_for(&self, host: &ProxyHost, service: &ServiceRecord, scheme: Scheme) -> ProxyHostUpdate {
        ProxyHostUpdate {
            target_host: (host.forward_host != self.settings.target_host)
                .then(|| self.settings.target_host.clone()),
            target_port: (host.forward_port != service.port).then_some(service.port),
            target_scheme: (host.forward_scheme != scheme).then_some(scheme),
        }
    }

    fn dns_request(&self, subdomain: &str) -> NewDnsRecord {
        NewDnsRecord {
            subdomain: subdomain.to_string(),
            ip: self.settings.public_ip.clone(),
            record_type: Some(DnsRecordType::A),
            ttl: self.settings.dns_ttl,
        }
    }

    fn proxy_request(&self, domain: &str, service: &ServiceRecord, scheme: Scheme, skip_dns_wait: bool) -> NewProxyHost {
        NewProxyHost {
            domain: domain.to_string(),
            target_host: self.settings.target_host.clone(),
            target_port: service.port,
            target_scheme: scheme,
            ssl: self.settings.ssl,
            skip_dns_wait,
        }
    }

    /// Advisory probe; `None` keeps the recorded scheme
    async fn detect_scheme(&self, service: &ServiceRecord) -> Option<Scheme> {
        let detected = self
            .reachability
            .test_backend_scheme(&self.settings.target_host, service.port, service.scheme)
            .await;

        if detected.is_some() && detected != service.scheme {
            info!(service_id = %service.id, scheme = ?detected, previous = ?service.scheme, "Backend scheme changed");
        }
        detected
    }

    /// Persist a created-but-unresolved record so it is not orphaned
    /// Store a DNS record created by a failed expose so unexpose and retries can find it
    async fn keep_dns_record(
        &self,
        service: &mut ServiceRecord,
        record_id: String,
        err: ExposeError,
    ) -> ExposeError {
        service.dns_record_id = Some(record_id);
        if let Err(e) = self.persist(service).await {
            error!(service_id = %service.id, error = %e, "Failed to record DNS record of failed expose");
        }
        err
    }

    async fn retry_ssl_for(
        &self,
        service: &mut ServiceRecord,
        provider: &dyn ProxyProvider,
        host_id: &str,
        domain: &str,
    ) {
        match provider.retry_ssl(host_id, domain).await {
            Ok(outcome) => {
                service.ssl_pending = Some(!outcome.success);
                service.ssl_error = outcome.error;
                if let Err(e) = self.persist(service).await {
                    warn!(service_id = %service.id, error = %e, "Failed to record certificate retry");
                }
            }
            Err(e) => warn!(service_id = %service.id, host_id = %host_id, error = %e, "Certificate retry failed"),
        }
    }

    async fn rollback_dns(&self, record_id: &str) {
        if let Some(provider) = &self.providers.dns {
            if let Err(e) = provider.delete_record(record_id).await {
                error!(record_id = %record_id, error = %e, "Rollback left an orphaned DNS record");
            }
        }
    }

    async fn rollback_proxy(&self, host_id: &str) {
        if let Some(provider) = &self.providers.proxy {
            if let Err(e) = provider.delete_host(host_id).await {
                error!(host_id = %host_id, error = %e, "Rollback left an orphaned proxy host");
            }
        }
    }

    async fn reconcile_quietly(&self, service_id: &str) {
        if let Err(e) = self.sync.sync_service(service_id).await {
            warn!(service_id = %service_id, error = %e, "Post-operation reconciliation failed");
        }
    }

    async fn load(&self, service_id: &str) -> ExposeResult<ServiceRecord> {
        self.store
            .get(service_id)
            .await
            .map_err(ExposeError::storage)?
            .ok_or_else(|| ExposeError::NotFound(service_id.to_string()))
    }

    async fn persist(&self, service: &mut ServiceRecord) -> ExposeResult<()> {
        service.touch();
        self.store.save(service).await.map_err(ExposeError::storage)
    }
}

/// Mark the failed step (if one is still open) and pass the error through
fn step_error(ctx: &mut ExposeContext, phase: Phase, err: ExposeError) -> ExposeError {
    ctx.fail_step(phase, "Failed", Some(err.to_string()));
    err
}

/// Send the terminal `error` event
fn fail(ctx: &mut ExposeContext, err: ExposeError) -> ExposeError {
    warn!(service_id = %ctx.service_id(), error = %err, "Workflow failed");
    ctx.fail(&err.to_string());
    err
}

fn mark_exposed(service: &mut ServiceRecord) {
    service.enabled = true;
    if service.exposure_source.is_none() {
        service.exposure_source = Some(ExposureSource::Manual);
    }
}

fn exposed_result(service: &ServiceRecord, domain: String) -> OperationResult {
    OperationResult {
        success: true,
        domain: Some(domain),
        dns_record_id: service.dns_record_id.clone(),
        proxy_host_id: service.proxy_host_id.clone(),
        ssl_pending: service.ssl_pending,
        ssl_error: service.ssl_error.clone(),
        error: None,
    }
}
