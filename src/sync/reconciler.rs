//! Reconciliation Engine
//!
//! Compares stored service records with what the providers actually hold and
//! repairs drift. Inventories are fetched once per pass and shared by every
//! service in it.

use futures::future::try_join;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::matching::{exposed_subdomain, is_cleaner, match_dns_record, match_proxy_host};
use crate::error::{ExposeError, ExposeResult};
use crate::providers::ProviderSet;
use crate::store::ServiceStore;
use crate::types::{ConfigWarning, DnsRecord, ExposureSource, ProxyHost, ServiceRecord};

/// How much a pass is allowed to change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Existence and id drift plus subdomain adoption and config warnings
    Full,
    /// Existence and id drift only
    Existence,
}

/// Provider state for one pass; `None` means that provider is not configured
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub dns: Option<Vec<DnsRecord>>,
    pub proxy: Option<Vec<ProxyHost>>,
    pub claims: Claims,
}

/// Resource ids already stored on a service, mapped to that service's id
#[derive(Debug, Clone, Default)]
pub struct Claims {
    dns: HashMap<String, String>,
    proxy: HashMap<String, String>,
}

impl Claims {
    pub fn from_services(services: &[ServiceRecord]) -> Self {
        let mut claims = Self::default();
        for service in services {
            claims.update(service);
        }
        claims
    }

    /// Replace whatever `service` held with its current ids
    pub fn update(&mut self, service: &ServiceRecord) {
        self.dns.retain(|_, owner| *owner != service.id);
        self.proxy.retain(|_, owner| *owner != service.id);

        if let Some(id) = &service.dns_record_id {
            self.dns.insert(id.clone(), service.id.clone());
        }
        if let Some(id) = &service.proxy_host_id {
            self.proxy.insert(id.clone(), service.id.clone());
        }
    }

    fn dns_taken(&self, record_id: &str, service_id: &str) -> bool {
        self.dns.get(record_id).is_some_and(|owner| owner != service_id)
    }

    fn proxy_taken(&self, host_id: &str, service_id: &str) -> bool {
        self.proxy.get(host_id).is_some_and(|owner| owner != service_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Records that changed and were written back
    pub synced: usize,
    pub total: usize,
}

/// Reconcile one record against an inventory, returning the repaired copy
///
/// Pure: the caller decides whether the result differs and needs saving.
/// Any match counts towards existence, but ids are only taken from stored-id
/// or exact-domain matches, and never from resources claimed by another service.
pub fn reconcile(
    service: &ServiceRecord,
    inventory: &Inventory,
    base_domain: &str,
    mode: SyncMode,
) -> ServiceRecord {
    let mut next = service.clone();
    let dns_taken = |id: &str| inventory.claims.dns_taken(id, &service.id);
    let proxy_taken = |id: &str| inventory.claims.proxy_taken(id, &service.id);

    if mode == SyncMode::Full {
        if let Some(hosts) = inventory.proxy.as_deref() {
            let host = match_proxy_host(hosts, service, base_domain, &proxy_taken).map(|m| m.item);
            apply_proxy_drift(&mut next, host, base_domain);
        }
    }

    // Matched against the adopted subdomain, if any
    let dns_match = inventory
        .dns
        .as_deref()
        .map(|records| match_dns_record(records, &next, base_domain, &dns_taken));
    let proxy_match = inventory
        .proxy
        .as_deref()
        .map(|hosts| match_proxy_host(hosts, &next, base_domain, &proxy_taken));

    if let Some(found) = dns_match {
        next.dns_exists = Some(found.is_some());
    }
    if let Some(found) = proxy_match {
        next.proxy_exists = Some(found.is_some());
    }

    // Live means every configured provider holds a matching resource
    let configured = [dns_match.map(|m| m.is_some()), proxy_match.map(|m| m.is_some())];
    let live = if configured.iter().all(Option::is_none) {
        None
    } else {
        Some(configured.iter().flatten().all(|exists| *exists))
    };

    if let Some(live) = live {
        if let Some(found) = dns_match {
            next.dns_record_id = match found {
                Some(m) if live && m.kind.is_owned() => Some(m.item.id.clone()),
                _ => surviving_id(&service.dns_record_id, inventory.dns.as_deref(), |r| &r.id),
            };
        }
        if let Some(found) = proxy_match {
            next.proxy_host_id = match found {
                Some(m) if live && m.kind.is_owned() => Some(m.item.id.clone()),
                _ => surviving_id(&service.proxy_host_id, inventory.proxy.as_deref(), |h| &h.id),
            };
        }

        if live && !service.enabled {
            next.exposure_source = Some(ExposureSource::Discovered);
        }
        next.enabled = live;
    }

    next
}

/// Stored id, kept only while the provider still lists it
fn surviving_id<T>(
    stored: &Option<String>,
    inventory: Option<&[T]>,
    id_of: impl Fn(&T) -> &String,
) -> Option<String> {
    let items = inventory?;
    stored
        .as_ref()
        .filter(|id| items.iter().any(|item| id_of(item) == *id))
        .cloned()
}

fn apply_proxy_drift(service: &mut ServiceRecord, host: Option<&ProxyHost>, base_domain: &str) {
    let mut warnings = Vec::new();

    let discovered = host.and_then(|h| exposed_subdomain(h, base_domain));
    if let Some(discovered) = &discovered {
        if *discovered != service.subdomain {
            if is_cleaner(&service.subdomain, discovered) {
                info!(
                    service_id = %service.id,
                    from = %service.subdomain,
                    to = %discovered,
                    "Adopting cleaner subdomain from proxy"
                );
                service.subdomain = discovered.clone();
            } else {
                warnings.push(ConfigWarning::SubdomainMismatch);
            }
        }
    }
    service.exposed_subdomain = discovered;

    if let Some(host) = host {
        if host.forward_port != service.port {
            warnings.push(ConfigWarning::PortMismatch);
        }
    }

    service.set_config_warnings(warnings);
}

/// Runs reconciliation passes against the store and providers
pub struct SyncService {
    store: Arc<dyn ServiceStore>,
    providers: ProviderSet,
    base_domain: String,
}

impl SyncService {
    pub fn new(store: Arc<dyn ServiceStore>, providers: ProviderSet, base_domain: &str) -> Self {
        Self {
            store,
            providers,
            base_domain: base_domain.to_string(),
        }
    }

    /// Full reconciliation of one service
    pub async fn sync_service(&self, service_id: &str) -> ExposeResult<ServiceRecord> {
        let services = self.store.list().await.map_err(ExposeError::storage)?;
        let service = services
            .iter()
            .find(|s| s.id == service_id)
            .cloned()
            .ok_or_else(|| ExposeError::NotFound(service_id.to_string()))?;

        let inventory = self.fetch_inventory(&services).await?;
        self.apply(&service, &inventory, SyncMode::Full).await
    }

    /// Full reconciliation of several services sharing one inventory fetch
    ///
    /// Unknown ids are skipped.
    pub async fn sync_services(&self, service_ids: &[String]) -> ExposeResult<SyncSummary> {
        let services = self.store.list().await.map_err(ExposeError::storage)?;
        let mut inventory = self.fetch_inventory(&services).await?;
        let mut synced = 0;

        for service_id in service_ids {
            let Some(service) = services.iter().find(|s| &s.id == service_id) else {
                debug!(service_id = %service_id, "Skipping unknown service");
                continue;
            };

            let next = self.apply(service, &inventory, SyncMode::Full).await?;
            if next != *service {
                synced += 1;
            }
            inventory.claims.update(&next);
        }

        Ok(SyncSummary {
            synced,
            total: service_ids.len(),
        })
    }

    /// Existence and id drift check across every stored service
    pub async fn sync_all(&self) -> ExposeResult<SyncSummary> {
        let services = self.store.list().await.map_err(ExposeError::storage)?;
        let mut inventory = self.fetch_inventory(&services).await?;
        let mut synced = 0;

        for service in &services {
            let next = self.apply(service, &inventory, SyncMode::Existence).await?;
            if next != *service {
                synced += 1;
            }
            inventory.claims.update(&next);
        }

        info!(synced, total = services.len(), "Sync pass complete");
        Ok(SyncSummary {
            synced,
            total: services.len(),
        })
    }

    /// Reconcile and write back only if something changed
    async fn apply(
        &self,
        service: &ServiceRecord,
        inventory: &Inventory,
        mode: SyncMode,
    ) -> ExposeResult<ServiceRecord> {
        let mut next = reconcile(service, inventory, &self.base_domain, mode);
        if next == *service {
            return Ok(next);
        }

        debug!(
            service_id = %service.id,
            enabled = next.enabled,
            dns_exists = ?next.dns_exists,
            proxy_exists = ?next.proxy_exists,
            "Repairing drift"
        );
        next.touch();
        self.store.save(&next).await.map_err(ExposeError::storage)?;
        Ok(next)
    }

    async fn fetch_inventory(&self, services: &[ServiceRecord]) -> ExposeResult<Inventory> {
        let dns = async {
            match &self.providers.dns {
                Some(provider) => provider.list_records().await.map(Some).map_err(|e| {
                    warn!(provider = provider.name(), error = %e, "Failed to list DNS records");
                    ExposeError::provider("Failed to list DNS records", e)
                }),
                None => Ok(None),
            }
        };

        let proxy = async {
            match &self.providers.proxy {
                Some(provider) => provider.list_hosts().await.map(Some).map_err(|e| {
                    warn!(provider = provider.name(), error = %e, "Failed to list proxy hosts");
                    ExposeError::provider("Failed to list proxy hosts", e)
                }),
                None => Ok(None),
            }
        };

        let (dns, proxy) = try_join(dns, proxy).await?;
        Ok(Inventory {
            dns,
            proxy,
            claims: Claims::from_services(services),
        })
    }
}
