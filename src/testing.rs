//! In-process fakes for providers, storage, resolvers and probes
//!
//! Every fake writes to a shared `Journal` so tests can assert the order of
//! calls across providers and the store.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::expose::propagation::{DnsPropagationWaiter, PropagationConfig, Resolver};
use crate::expose::reachability::{Prober, ReachabilityChecker, ReachabilityConfig};
use crate::expose::{ExposeService, ExposeSettings};
use crate::providers::{
    DnsProvider, NewDnsRecord, NewProxyHost, ProviderSet, ProxyHostUpdate, ProxyProvider,
    SslRetryOutcome,
};
use crate::store::{MemoryStore, ServiceStore};
use crate::types::{full_domain, normalize_hostname, DnsRecord, DnsRecordType, ProxyHost, ServiceRecord};

pub const BASE_DOMAIN: &str = "example.com";
pub const PUBLIC_IP: &str = "203.0.113.9";
pub const TARGET_HOST: &str = "192.168.1.10";

/// Ordered log of calls shared between fakes
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Position of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub struct FakeDns {
    records: Mutex<Vec<DnsRecord>>,
    journal: Journal,
    next_id: AtomicU32,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    fail_list: AtomicBool,
}

impl FakeDns {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            journal,
            next_id: AtomicU32::new(1),
            fail_create: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
        })
    }

    pub fn seed(&self, record: DnsRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn records(&self) -> Vec<DnsRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    fn name(&self) -> &str {
        "fake-dns"
    }

    async fn create_record(&self, request: &NewDnsRecord) -> Result<DnsRecord> {
        self.journal.push(format!("dns.create {}", request.subdomain));
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("HTTP 403: zone is locked");
        }

        let record = DnsRecord {
            id: format!("dns-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            name: full_domain(&request.subdomain, BASE_DOMAIN),
            record_type: request.record_type.unwrap_or(DnsRecordType::A),
            content: request.ip.clone(),
            ttl: request.ttl.unwrap_or(1),
        };
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        self.journal.push(format!("dns.delete {}", record_id));
        if self.fail_delete.load(Ordering::SeqCst) {
            bail!("HTTP 500: delete failed");
        }
        self.records.lock().unwrap().retain(|r| r.id != record_id);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        self.journal.push("dns.list");
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(anyhow!("HTTP 503: service unavailable"));
        }
        Ok(self.records())
    }

    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<DnsRecord>> {
        self.journal.push(format!("dns.find {}", hostname));
        let wanted = normalize_hostname(hostname);
        Ok(self
            .records()
            .into_iter()
            .find(|r| r.record_type == DnsRecordType::A && normalize_hostname(&r.name) == wanted))
    }
}

pub struct FakeProxy {
    hosts: Mutex<Vec<ProxyHost>>,
    journal: Journal,
    next_id: AtomicU32,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    ssl_error_on_create: Mutex<Option<String>>,
}

impl FakeProxy {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(Vec::new()),
            journal,
            next_id: AtomicU32::new(1),
            fail_create: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            ssl_error_on_create: Mutex::new(None),
        })
    }

    pub fn seed(&self, host: ProxyHost) {
        self.hosts.lock().unwrap().push(host);
    }

    pub fn hosts(&self) -> Vec<ProxyHost> {
        self.hosts.lock().unwrap().clone()
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    /// New hosts come back with TLS pending and this error
    pub fn ssl_fails_with(&self, error: &str) {
        *self.ssl_error_on_create.lock().unwrap() = Some(error.to_string());
    }
}

#[async_trait]
impl ProxyProvider for FakeProxy {
    fn name(&self) -> &str {
        "fake-proxy"
    }

    async fn create_host(&self, request: &NewProxyHost) -> Result<ProxyHost> {
        self.journal.push(format!("proxy.create {}", request.domain));
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("HTTP 500: proxy host creation failed");
        }

        let ssl_error = if request.ssl {
            self.ssl_error_on_create.lock().unwrap().clone()
        } else {
            None
        };
        let host = ProxyHost {
            id: format!("proxy-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            domain_names: vec![request.domain.clone()],
            forward_host: request.target_host.clone(),
            forward_port: request.target_port,
            forward_scheme: request.target_scheme,
            ssl_pending: ssl_error.is_some(),
            ssl_error,
        };
        self.hosts.lock().unwrap().push(host.clone());
        Ok(host)
    }

    async fn update_host(&self, host_id: &str, update: &ProxyHostUpdate) -> Result<ProxyHost> {
        self.journal.push(format!("proxy.update {}", host_id));
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .iter_mut()
            .find(|h| h.id == host_id)
            .ok_or_else(|| anyhow!("HTTP 404: proxy host {} not found", host_id))?;

        if let Some(target_host) = &update.target_host {
            host.forward_host = target_host.clone();
        }
        if let Some(port) = update.target_port {
            host.forward_port = port;
        }
        if let Some(scheme) = update.target_scheme {
            host.forward_scheme = scheme;
        }
        Ok(host.clone())
    }

    async fn delete_host(&self, host_id: &str) -> Result<()> {
        self.journal.push(format!("proxy.delete {}", host_id));
        if self.fail_delete.load(Ordering::SeqCst) {
            bail!("HTTP 500: delete failed");
        }
        self.hosts.lock().unwrap().retain(|h| h.id != host_id);
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<ProxyHost>> {
        self.journal.push("proxy.list");
        Ok(self.hosts())
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<ProxyHost>> {
        self.journal.push(format!("proxy.find {}", domain));
        Ok(self.hosts().into_iter().find(|h| h.serves(domain)))
    }

    async fn retry_ssl(&self, host_id: &str, _domain: &str) -> Result<SslRetryOutcome> {
        self.journal.push(format!("proxy.retry_ssl {}", host_id));
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(host) = hosts.iter_mut().find(|h| h.id == host_id) {
            host.ssl_pending = false;
            host.ssl_error = None;
        }
        Ok(SslRetryOutcome {
            success: true,
            error: None,
        })
    }
}

/// Memory store that journals saves and can fail on demand
pub struct FlakyStore {
    inner: MemoryStore,
    journal: Journal,
    fail_saves: AtomicBool,
}

impl FlakyStore {
    pub fn new(journal: Journal, services: Vec<ServiceRecord>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::with_services(services),
            journal,
            fail_saves: AtomicBool::new(false),
        })
    }

    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceStore for FlakyStore {
    async fn get(&self, id: &str) -> Result<Option<ServiceRecord>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>> {
        self.inner.list().await
    }

    async fn save(&self, service: &ServiceRecord) -> Result<()> {
        self.journal.push(format!("store.save {}", service.id));
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.save(service).await
    }

    async fn insert(&self, service: ServiceRecord) -> Result<()> {
        self.inner.insert(service).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }
}

/// Resolver with a fixed answer
pub struct StaticResolver(pub bool);

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolves(&self, _domain: &str) -> bool {
        self.0
    }
}

/// Prober answering every URL the same way
pub struct StubProber(pub Option<u16>);

#[async_trait]
impl Prober for StubProber {
    async fn head(&self, _url: &str, _timeout: Duration) -> Option<u16> {
        self.0
    }
}

pub fn providers(dns: Option<Arc<FakeDns>>, proxy: Option<Arc<FakeProxy>>) -> ProviderSet {
    ProviderSet::new(
        dns.map(|d| d as Arc<dyn DnsProvider>),
        proxy.map(|p| p as Arc<dyn ProxyProvider>),
    )
}

pub fn settings() -> ExposeSettings {
    ExposeSettings {
        base_domain: BASE_DOMAIN.to_string(),
        public_ip: PUBLIC_IP.to_string(),
        target_host: TARGET_HOST.to_string(),
        ssl: true,
        dns_ttl: None,
    }
}

pub fn waiter(local: bool, global: bool) -> DnsPropagationWaiter {
    DnsPropagationWaiter::with_resolvers(
        Arc::new(StaticResolver(local)),
        Arc::new(StaticResolver(global)),
        PropagationConfig {
            local_attempts: 3,
            local_interval: Duration::ZERO,
            global_attempts: 2,
            global_interval: Duration::ZERO,
        },
    )
}

pub fn checker(status: Option<u16>) -> ReachabilityChecker {
    ReachabilityChecker::new(
        Arc::new(StubProber(status)),
        ReachabilityConfig {
            https_attempts: 2,
            https_interval: Duration::ZERO,
            ..Default::default()
        },
    )
}

/// Fakes wired into an `ExposeService`, all sharing one journal
pub struct Harness {
    pub journal: Journal,
    pub dns: Arc<FakeDns>,
    pub proxy: Arc<FakeProxy>,
    pub store: Arc<FlakyStore>,
}

impl Harness {
    pub fn new(services: Vec<ServiceRecord>) -> Self {
        let journal = Journal::default();
        Self {
            dns: FakeDns::new(journal.clone()),
            proxy: FakeProxy::new(journal.clone()),
            store: FlakyStore::new(journal.clone(), services),
            journal,
        }
    }

    /// Both providers, resolving DNS, reachable HTTPS
    pub fn service(&self) -> ExposeService {
        self.service_with(
            providers(Some(self.dns.clone()), Some(self.proxy.clone())),
            waiter(true, true),
            checker(Some(200)),
        )
    }

    pub fn service_with(
        &self,
        providers: ProviderSet,
        propagation: DnsPropagationWaiter,
        reachability: ReachabilityChecker,
    ) -> ExposeService {
        ExposeService::new(self.store.clone(), providers, settings(), reachability, propagation)
    }

    pub async fn stored(&self, id: &str) -> ServiceRecord {
        self.store.get(id).await.unwrap().unwrap()
    }
}
