//! Service Exposure Types
//!
//! Durable service records plus read-only projections of what the DNS and
//! proxy providers currently hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal protocol spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of an exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureSource {
    /// Operator pressed "expose"
    Manual,
    /// Exposed by the discovery collaborator
    Auto,
    /// Found already live at the providers during reconciliation
    Discovered,
}

/// Drift warnings raised by reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigWarning {
    PortMismatch,
    SubdomainMismatch,
}

/// DNS record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    A,
    #[allow(clippy::upper_case_acronyms)]
    AAAA,
    #[allow(clippy::upper_case_acronyms)]
    CNAME,
    #[allow(clippy::upper_case_acronyms)]
    TXT,
    MX,
    NS,
    /// Anything else the provider lists (SRV, CAA, ...)
    #[serde(other)]
    Other,
}

impl std::fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsRecordType::A => write!(f, "A"),
            DnsRecordType::AAAA => write!(f, "AAAA"),
            DnsRecordType::CNAME => write!(f, "CNAME"),
            DnsRecordType::TXT => write!(f, "TXT"),
            DnsRecordType::MX => write!(f, "MX"),
            DnsRecordType::NS => write!(f, "NS"),
            DnsRecordType::Other => write!(f, "OTHER"),
        }
    }
}

/// One exposable internal service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub id: String,
    /// Display name, also used for fuzzy matching against provider inventories
    pub name: String,
    /// Desired subdomain label (not a FQDN)
    pub subdomain: String,
    /// Internal port
    pub port: u16,
    /// Internal protocol, `None` until detected
    #[serde(default)]
    pub scheme: Option<Scheme>,
    /// Whether the service should currently be exposed
    #[serde(default)]
    pub enabled: bool,
    /// `manual`, `docker`, ...
    pub source: String,
    /// External correlation key (container id, ...)
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub dns_record_id: Option<String>,
    #[serde(default)]
    pub proxy_host_id: Option<String>,
    #[serde(default)]
    pub exposure_source: Option<ExposureSource>,
    /// Last-known presence of a DNS record at the provider
    #[serde(default)]
    pub dns_exists: Option<bool>,
    /// Last-known presence of a proxy host at the provider
    #[serde(default)]
    pub proxy_exists: Option<bool>,
    /// Subdomain actually observed at the proxy
    #[serde(default)]
    pub exposed_subdomain: Option<String>,
    #[serde(default)]
    pub ssl_pending: Option<bool>,
    #[serde(default)]
    pub ssl_error: Option<String>,
    /// Never `Some(vec![])`; see [`ServiceRecord::set_config_warnings`]
    #[serde(default)]
    pub config_warnings: Option<Vec<ConfigWarning>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// Create a manually entered service
    pub fn new(name: &str, subdomain: &str, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            subdomain: subdomain.to_string(),
            port,
            scheme: None,
            enabled: false,
            source: "manual".to_string(),
            source_id: None,
            dns_record_id: None,
            proxy_host_id: None,
            exposure_source: None,
            dns_exists: None,
            proxy_exists: None,
            exposed_subdomain: None,
            ssl_pending: None,
            ssl_error: None,
            config_warnings: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fully qualified domain this service should be reachable on
    pub fn full_domain(&self, base_domain: &str) -> String {
        full_domain(&self.subdomain, base_domain)
    }

    pub fn has_resources(&self) -> bool {
        self.dns_record_id.is_some() || self.proxy_host_id.is_some()
    }

    /// Store warnings, collapsing an empty list to `None`
    pub fn set_config_warnings(&mut self, warnings: Vec<ConfigWarning>) {
        let mut unique: Vec<ConfigWarning> = Vec::with_capacity(warnings.len());
        for warning in warnings {
            if !unique.contains(&warning) {
                unique.push(warning);
            }
        }

        self.config_warnings = if unique.is_empty() { None } else { Some(unique) };
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A DNS record as listed by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    /// Fully qualified name
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    pub content: String,
    pub ttl: u32,
}

/// A reverse-proxy host rule as listed by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHost {
    pub id: String,
    pub domain_names: Vec<String>,
    pub forward_host: String,
    pub forward_port: u16,
    pub forward_scheme: Scheme,
    /// Route exists but TLS issuance has not succeeded
    #[serde(default)]
    pub ssl_pending: bool,
    #[serde(default)]
    pub ssl_error: Option<String>,
}

impl ProxyHost {
    /// Whether this host answers for `domain`
    pub fn serves(&self, domain: &str) -> bool {
        let wanted = normalize_hostname(domain);
        self.domain_names
            .iter()
            .any(|d| normalize_hostname(d) == wanted)
    }
}

/// Build `subdomain.base_domain` unless `subdomain` is already suffixed
pub fn full_domain(subdomain: &str, base_domain: &str) -> String {
    let sub = normalize_hostname(subdomain);
    let base = normalize_hostname(base_domain);

    if base.is_empty() || sub == base || sub.ends_with(&format!(".{}", base)) {
        sub
    } else {
        format!("{}.{}", sub, base)
    }
}

/// Lowercase and drop a trailing dot
pub fn normalize_hostname(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Strip `.base_domain` from a FQDN; `None` if it lives outside the zone
pub fn strip_base_domain(domain: &str, base_domain: &str) -> Option<String> {
    let domain = normalize_hostname(domain);
    let suffix = format!(".{}", normalize_hostname(base_domain));

    domain
        .strip_suffix(&suffix)
        .filter(|label| !label.is_empty())
        .map(|label| label.to_string())
}
