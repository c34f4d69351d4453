//! Matching Rules
//!
//! How a service is paired with provider resources when ids alone do not
//! settle it, and when a discovered subdomain is clean enough to adopt.

use crate::types::{
    normalize_hostname, strip_base_domain, DnsRecord, DnsRecordType, ProxyHost, ServiceRecord,
};

/// Lowercase, with anything but letters, digits, `-` and `_` turned into `-`
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Leftmost part of a FQDN relative to the base domain
pub fn host_label(fqdn: &str, base_domain: &str) -> String {
    strip_base_domain(fqdn, base_domain).unwrap_or_else(|| {
        normalize_hostname(fqdn)
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string()
    })
}

/// Label equals, contains, or has a `-`/`_` token equal to the service name
pub fn label_matches_name(label: &str, name: &str) -> bool {
    if name.is_empty() || label.is_empty() {
        return false;
    }

    label == name || label.contains(name) || label.split(['-', '_']).any(|token| token == name)
}

/// How a resource was paired with a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    StoredId,
    Exact,
    Fuzzy,
    Port,
}

impl MatchKind {
    /// Only stored-id and exact-domain matches identify the service's own resource
    pub fn is_owned(self) -> bool {
        matches!(self, MatchKind::StoredId | MatchKind::Exact)
    }
}

#[derive(Debug)]
pub struct Matched<'a, T> {
    pub item: &'a T,
    pub kind: MatchKind,
}

impl<T> Clone for Matched<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Matched<'_, T> {}

impl<'a, T> Matched<'a, T> {
    fn new(item: &'a T, kind: MatchKind) -> Self {
        Self { item, kind }
    }
}

/// Pick the DNS record belonging to `service`
///
/// Order: stored record id, exact FQDN `A` record, fuzzy name match on `A`
/// records. Records for which `taken` is true belong to another service and
/// are only reachable through the stored id.
pub fn match_dns_record<'a>(
    records: &'a [DnsRecord],
    service: &ServiceRecord,
    base_domain: &str,
    taken: impl Fn(&str) -> bool,
) -> Option<Matched<'a, DnsRecord>> {
    if let Some(id) = &service.dns_record_id {
        if let Some(record) = records.iter().find(|r| &r.id == id) {
            return Some(Matched::new(record, MatchKind::StoredId));
        }
    }

    let domain = service.full_domain(base_domain);
    let taken = &taken;
    let candidates = || {
        records
            .iter()
            .filter(move |r| r.record_type == DnsRecordType::A && !taken(r.id.as_str()))
    };

    if let Some(record) = candidates().find(|r| normalize_hostname(&r.name) == domain) {
        return Some(Matched::new(record, MatchKind::Exact));
    }

    let name = normalize_name(&service.name);
    candidates()
        .find(|r| label_matches_name(&host_label(&r.name, base_domain), &name))
        .map(|record| Matched::new(record, MatchKind::Fuzzy))
}

/// Pick the proxy host belonging to `service`
///
/// Order: stored host id, exact domain, fuzzy name match, same forward port.
/// Hosts for which `taken` is true are skipped as in [`match_dns_record`].
pub fn match_proxy_host<'a>(
    hosts: &'a [ProxyHost],
    service: &ServiceRecord,
    base_domain: &str,
    taken: impl Fn(&str) -> bool,
) -> Option<Matched<'a, ProxyHost>> {
    if let Some(id) = &service.proxy_host_id {
        if let Some(host) = hosts.iter().find(|h| &h.id == id) {
            return Some(Matched::new(host, MatchKind::StoredId));
        }
    }

    let taken = &taken;
    let candidates = || hosts.iter().filter(move |h| !taken(h.id.as_str()));

    let domain = service.full_domain(base_domain);
    if let Some(host) = candidates().find(|h| h.serves(&domain)) {
        return Some(Matched::new(host, MatchKind::Exact));
    }

    let name = normalize_name(&service.name);
    if let Some(host) = candidates().find(|h| {
        h.domain_names
            .iter()
            .any(|d| label_matches_name(&host_label(d, base_domain), &name))
    }) {
        return Some(Matched::new(host, MatchKind::Fuzzy));
    }

    candidates()
        .find(|h| h.forward_port == service.port)
        .map(|host| Matched::new(host, MatchKind::Port))
}

/// Subdomain a proxy host is actually published under
pub fn exposed_subdomain(host: &ProxyHost, base_domain: &str) -> Option<String> {
    host.domain_names
        .iter()
        .find_map(|d| strip_base_domain(d, base_domain))
}

/// Whether `discovered` should silently replace `current`
///
/// Strictly shorter, or drops an `ix-` prefix, or `current` repeats a token.
pub fn is_cleaner(current: &str, discovered: &str) -> bool {
    if discovered.is_empty() {
        return false;
    }

    discovered.len() < current.len()
        || (current.starts_with("ix-") && !discovered.starts_with("ix-"))
        || has_duplicate_tokens(current)
}

fn has_duplicate_tokens(subdomain: &str) -> bool {
    let tokens: Vec<&str> = subdomain.split('-').filter(|t| !t.is_empty()).collect();
    tokens
        .iter()
        .enumerate()
        .any(|(i, token)| tokens[i + 1..].contains(token))
}
