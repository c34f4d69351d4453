//! Cloudflare DNS Provider
//!
//! `DnsProvider` over the Cloudflare v4 REST API, scoped to one zone.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{DnsProvider, NewDnsRecord};
use crate::types::{full_domain, DnsRecord, DnsRecordType};

const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const PAGE_SIZE: u32 = 1000;
const RECORD_COMMENT: &str = "Managed by expose-engine";

/// Cloudflare API response wrapper
#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    page: u32,
    total_pages: u32,
}

/// Request to create a DNS record
#[derive(Debug, Serialize)]
struct DnsRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: DnsRecordType,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
    comment: &'a str,
}

/// Cloudflare DNS provider bound to a single zone
pub struct CloudflareDnsProvider {
    http_client: Client,
    api_base: String,
    api_token: String,
    zone_id: String,
    /// Zone apex, used to build FQDNs for new records
    zone_name: String,
}

impl CloudflareDnsProvider {
    pub fn new(api_token: String, zone_id: String, zone_name: String) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            api_base: CLOUDFLARE_API_BASE.to_string(),
            api_token,
            zone_id,
            zone_name,
        })
    }

    /// Point the client at a different API root
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.api_base, self.zone_id)
    }

    async fn list_page(&self, page: u32) -> Result<(Vec<DnsRecord>, Option<ResultInfo>)> {
        let url = format!("{}?per_page={}&page={}", self.records_url(), PAGE_SIZE, page);

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to call Cloudflare API")?;

        let body: CloudflareResponse<Vec<DnsRecord>> =
            parse_response(response, "list DNS records").await?;

        Ok((body.result.unwrap_or_default(), body.result_info))
    }
}

/// Decode the envelope, folding HTTP status and vendor errors into one message
async fn parse_response<T: DeserializeOwned>(
    response: Response,
    action: &str,
) -> Result<CloudflareResponse<T>> {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    let body: CloudflareResponse<T> = match serde_json::from_str(&text) {
        Ok(body) => body,
        Err(_) => anyhow::bail!("Cloudflare {} failed ({}): {}", action, status, text),
    };

    if !status.is_success() || !body.success {
        let errors: Vec<String> = body
            .errors
            .iter()
            .map(|e| format!("{} (code {})", e.message, e.code))
            .collect();
        anyhow::bail!("Cloudflare {} failed ({}): {}", action, status, errors.join(", "));
    }

    Ok(body)
}

#[async_trait]
impl DnsProvider for CloudflareDnsProvider {
    fn name(&self) -> &str {
        "cloudflare"
    }

    async fn create_record(&self, request: &NewDnsRecord) -> Result<DnsRecord> {
        let name = full_domain(&request.subdomain, &self.zone_name);
        let body = DnsRecordRequest {
            record_type: request.record_type.unwrap_or(DnsRecordType::A),
            name: &name,
            content: &request.ip,
            ttl: request.ttl.unwrap_or(1), // 1 = automatic
            // Not proxied: the reverse proxy needs the direct IP for ACME validation
            proxied: false,
            comment: RECORD_COMMENT,
        };

        info!(record = %name, content = %request.ip, "Creating Cloudflare DNS record");

        let response = self
            .http_client
            .post(self.records_url())
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .context("Failed to call Cloudflare API")?;

        let result: CloudflareResponse<DnsRecord> =
            parse_response(response, "create DNS record").await?;

        result.result.context("No record in response")
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        let url = format!("{}/{}", self.records_url(), urlencoding::encode(record_id));

        let response = self
            .http_client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to call Cloudflare API")?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(record_id = %record_id, "DNS record already gone");
            return Ok(());
        }

        parse_response::<serde_json::Value>(response, "delete DNS record").await?;
        info!(record_id = %record_id, "Deleted Cloudflare DNS record");
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let (batch, info) = self.list_page(page).await?;
            records.extend(batch);

            match info {
                Some(info) if info.page < info.total_pages => page = info.page + 1,
                _ => break,
            }
        }

        debug!(count = records.len(), zone_id = %self.zone_id, "Listed Cloudflare DNS records");
        Ok(records)
    }

    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<DnsRecord>> {
        let name = full_domain(hostname, &self.zone_name);
        let url = format!(
            "{}?name={}&type=A",
            self.records_url(),
            urlencoding::encode(&name)
        );

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to call Cloudflare API")?;

        let result: CloudflareResponse<Vec<DnsRecord>> =
            parse_response(response, "look up DNS record").await?;

        Ok(result.result.and_then(|r| r.into_iter().next()))
    }
}
