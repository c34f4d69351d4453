//! Nginx Proxy Manager Provider
//!
//! `ProxyProvider` over the NPM admin API. Hosts are created first and the
//! Let's Encrypt certificate is requested afterwards, so a certificate
//! failure leaves a working HTTP route marked `ssl_pending`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{NewProxyHost, ProxyHostUpdate, ProxyProvider, SslRetryOutcome};
use crate::types::{ProxyHost, Scheme};

/// Marker stored in host meta so listings can report pending TLS
const SSL_REQUESTED_META: &str = "expose_ssl_requested";
const SSL_ERROR_META: &str = "expose_ssl_error";

/// Non-success response from an authenticated NPM call
#[derive(Debug, Error)]
#[error("NPM {method} {path} failed ({status}): {message}")]
pub struct NpmApiError {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub message: String,
}

impl NpmApiError {
    /// Whether `err` carries an NPM 404 anywhere in its chain
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        err.chain()
            .filter_map(|cause| cause.downcast_ref::<NpmApiError>())
            .any(|api| api.status == StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct NpmProxyHost {
    id: u64,
    domain_names: Vec<String>,
    forward_host: String,
    forward_port: u16,
    #[serde(default)]
    forward_scheme: Option<String>,
    #[serde(default)]
    certificate_id: Value,
    #[serde(default)]
    meta: Value,
}

impl From<NpmProxyHost> for ProxyHost {
    fn from(host: NpmProxyHost) -> Self {
        let has_certificate = match &host.certificate_id {
            Value::Number(n) => n.as_u64().unwrap_or(0) > 0,
            _ => false,
        };
        let ssl_requested = host.meta[SSL_REQUESTED_META].as_bool().unwrap_or(false);

        Self {
            id: host.id.to_string(),
            domain_names: host.domain_names,
            forward_host: host.forward_host,
            forward_port: host.forward_port,
            forward_scheme: match host.forward_scheme.as_deref() {
                Some("https") => Scheme::Https,
                _ => Scheme::Http,
            },
            ssl_pending: ssl_requested && !has_certificate,
            ssl_error: host.meta[SSL_ERROR_META].as_str().map(|s| s.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NpmCertificate {
    id: u64,
}

/// Nginx Proxy Manager client
pub struct NginxProxyManager {
    http_client: Client,
    base_url: String,
    email: String,
    password: String,
    letsencrypt_email: String,
    /// Pause before requesting a certificate when DNS was not verified
    dns_settle: Duration,
    token: Mutex<Option<String>>,
}

impl NginxProxyManager {
    pub fn new(
        base_url: &str,
        email: String,
        password: String,
        letsencrypt_email: Option<String>,
    ) -> Result<Self> {
        let http_client = Client::builder()
            // Certificate issuance on NPM can take a while
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            letsencrypt_email: letsencrypt_email.unwrap_or_else(|| email.clone()),
            email,
            password,
            dns_settle: Duration::from_secs(15),
            token: Mutex::new(None),
        })
    }

    pub fn with_dns_settle(mut self, dns_settle: Duration) -> Self {
        self.dns_settle = dns_settle;
        self
    }

    async fn login(&self) -> Result<String> {
        debug!(url = %self.base_url, "Requesting NPM API token");

        let response = self
            .http_client
            .post(format!("{}/api/tokens", self.base_url))
            .json(&json!({ "identity": self.email, "secret": self.password }))
            .send()
            .await
            .context("Failed to reach Nginx Proxy Manager")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("NPM login failed ({}): {}", status, text);
        }

        let token: TokenResponse = response.json().await.context("Invalid NPM token response")?;
        Ok(token.token)
    }

    async fn token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let token = self.login().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Authenticated JSON call; re-logs in once on 401
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 0..2 {
            let token = self.token().await?;
            let mut builder = self.http_client.request(method.clone(), &url).bearer_auth(&token);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .with_context(|| format!("Failed to call NPM {} {}", method, path))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!("NPM token rejected, logging in again");
                *self.token.lock().await = None;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(NpmApiError {
                    method: method.clone(),
                    path: path.to_string(),
                    status,
                    message: npm_error(&text),
                }
                .into());
            }

            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .with_context(|| format!("Invalid JSON from NPM {} {}", method, path));
        }

        anyhow::bail!("NPM rejected the API token for {} {}", method, path)
    }

    async fn get_host(&self, host_id: &str) -> Result<ProxyHost> {
        let value = self
            .request(Method::GET, &format!("/api/nginx/proxy-hosts/{}", host_id), None)
            .await?;
        let host: NpmProxyHost = serde_json::from_value(value).context("Invalid NPM proxy host")?;
        Ok(host.into())
    }

    /// Request a certificate and attach it to the host
    async fn issue_certificate(&self, host_id: &str, domain: &str) -> Result<()> {
        let certificate = self
            .request(
                Method::POST,
                "/api/nginx/certificates",
                Some(&json!({
                    "provider": "letsencrypt",
                    "nice_name": domain,
                    "domain_names": [domain],
                    "meta": {
                        "letsencrypt_email": self.letsencrypt_email,
                        "letsencrypt_agree": true,
                        "dns_challenge": false
                    }
                })),
            )
            .await?;
        let certificate: NpmCertificate =
            serde_json::from_value(certificate).context("Invalid NPM certificate response")?;

        self.request(
            Method::PUT,
            &format!("/api/nginx/proxy-hosts/{}", host_id),
            Some(&json!({
                "certificate_id": certificate.id,
                "ssl_forced": true,
                "http2_support": true,
                "meta": { SSL_REQUESTED_META: true }
            })),
        )
        .await?;

        info!(host_id = %host_id, domain = %domain, certificate_id = certificate.id, "Attached certificate");
        Ok(())
    }

    async fn record_ssl_error(&self, host_id: &str, error: &str) {
        let result = self
            .request(
                Method::PUT,
                &format!("/api/nginx/proxy-hosts/{}", host_id),
                Some(&json!({
                    "meta": { SSL_REQUESTED_META: true, SSL_ERROR_META: error }
                })),
            )
            .await;

        if let Err(e) = result {
            warn!(host_id = %host_id, error = %e, "Failed to record SSL error on proxy host");
        }
    }
}

/// NPM wraps errors as `{"error": {"message": ...}}`
fn npm_error(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| text.to_string())
}

#[async_trait]
impl ProxyProvider for NginxProxyManager {
    fn name(&self) -> &str {
        "nginx-proxy-manager"
    }

    async fn create_host(&self, request: &NewProxyHost) -> Result<ProxyHost> {
        info!(
            domain = %request.domain,
            target = %format!("{}://{}:{}", request.target_scheme, request.target_host, request.target_port),
            "Creating NPM proxy host"
        );

        let created = self
            .request(
                Method::POST,
                "/api/nginx/proxy-hosts",
                Some(&json!({
                    "domain_names": [request.domain],
                    "forward_scheme": request.target_scheme.as_str(),
                    "forward_host": request.target_host,
                    "forward_port": request.target_port,
                    "certificate_id": 0,
                    "ssl_forced": false,
                    "block_exploits": true,
                    "allow_websocket_upgrade": true,
                    "caching_enabled": false,
                    "access_list_id": 0,
                    "advanced_config": "",
                    "locations": [],
                    "meta": { SSL_REQUESTED_META: request.ssl }
                })),
            )
            .await?;
        let host: NpmProxyHost =
            serde_json::from_value(created).context("Invalid NPM proxy host response")?;
        let mut host: ProxyHost = host.into();

        if !request.ssl {
            return Ok(host);
        }

        if !request.skip_dns_wait && !self.dns_settle.is_zero() {
            debug!(domain = %request.domain, wait = ?self.dns_settle, "Letting DNS settle before ACME");
            tokio::time::sleep(self.dns_settle).await;
        }

        match self.issue_certificate(&host.id, &request.domain).await {
            Ok(()) => {
                host.ssl_pending = false;
                host.ssl_error = None;
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(domain = %request.domain, error = %message, "Certificate request failed, host left on HTTP");
                self.record_ssl_error(&host.id, &message).await;
                host.ssl_pending = true;
                host.ssl_error = Some(message);
            }
        }

        Ok(host)
    }

    async fn update_host(&self, host_id: &str, update: &ProxyHostUpdate) -> Result<ProxyHost> {
        let mut body = serde_json::Map::new();
        if let Some(host) = &update.target_host {
            body.insert("forward_host".to_string(), json!(host));
        }
        if let Some(port) = update.target_port {
            body.insert("forward_port".to_string(), json!(port));
        }
        if let Some(scheme) = update.target_scheme {
            body.insert("forward_scheme".to_string(), json!(scheme.as_str()));
        }

        if body.is_empty() {
            return self.get_host(host_id).await;
        }

        let updated = self
            .request(
                Method::PUT,
                &format!("/api/nginx/proxy-hosts/{}", host_id),
                Some(&Value::Object(body)),
            )
            .await?;
        let host: NpmProxyHost =
            serde_json::from_value(updated).context("Invalid NPM proxy host response")?;

        info!(host_id = %host_id, "Updated NPM proxy host");
        Ok(host.into())
    }

    async fn delete_host(&self, host_id: &str) -> Result<()> {
        match self
            .request(Method::DELETE, &format!("/api/nginx/proxy-hosts/{}", host_id), None)
            .await
        {
            Ok(_) => {
                info!(host_id = %host_id, "Deleted NPM proxy host");
                Ok(())
            }
            Err(e) if NpmApiError::is_not_found(&e) => {
                debug!(host_id = %host_id, "Proxy host already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_hosts(&self) -> Result<Vec<ProxyHost>> {
        let value = self.request(Method::GET, "/api/nginx/proxy-hosts", None).await?;
        let hosts: Vec<NpmProxyHost> =
            serde_json::from_value(value).context("Invalid NPM proxy host list")?;

        debug!(count = hosts.len(), "Listed NPM proxy hosts");
        Ok(hosts.into_iter().map(ProxyHost::from).collect())
    }

    async fn retry_ssl(&self, host_id: &str, domain: &str) -> Result<SslRetryOutcome> {
        info!(host_id = %host_id, domain = %domain, "Retrying certificate request");

        match self.issue_certificate(host_id, domain).await {
            Ok(()) => Ok(SslRetryOutcome {
                success: true,
                error: None,
            }),
            Err(e) => {
                let message = format!("{:#}", e);
                self.record_ssl_error(host_id, &message).await;
                Ok(SslRetryOutcome {
                    success: false,
                    error: Some(message),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npm_host_conversion_reports_pending_ssl() {
        let host: NpmProxyHost = serde_json::from_value(json!({
            "id": 7,
            "domain_names": ["grafana.example.com"],
            "forward_host": "192.168.1.10",
            "forward_port": 3000,
            "forward_scheme": "http",
            "certificate_id": 0,
            "meta": { "expose_ssl_requested": true, "expose_ssl_error": "rate limited" }
        }))
        .unwrap();

        let host: ProxyHost = host.into();
        assert_eq!(host.id, "7");
        assert!(host.ssl_pending);
        assert_eq!(host.ssl_error.as_deref(), Some("rate limited"));
        assert_eq!(host.forward_scheme, Scheme::Http);
    }

    #[test]
    fn test_npm_host_with_certificate_is_not_pending() {
        let host: NpmProxyHost = serde_json::from_value(json!({
            "id": 8,
            "domain_names": ["vault.example.com"],
            "forward_host": "192.168.1.10",
            "forward_port": 8200,
            "forward_scheme": "https",
            "certificate_id": 12,
            "meta": { "expose_ssl_requested": true }
        }))
        .unwrap();

        let host: ProxyHost = host.into();
        assert!(!host.ssl_pending);
        assert_eq!(host.forward_scheme, Scheme::Https);
    }

    #[test]
    fn test_not_found_is_read_from_status() {
        let missing = |status| {
            anyhow::Error::from(NpmApiError {
                method: Method::DELETE,
                path: "/api/nginx/proxy-hosts/7".to_string(),
                status,
                message: "Not Found".to_string(),
            })
        };

        assert!(NpmApiError::is_not_found(&missing(StatusCode::NOT_FOUND)));
        assert!(NpmApiError::is_not_found(
            &missing(StatusCode::NOT_FOUND).context("Deleting proxy host")
        ));
        assert!(!NpmApiError::is_not_found(&missing(StatusCode::INTERNAL_SERVER_ERROR)));
        // A message that merely mentions 404 is not a 404
        assert!(!NpmApiError::is_not_found(&anyhow::anyhow!("upstream said (404 Not Found)")));
    }

    #[test]
    fn test_npm_error_extraction() {
        assert_eq!(
            npm_error(r#"{"error":{"code":400,"message":"grafana.example.com is already in use"}}"#),
            "grafana.example.com is already in use"
        );
        assert_eq!(npm_error("Bad Gateway"), "Bad Gateway");
    }
}
