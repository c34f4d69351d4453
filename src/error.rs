//! Orchestration errors

use thiserror::Error;

use crate::expose::Phase;

/// Errors that end an expose/unexpose/migrate workflow
///
/// SSL provisioning failures and unconfirmed HTTPS reachability are not
/// listed here: they only downgrade the proxy step to a warning.
#[derive(Debug, Error)]
pub enum ExposeError {
    /// Unknown service id
    #[error("Service not found: {0}")]
    NotFound(String),

    /// A single-phase expose found that resource already present
    #[error("{phase} is already exposed for service {service_id}")]
    AlreadyExposed { service_id: String, phase: Phase },

    /// An operation needs a resource id the service does not have
    #[error("{phase} is not exposed for service {service_id}")]
    NotExposed { service_id: String, phase: Phase },

    /// Neither phase produced a resource
    #[error("No DNS or proxy provider is configured")]
    NoProvidersConfigured,

    /// A provider call failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// The new record never resolved through the local resolver
    #[error("DNS for {0} did not propagate in time")]
    PropagationTimeout(String),

    /// `exposed_subdomain` is missing or already equals `subdomain`
    #[error("Service {0} has no diverging exposed subdomain to migrate to")]
    NothingToMigrate(String),

    /// Loading or persisting the service record failed
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ExposeError {
    /// Wrap a vendor failure with what we were trying to do
    pub fn provider(action: &str, err: anyhow::Error) -> Self {
        Self::Provider(format!("{}: {:#}", action, err))
    }

    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", err))
    }
}

pub type ExposeResult<T> = Result<T, ExposeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_keeps_context_chain() {
        let err = anyhow::anyhow!("HTTP 403").context("Cloudflare API error");
        let wrapped = ExposeError::provider("Failed to create DNS record", err);

        let message = wrapped.to_string();
        assert!(message.contains("Failed to create DNS record"));
        assert!(message.contains("Cloudflare API error"));
        assert!(message.contains("HTTP 403"));
    }

    #[test]
    fn test_already_exposed_names_phase() {
        let err = ExposeError::AlreadyExposed {
            service_id: "svc-1".to_string(),
            phase: Phase::Dns,
        };
        assert_eq!(err.to_string(), "dns is already exposed for service svc-1");
    }
}
