//! Expose Engine
//!
//! Publishes internal services by pairing a DNS record with a reverse-proxy
//! host, streams progress while doing so, and keeps stored records in line
//! with what the providers actually hold.

pub mod api;
pub mod config;
pub mod error;
pub mod expose;
pub mod providers;
pub mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ExposeError, ExposeResult};
pub use expose::{ExposeService, ExposeSettings, StreamingExposeService};
pub use providers::{DnsProvider, ProviderSet, ProxyProvider};
pub use store::{JsonFileStore, MemoryStore, ServiceStore};
pub use sync::{SyncService, SyncSummary};
pub use types::ServiceRecord;
