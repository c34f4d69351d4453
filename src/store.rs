//! Service Record Storage
//!
//! The orchestrator and reconciler only need get/list/save. Records are
//! created and removed by whoever discovers services; `insert` and `delete`
//! exist for that side.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::ServiceRecord;

/// Persistent storage for service records
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ServiceRecord>>;

    async fn list(&self) -> Result<Vec<ServiceRecord>>;

    /// Replace the stored record with the same id
    async fn save(&self, service: &ServiceRecord) -> Result<()>;

    async fn insert(&self, service: ServiceRecord) -> Result<()>;

    /// Returns whether a record was removed
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// In-process store, mostly for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    services: RwLock<BTreeMap<String, ServiceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(services: impl IntoIterator<Item = ServiceRecord>) -> Self {
        Self {
            services: RwLock::new(services.into_iter().map(|s| (s.id.clone(), s)).collect()),
        }
    }
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.services.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.services.read().await.values().cloned().collect())
    }

    async fn save(&self, service: &ServiceRecord) -> Result<()> {
        let mut services = self.services.write().await;
        match services.get_mut(&service.id) {
            Some(existing) => {
                *existing = service.clone();
                Ok(())
            }
            None => anyhow::bail!("Service {} does not exist", service.id),
        }
    }

    async fn insert(&self, service: ServiceRecord) -> Result<()> {
        let mut services = self.services.write().await;
        if services.contains_key(&service.id) {
            anyhow::bail!("Service {} already exists", service.id);
        }
        services.insert(service.id.clone(), service);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.services.write().await.remove(id).is_some())
    }
}

/// JSON file store, written atomically on every change
pub struct JsonFileStore {
    path: PathBuf,
    services: RwLock<BTreeMap<String, ServiceRecord>>,
}

impl JsonFileStore {
    /// Open (or start) the store at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let services: BTreeMap<String, ServiceRecord> = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read service store {}", path.display()))?;
            let records: Vec<ServiceRecord> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse service store {}", path.display()))?;
            records.into_iter().map(|s| (s.id.clone(), s)).collect()
        } else {
            warn!(path = %path.display(), "Service store not found, starting empty");
            BTreeMap::new()
        };

        info!(path = %path.display(), services = services.len(), "Opened service store");

        Ok(Self {
            path,
            services: RwLock::new(services),
        })
    }

    async fn flush(&self, services: &BTreeMap<String, ServiceRecord>) -> Result<()> {
        let records: Vec<&ServiceRecord> = services.values().collect();
        let json = serde_json::to_string_pretty(&records)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), services = records.len(), "Flushed service store");
        Ok(())
    }
}

#[async_trait]
impl ServiceStore for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.services.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.services.read().await.values().cloned().collect())
    }

    async fn save(&self, service: &ServiceRecord) -> Result<()> {
        let mut services = self.services.write().await;
        let Some(existing) = services.get(&service.id).cloned() else {
            anyhow::bail!("Service {} does not exist", service.id);
        };

        services.insert(service.id.clone(), service.clone());
        if let Err(e) = self.flush(&services).await {
            services.insert(existing.id.clone(), existing);
            return Err(e);
        }
        Ok(())
    }

    async fn insert(&self, service: ServiceRecord) -> Result<()> {
        let mut services = self.services.write().await;
        if services.contains_key(&service.id) {
            anyhow::bail!("Service {} already exists", service.id);
        }

        let id = service.id.clone();
        services.insert(id.clone(), service);
        if let Err(e) = self.flush(&services).await {
            services.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut services = self.services.write().await;
        let Some(removed) = services.remove(id) else {
            return Ok(false);
        };

        if let Err(e) = self.flush(&services).await {
            services.insert(removed.id.clone(), removed);
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_save_requires_existing() {
        let store = MemoryStore::new();
        let service = ServiceRecord::new("Grafana", "grafana", 3000);

        assert!(store.save(&service).await.is_err());
        store.insert(service.clone()).await.unwrap();
        assert!(store.insert(service.clone()).await.is_err());

        let mut updated = service.clone();
        updated.enabled = true;
        store.save(&updated).await.unwrap();
        assert!(store.get(&service.id).await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");

        let service = ServiceRecord::new("Grafana", "grafana", 3000);
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.insert(service.clone()).await.unwrap();

            let mut updated = service.clone();
            updated.dns_record_id = Some("rec-1".to_string());
            store.save(&updated).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let loaded = reopened.get(&service.id).await.unwrap().unwrap();
        assert_eq!(loaded.dns_record_id.as_deref(), Some("rec-1"));
        assert_eq!(reopened.list().await.unwrap().len(), 1);

        assert!(reopened.delete(&service.id).await.unwrap());
        assert!(!reopened.delete(&service.id).await.unwrap());
    }
}
