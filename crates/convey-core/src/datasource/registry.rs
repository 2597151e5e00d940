//! Datasource registry and manager.
//!
//! The registry maps a datasource kind tag to a factory producing a live
//! [`DatasourceInstance`]. The manager caches built instances by
//! datasource id -- at most one live instance per id -- and owns their
//! lifetimes: strategies borrow instances for the duration of a run, the
//! manager stops residents at shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use convey_db::models::{DataSource, DataSourceKind};

use crate::error::SyncError;

use super::database::PostgresInstance;
use super::http::HttpInstance;
use super::http_post::HttpPostInstance;
use super::mqtt::MqttInstance;
use super::DatasourceInstance;

/// A factory building an instance from a catalog datasource record.
pub type InstanceFactory =
    Arc<dyn Fn(&DataSource) -> Result<Arc<dyn DatasourceInstance>, SyncError> + Send + Sync>;

/// Maps datasource kind tags to instance factories.
#[derive(Default, Clone)]
pub struct DatasourceRegistry {
    factories: HashMap<DataSourceKind, InstanceFactory>,
}

impl DatasourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with factories for every built-in kind.
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        registry.register_kind(DataSourceKind::DatabasePostgres, |ds| {
            Ok(Arc::new(PostgresInstance::from_datasource(ds)?) as Arc<dyn DatasourceInstance>)
        });
        registry.register_kind(DataSourceKind::ApiHttp, |ds| {
            Ok(Arc::new(HttpInstance::from_datasource(ds)?) as Arc<dyn DatasourceInstance>)
        });
        registry.register_kind(DataSourceKind::ApiHttpAuth, |ds| {
            Ok(Arc::new(HttpInstance::from_datasource(ds)?) as Arc<dyn DatasourceInstance>)
        });
        registry.register_kind(DataSourceKind::MessagingMqtt, |ds| {
            Ok(Arc::new(MqttInstance::from_datasource(ds)?) as Arc<dyn DatasourceInstance>)
        });
        registry.register_kind(DataSourceKind::MessagingHttpPost, |ds| {
            Ok(Arc::new(HttpPostInstance::from_datasource(ds)?) as Arc<dyn DatasourceInstance>)
        });
        registry
    }

    /// Register a factory for a kind. Replaces any existing factory.
    pub fn register_kind<F>(&mut self, kind: DataSourceKind, factory: F)
    where
        F: Fn(&DataSource) -> Result<Arc<dyn DatasourceInstance>, SyncError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    /// Build an instance for a datasource record.
    pub fn build(&self, datasource: &DataSource) -> Result<Arc<dyn DatasourceInstance>, SyncError> {
        let factory = self.factories.get(&datasource.kind).ok_or_else(|| {
            SyncError::Config(format!(
                "no factory registered for datasource kind {}",
                datasource.kind
            ))
        })?;
        factory(datasource)
    }

    /// The kinds this registry can build.
    pub fn kinds(&self) -> Vec<DataSourceKind> {
        self.factories.keys().copied().collect()
    }
}

impl std::fmt::Debug for DatasourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasourceRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct CachedInstance {
    /// `updated_at` of the datasource record the instance was built from.
    fingerprint: DateTime<Utc>,
    instance: Arc<dyn DatasourceInstance>,
}

/// Builds, caches, and disposes datasource instances keyed by datasource
/// id.
pub struct DatasourceManager {
    registry: DatasourceRegistry,
    cache: RwLock<HashMap<Uuid, CachedInstance>>,
}

impl DatasourceManager {
    pub fn new(registry: DatasourceRegistry) -> Self {
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a datasource: build and cache its instance.
    ///
    /// Idempotent per id. When the catalog record changed since the cached
    /// instance was built (`updated_at` moved), the stale instance is
    /// stopped and rebuilt.
    pub async fn register(&self, datasource: &DataSource) -> Result<(), SyncError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&datasource.id) {
                if entry.fingerprint == datasource.updated_at {
                    return Ok(());
                }
            }
        }

        let instance = self.registry.build(datasource)?;

        let stale = {
            let mut cache = self.cache.write().await;
            cache.insert(
                datasource.id,
                CachedInstance {
                    fingerprint: datasource.updated_at,
                    instance,
                },
            )
        };

        if let Some(stale) = stale {
            tracing::info!(
                datasource_id = %datasource.id,
                "datasource changed, disposing stale instance"
            );
            if let Err(e) = stale.instance.stop().await {
                tracing::warn!(datasource_id = %datasource.id, error = %e, "failed to stop stale instance");
            }
        }

        Ok(())
    }

    /// Fetch the cached instance for a datasource id.
    pub async fn get(&self, id: Uuid) -> Result<Arc<dyn DatasourceInstance>, SyncError> {
        let cache = self.cache.read().await;
        cache
            .get(&id)
            .map(|entry| Arc::clone(&entry.instance))
            .ok_or_else(|| SyncError::Config(format!("datasource {id} is not registered")))
    }

    /// Drop a cached instance, stopping it if resident.
    pub async fn close(&self, id: Uuid) -> Result<(), SyncError> {
        let removed = {
            let mut cache = self.cache.write().await;
            cache.remove(&id)
        };
        if let Some(entry) = removed {
            entry.instance.stop().await?;
        }
        Ok(())
    }

    /// Stop every cached instance and clear the cache.
    pub async fn shutdown(&self) {
        let entries: Vec<(Uuid, CachedInstance)> = {
            let mut cache = self.cache.write().await;
            cache.drain().collect()
        };
        for (id, entry) in entries {
            if let Err(e) = entry.instance.stop().await {
                tracing::warn!(datasource_id = %id, error = %e, "failed to stop instance at shutdown");
            }
        }
    }

    /// Number of cached instances.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    use crate::datasource::{DataRequest, DataResponse};

    /// Minimal test instance counting lifecycle calls.
    #[derive(Debug)]
    struct FakeInstance {
        resident: bool,
        started: AtomicBool,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DatasourceInstance for FakeInstance {
        fn kind(&self) -> DataSourceKind {
            if self.resident {
                DataSourceKind::MessagingMqtt
            } else {
                DataSourceKind::ApiHttp
            }
        }

        fn is_resident(&self) -> bool {
            self.resident
        }

        fn is_started(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }

        async fn start(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), SyncError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _request: &DataRequest,
        ) -> Result<DataResponse, SyncError> {
            Ok(DataResponse::ok(json!([])))
        }
    }

    fn fake_datasource(kind: DataSourceKind) -> DataSource {
        DataSource {
            id: Uuid::new_v4(),
            name: "fake".into(),
            kind,
            connection_config: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn registry_with_fake(stopped: Arc<AtomicUsize>) -> DatasourceRegistry {
        let mut registry = DatasourceRegistry::new();
        registry.register_kind(DataSourceKind::ApiHttp, move |_ds| {
            Ok(Arc::new(FakeInstance {
                resident: false,
                started: AtomicBool::new(false),
                stopped: Arc::clone(&stopped),
            }) as Arc<dyn DatasourceInstance>)
        });
        registry
    }

    #[tokio::test]
    async fn get_unregistered_fails() {
        let manager = DatasourceManager::new(DatasourceRegistry::new());
        let err = manager.get(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn register_is_idempotent_per_id() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = DatasourceManager::new(registry_with_fake(Arc::clone(&stopped)));
        let ds = fake_datasource(DataSourceKind::ApiHttp);

        manager.register(&ds).await.unwrap();
        let first = manager.get(ds.id).await.unwrap();

        // Same record: the cached instance survives.
        manager.register(&ds).await.unwrap();
        let second = manager.get(ds.id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len().await, 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mutation_rebuilds_instance() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = DatasourceManager::new(registry_with_fake(Arc::clone(&stopped)));
        let mut ds = fake_datasource(DataSourceKind::ApiHttp);

        manager.register(&ds).await.unwrap();
        let first = manager.get(ds.id).await.unwrap();

        // Mutated record: the stale instance is dropped and stopped.
        ds.updated_at = Utc::now() + chrono::Duration::seconds(1);
        manager.register(&ds).await.unwrap();
        let second = manager.get(ds.id).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len().await, 1, "at most one instance per id");
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_config_error() {
        let manager = DatasourceManager::new(DatasourceRegistry::new());
        let ds = fake_datasource(DataSourceKind::ApiHttp);
        let err = manager.register(&ds).await.unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = DatasourceManager::new(registry_with_fake(Arc::clone(&stopped)));

        let a = fake_datasource(DataSourceKind::ApiHttp);
        let b = fake_datasource(DataSourceKind::ApiHttp);
        manager.register(&a).await.unwrap();
        manager.register(&b).await.unwrap();

        manager.shutdown().await;
        assert!(manager.is_empty().await);
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_removes_and_stops() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = DatasourceManager::new(registry_with_fake(Arc::clone(&stopped)));
        let ds = fake_datasource(DataSourceKind::ApiHttp);

        manager.register(&ds).await.unwrap();
        manager.close(ds.id).await.unwrap();
        assert!(manager.is_empty().await);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(manager.get(ds.id).await.is_err());
    }
}
