//! The periodic driver that walks every known resource, bounded by a
//! worker pool, serialized per pool. Cloud-API calls happen outside
//! any lock; the pool lock is only re-acquired to persist each
//! resource's updated record.

use crate::registry::Registry;
use common_lib::model::Pool;
use common_lib::store::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub struct Syncer {
    registry: Arc<Registry>,
    tick_interval: Duration,
    concurrency: usize,
}

impl Syncer {
    pub fn new(registry: Arc<Registry>, tick_interval: Duration, concurrency: usize) -> Self {
        Self {
            registry,
            tick_interval,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs ticks until `shutdown` fires, then waits up to `grace` for
    /// in-flight pool syncs to finish before returning.
    pub async fn run(&self, shutdown: shutdown::Shutdown, grace: Duration) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut interval = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {}
            }

            let mut handles = Vec::new();
            for pool_id in self.registry.pool_ids() {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
                let registry = self.registry.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    sync_pool(&registry, &pool_id).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }

        tracing::info!("syncer stopping, waiting for in-flight ticks to drain");
        let _ = shutdown::with_grace_period(async {}, grace).await;
    }
}

/// One tick's worth of work for a single pool: snapshot its resources
/// under the pool lock, release, then sync and persist each resource
/// in turn. A single resource's failure is logged and swallowed — the
/// next tick retries it.
async fn sync_pool(registry: &Registry, pool_id: &str) {
    let controller = match registry.controller_for(pool_id) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(pool_id, %err, "no controller for pool, skipping tick");
            return;
        }
    };

    let pool = match snapshot_pool(registry, pool_id).await {
        Ok(pool) => pool,
        Err(err) => {
            tracing::warn!(pool_id, %err, "failed to snapshot pool, skipping tick");
            return;
        }
    };

    let now = chrono::Utc::now();
    for resource in pool.resources.into_values() {
        let id = resource.id.clone();
        let state = resource.state;
        match controller.sync_resource(resource, now).await {
            Ok(updated) => {
                if let Err(err) = persist(registry, pool_id, updated).await {
                    tracing::warn!(pool_id, resource_id = %id, %err, "failed to persist sync result");
                }
            }
            Err(err) => {
                tracing::warn!(pool_id, resource_id = %id, ?state, %err, "sync_resource failed, retrying next tick");
            }
        }
    }
}

async fn snapshot_pool(registry: &Registry, pool_id: &str) -> Result<Pool, StoreError> {
    let slot: Arc<tokio::sync::Mutex<Option<Pool>>> = Arc::new(tokio::sync::Mutex::new(None));
    let store = registry.store();
    let store_for_closure = store.clone();
    let pool_id_owned = pool_id.to_string();
    let slot_for_closure = slot.clone();
    store
        .with_lock(
            pool_id,
            Box::new(move || {
                Box::pin(async move {
                    let pool = store_for_closure.get_pool(&pool_id_owned).await?;
                    *slot_for_closure.lock().await = Some(pool);
                    Ok(())
                })
            }),
        )
        .await?;
    let guard = slot.lock().await;
    Ok(guard.clone().unwrap_or_else(|| Pool::new(pool_id)))
}

async fn persist(registry: &Registry, pool_id: &str, resource: common_lib::model::Resource) -> Result<(), StoreError> {
    let store = registry.store();
    let store_for_closure = store.clone();
    let pool_id_owned = pool_id.to_string();
    store
        .with_lock(
            pool_id,
            Box::new(move || {
                Box::pin(async move {
                    store_for_closure.save_resource(&pool_id_owned, resource).await?;
                    Ok(())
                })
            }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_lib::config::{Config, ConfigHandle, PoolConfig};
    use common_lib::model::{Resource, ResourceState};
    use common_lib::store::InMemoryResourceStore;
    use controller::cloud::FakeCloudAdapter;
    use std::collections::HashMap;

    fn registry_with_one_pending(pool_id: &str) -> (Arc<Registry>, Arc<InMemoryResourceStore>) {
        let mut pools = HashMap::new();
        pools.insert(
            pool_id.to_string(),
            PoolConfig {
                plugin_command: None,
                params: serde_json::json!({
                    "snapshotPrefix": "pg11",
                    "snapshotProjectId": "proj",
                    "instanceProjectId": "proj",
                    "instanceZone": "us-central1-a",
                    "instanceMachine": "n1-standard-1",
                }),
            },
        );
        let config = ConfigHandle::new(Config { pools, database_map: HashMap::new() });
        let store = Arc::new(InMemoryResourceStore::new());
        let now = chrono::Utc::now();
        let mut pool = Pool::new(pool_id);
        let resource = Resource::new_pending("r-1".into(), pool_id.into(), now);
        pool.resources.insert(resource.id.clone(), resource);
        store.seed_pool(pool);

        let adapter = Arc::new(FakeCloudAdapter::new());
        let registry = Registry::new(config, store.clone(), adapter).unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn sync_pool_advances_a_pending_resource_without_a_snapshot_to_deleted() {
        let (registry, store) = registry_with_one_pending("pg11");
        sync_pool(&registry, "pg11").await;
        let pool = store.get_pool("pg11").await.unwrap();
        assert_eq!(pool.resources.get("r-1").unwrap().state, ResourceState::Deleted);
    }

    #[tokio::test]
    async fn sync_pool_skips_unknown_pools_without_panicking() {
        let (registry, _store) = registry_with_one_pending("pg11");
        sync_pool(&registry, "does-not-exist").await;
    }

    #[tokio::test]
    async fn run_stops_promptly_once_shutdown_fires() {
        let (registry, _store) = registry_with_one_pending("pg11");
        let syncer = Syncer::new(registry, Duration::from_millis(10), 2);
        let shutdown = shutdown::Shutdown::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { syncer.run(shutdown, Duration::from_millis(50)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
