//! In-memory `ResourceStore` test double. No lease, no etcd: locking is a
//! plain `tokio::sync::Mutex` per pool, which is enough to exercise the
//! controller and the HTTP API in unit tests without a running etcd.

use super::{LockedFut, PoolNotFound, ResourceNotFound, ResourceStore, StoreError};
use crate::model::{Pool, Resource, ResourceState};
use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::OptionExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct InMemoryResourceStore {
    pools: Mutex<HashMap<String, Pool>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pool directly, for tests that want fixed starting state
    /// rather than relying on `get_pool`'s lazy creation.
    pub fn seed_pool(&self, pool: Pool) {
        self.pools.lock().insert(pool.id.clone(), pool);
    }

    fn lock_for(&self, pool_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(pool_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get_pool(&self, pool_id: &str) -> Result<Pool, StoreError> {
        Ok(self.pools.lock().get(pool_id).cloned().unwrap_or_else(|| Pool::new(pool_id)))
    }

    async fn save_resource(&self, pool_id: &str, mut resource: Resource) -> Result<Resource, StoreError> {
        let now = resource.last_synced;
        let mut pools = self.pools.lock();
        let pool = pools
            .entry(pool_id.to_string())
            .or_insert_with(|| Pool::new(pool_id));

        let previous_state = pool.resources.get(&resource.id).map(|r| r.state);
        match previous_state {
            Some(prev) if prev != resource.state => resource.state_change = now,
            None => resource.state_change = resource.created_at,
            _ => {}
        }

        pool.resources.insert(resource.id.clone(), resource.clone());
        Ok(resource)
    }

    async fn delete_resource(&self, pool_id: &str, resource_id: &str) -> Result<(), StoreError> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(pool_id).context(PoolNotFound { pool_id })?;
        pool.resources
            .remove(resource_id)
            .map(|_| ())
            .context(ResourceNotFound { pool_id, resource_id })
    }

    async fn with_lock<'a>(
        &'a self,
        pool_id: &'a str,
        f: Box<dyn FnOnce() -> LockedFut<'a> + Send + 'a>,
    ) -> Result<(), StoreError> {
        let lock = self.lock_for(pool_id);
        let _guard = lock.lock().await;
        f().await
    }
}

/// Selection helper used both by tests and by the controller's
/// candidate gathering: resources whose state still counts toward
/// `FindResource` (i.e. excludes `Deleting`/`Deleted`/`Unknown`/`Error`).
pub fn eligible(pool: &Pool) -> impl Iterator<Item = &Resource> {
    pool.resources
        .values()
        .filter(|r| r.state.selection_rank() < 99)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn save_resource_bumps_state_change_on_transition() {
        let store = InMemoryResourceStore::new();
        let now = Utc::now();
        let mut r = Resource::new_pending("r1".into(), "p1".into(), now);
        store.save_resource("p1", r.clone()).await.unwrap();

        let later = now + chrono::Duration::seconds(30);
        r.state = ResourceState::Booting;
        r.last_synced = later;
        let saved = store.save_resource("p1", r).await.unwrap();
        assert_eq!(saved.state_change, later);
    }

    #[tokio::test]
    async fn save_resource_keeps_state_change_when_state_is_unchanged() {
        let store = InMemoryResourceStore::new();
        let now = Utc::now();
        let r = Resource::new_pending("r1".into(), "p1".into(), now);
        store.save_resource("p1", r.clone()).await.unwrap();

        let later = now + chrono::Duration::seconds(30);
        let mut r2 = r.clone();
        r2.last_synced = later;
        let saved = store.save_resource("p1", r2).await.unwrap();
        assert_eq!(saved.state_change, now);
    }

    #[tokio::test]
    async fn get_pool_creates_an_empty_pool_on_first_touch() {
        let store = InMemoryResourceStore::new();
        let pool = store.get_pool("nope").await.unwrap();
        assert_eq!(pool.id, "nope");
        assert!(pool.resources.is_empty());
    }

    #[tokio::test]
    async fn delete_resource_reports_missing_pool() {
        let store = InMemoryResourceStore::new();
        let err = store.delete_resource("nope", "r1").await.unwrap_err();
        assert!(matches!(err, StoreError::PoolNotFound { .. }));
    }

    #[tokio::test]
    async fn with_lock_serialises_concurrent_callers() {
        let store = Arc::new(InMemoryResourceStore::new());
        store.seed_pool(Pool::new("p1"));
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let store = store.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                store
                    .with_lock(
                        "p1",
                        Box::new(move || {
                            Box::pin(async move {
                                order.lock().await.push(i);
                                Ok(())
                            })
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(order.lock().await.len(), 5);
    }
}
