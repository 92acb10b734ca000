//! etcd-backed `ResourceStore`: a pool is one JSON value at key
//! `/godemand/pools/<pool_id>`, written through a compare-and-swap so
//! that two `godemand-core` replicas racing to reconcile the same pool
//! cannot silently clobber each other. `save_resource` needs
//! read-modify-write semantics (it must diff against the previously
//! persisted resource to decide whether to bump `state_change`), not a
//! blind put.

use super::{
    Backend, Connect, LockFailed, LockedFut, PoolNotFound, ResourceNotFound, ResourceStore, Serde,
    StoreError,
};
use crate::model::{Pool, Resource};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, LeaseGrantOptions, LockOptions, Txn, TxnOp};
use snafu::ResultExt;
use std::time::Duration;

const KEY_PREFIX: &str = "/godemand/pools/";

/// etcd client plus the lease TTL used for `with_lock`'s distributed
/// mutex: one lease-backed lock per pool, held only across the
/// read-modify-persist window, never across a cloud-API call.
#[derive(Clone)]
pub struct EtcdResourceStore {
    client: Client,
    lock_ttl: Duration,
}

impl EtcdResourceStore {
    pub async fn connect(endpoint: &str, lock_ttl: Duration) -> Result<Self, StoreError> {
        let client = Client::connect([endpoint], None).await.context(Connect)?;
        Ok(Self { client, lock_ttl })
    }

    fn key(pool_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, pool_id)
    }

    async fn fetch(&self, pool_id: &str) -> Result<Option<(Pool, i64)>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(Self::key(pool_id), None)
            .await
            .map_err(|e| Backend { reason: e.to_string() }.build())?;
        match resp.kvs().first() {
            Some(kv) => {
                let pool: Pool = serde_json::from_slice(kv.value()).context(Serde)?;
                Ok(Some((pool, kv.mod_revision())))
            }
            None => Ok(None),
        }
    }

    /// Compare-and-swap `pool` into place, failing if `mod_revision` has
    /// moved since `fetch`. Retried by the caller on conflict.
    async fn cas(&self, pool_id: &str, pool: &Pool, expect_revision: Option<i64>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let value = serde_json::to_vec(pool).context(Serde)?;
        let key = Self::key(pool_id);

        let cmp = match expect_revision {
            Some(rev) => Compare::mod_revision(key.clone(), CompareOp::Equal, rev),
            None => Compare::create_revision(key.clone(), CompareOp::Equal, 0),
        };
        let put = TxnOp::put(key.clone(), value, None);
        let resp = client
            .txn(Txn::new().when([cmp]).and_then([put]))
            .await
            .map_err(|e| Backend { reason: e.to_string() }.build())?;
        if !resp.succeeded() {
            return Backend {
                reason: format!("concurrent update to pool '{}', retry", pool_id),
            }
            .fail();
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for EtcdResourceStore {
    async fn get_pool(&self, pool_id: &str) -> Result<Pool, StoreError> {
        Ok(self.fetch(pool_id).await?.map(|(pool, _)| pool).unwrap_or_else(|| Pool::new(pool_id)))
    }

    async fn save_resource(&self, pool_id: &str, mut resource: Resource) -> Result<Resource, StoreError> {
        // A handful of CAS retries absorbs the rare race against another
        // replica's syncer tick.
        for _ in 0..5 {
            let existing = self.fetch(pool_id).await?;
            let (mut pool, expect_revision) = match &existing {
                Some((pool, rev)) => (pool.clone(), Some(*rev)),
                None => (Pool::new(pool_id), None),
            };

            let now = resource.last_synced;
            match pool.resources.get(&resource.id).map(|r| r.state) {
                Some(prev) if prev != resource.state => resource.state_change = now,
                None => resource.state_change = resource.created_at,
                _ => {}
            }

            pool.resources.insert(resource.id.clone(), resource.clone());
            match self.cas(pool_id, &pool, expect_revision).await {
                Ok(()) => return Ok(resource),
                Err(StoreError::Backend { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Backend {
            reason: format!("exhausted CAS retries saving resource in pool '{}'", pool_id),
        }
        .fail()
    }

    async fn delete_resource(&self, pool_id: &str, resource_id: &str) -> Result<(), StoreError> {
        for _ in 0..5 {
            let (mut pool, expect_revision) = self
                .fetch(pool_id)
                .await?
                .ok_or_else(|| PoolNotFound { pool_id }.build())?;
            if pool.resources.remove(resource_id).is_none() {
                return ResourceNotFound { pool_id, resource_id }.fail();
            }
            match self.cas(pool_id, &pool, Some(expect_revision)).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Backend { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Backend {
            reason: format!("exhausted CAS retries deleting resource in pool '{}'", pool_id),
        }
        .fail()
    }

    async fn with_lock<'a>(
        &'a self,
        pool_id: &'a str,
        f: Box<dyn FnOnce() -> LockedFut<'a> + Send + 'a>,
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let lock_name = format!("{}.lock", Self::key(pool_id));

        let lease = client
            .lease_grant(self.lock_ttl.as_secs() as i64, Some(LeaseGrantOptions::new()))
            .await
            .map_err(|e| Backend { reason: e.to_string() }.build())?;

        let lock = client
            .lock(lock_name.as_bytes().to_vec(), Some(LockOptions::new().with_lease(lease.id())))
            .await
            .map_err(|e| LockFailed { pool_id, reason: e.to_string() }.build())?;

        let result = f().await;

        let _ = client.unlock(lock.key().to_vec()).await;
        let _ = client.lease_revoke(lease.id()).await;

        result
    }
}
