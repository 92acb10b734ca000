//! The persistent-store abstraction every pool is read from and written
//! through: `ResourceStore`.
//!
//! `save_resource` is where `state_change` gets bumped: implementations
//! must read back the previous record (if any) and set `state_change =
//! now` only when `resource.state` differs from it, or on first save.
//! The controller itself never touches `state_change`.

mod etcd_resource;
mod memory;

pub use etcd_resource::EtcdResourceStore;
pub use memory::InMemoryResourceStore;

use crate::model::{Pool, Resource};
use async_trait::async_trait;
use snafu::Snafu;

/// Errors a `ResourceStore` implementation can surface: a
/// context-selector snafu enum, one variant per failing operation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("failed to connect to the store backend: {}", source))]
    Connect { source: etcd_client::Error },

    #[snafu(display("pool '{}' does not exist", pool_id))]
    PoolNotFound { pool_id: String },

    #[snafu(display("resource '{}' does not exist in pool '{}'", resource_id, pool_id))]
    ResourceNotFound {
        pool_id: String,
        resource_id: String,
    },

    #[snafu(display("failed to acquire the exclusive lock for pool '{}': {}", pool_id, reason))]
    LockFailed { pool_id: String, reason: String },

    #[snafu(display("store operation on pool '{}' timed out", pool_id))]
    Timeout { pool_id: String },

    #[snafu(display("failed to (de)serialise store entry: {}", source))]
    Serde { source: serde_json::Error },

    #[snafu(display("backend returned an error: {}", reason))]
    Backend { reason: String },
}

/// A boxed, pinned future, used to keep `ResourceStore::with_lock` object
/// safe (`Box<dyn ResourceStore>` is how the registry holds one store
/// handle per pool) without depending on the `futures` crate for just
/// the `BoxFuture` alias.
pub type LockedFut<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StoreError>> + Send + 'a>>;

/// Everything the controller and the HTTP API need from the persistent
/// store, independent of the backend (etcd in production, an in-memory
/// map in tests). One instance is scoped to a single pool.
///
/// Mutual exclusion: the syncer and the HTTP API both call `with_lock`
/// to serialise reads-then-writes against a pool, but never hold the
/// lock across a cloud-API call — only across the read-modify-persist
/// of the store itself.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the current snapshot of a pool, including all resources.
    async fn get_pool(&self, pool_id: &str) -> Result<Pool, StoreError>;

    /// Persist `resource`, updating `state_change` per the rule above.
    /// Creates the pool record if it does not yet exist.
    async fn save_resource(&self, pool_id: &str, resource: Resource) -> Result<Resource, StoreError>;

    /// Remove a resource record entirely: called once the cloud instance
    /// is gone and the client TTL has also elapsed.
    async fn delete_resource(&self, pool_id: &str, resource_id: &str) -> Result<(), StoreError>;

    /// Run `f` while holding an exclusive, lease-guarded lock on
    /// `pool_id`. Used by the syncer to serialise concurrent
    /// reconciliation of the same pool across multiple `godemand-core`
    /// replicas.
    async fn with_lock<'a>(
        &'a self,
        pool_id: &'a str,
        f: Box<dyn FnOnce() -> LockedFut<'a> + Send + 'a>,
    ) -> Result<(), StoreError>;
}
