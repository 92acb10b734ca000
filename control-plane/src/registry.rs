//! `Registry`: the pool map plus the per-pool store/controller handles
//! that the HTTP API and the syncer both share. A pool's `Controller`
//! is rebuilt whenever its config entry changes — parsing `params` into
//! a typed `ControllerParams` happens here, once per reload, per the
//! "untyped parameter maps" redesign note rather than on every
//! `find_resource`/`sync_resource` call.

use arc_swap::ArcSwap;
use common_lib::config::ConfigHandle;
use common_lib::store::ResourceStore;
use controller::cloud::CloudAdapter;
use controller::{Controller, ControllerParams, DefaultController};
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    #[snafu(display("pool '{}' is not present in the current config", pool_id))]
    UnknownPool { pool_id: String },

    #[snafu(display("invalid controller params for pool '{}': {}", pool_id, source))]
    InvalidParams { pool_id: String, source: serde_json::Error },
}

pub struct Registry {
    config: ConfigHandle,
    store: Arc<dyn ResourceStore>,
    adapter: Arc<dyn CloudAdapter>,
    controllers: ArcSwap<HashMap<String, Arc<dyn Controller>>>,
}

impl Registry {
    pub fn new(config: ConfigHandle, store: Arc<dyn ResourceStore>, adapter: Arc<dyn CloudAdapter>) -> Result<Arc<Self>, RegistryError> {
        let controllers = build_controllers(&config.load().pools, &adapter)?;
        Ok(Arc::new(Self {
            config,
            store,
            adapter,
            controllers: ArcSwap::from_pointee(controllers),
        }))
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// All pool ids currently configured, used by the syncer to
    /// enumerate pools each tick.
    pub fn pool_ids(&self) -> Vec<String> {
        self.config.load().pools.keys().cloned().collect()
    }

    pub fn controller_for(&self, pool_id: &str) -> Result<Arc<dyn Controller>, RegistryError> {
        self.controllers
            .load()
            .get(pool_id)
            .cloned()
            .ok_or_else(|| UnknownPool { pool_id }.build())
    }

    /// Rebuild the controller map from the current config. Called once
    /// at startup and after every successful config reload. A pool
    /// whose params fail to parse keeps its previous controller and the
    /// bad entry is logged — a single pool's typo shouldn't take down
    /// every other pool's controller.
    pub fn refresh_controllers(&self) {
        let current = self.config.load();
        match build_controllers(&current.pools, &self.adapter) {
            Ok(fresh) => self.controllers.store(Arc::new(fresh)),
            Err(err) => tracing::warn!(%err, "failed to rebuild controllers from reloaded config, keeping previous set"),
        }
    }
}

fn build_controllers(
    pools: &HashMap<String, common_lib::config::PoolConfig>,
    adapter: &Arc<dyn CloudAdapter>,
) -> Result<HashMap<String, Arc<dyn Controller>>, RegistryError> {
    let mut controllers: HashMap<String, Arc<dyn Controller>> = HashMap::new();
    for (pool_id, pool_config) in pools {
        let params: ControllerParams = serde_json::from_value(pool_config.params.clone()).context(InvalidParams { pool_id })?;
        let controller: Arc<dyn Controller> = Arc::new(DefaultController::new(adapter.clone(), params));
        controllers.insert(pool_id.clone(), controller);
    }
    Ok(controllers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_lib::config::Config;
    use common_lib::store::InMemoryResourceStore;
    use controller::cloud::FakeCloudAdapter;

    fn adapter() -> Arc<dyn CloudAdapter> {
        Arc::new(FakeCloudAdapter::new())
    }

    fn config_with_pool() -> ConfigHandle {
        let mut pools = HashMap::new();
        pools.insert(
            "pg11".to_string(),
            common_lib::config::PoolConfig {
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
        ConfigHandle::new(Config { pools, database_map: HashMap::new() })
    }

    #[test]
    fn new_builds_a_controller_per_configured_pool() {
        let registry = Registry::new(config_with_pool(), Arc::new(InMemoryResourceStore::new()), adapter()).unwrap();
        assert!(registry.controller_for("pg11").is_ok());
        assert!(matches!(registry.controller_for("nope"), Err(RegistryError::UnknownPool { .. })));
    }

    #[test]
    fn new_rejects_a_pool_with_missing_required_params() {
        let mut pools = HashMap::new();
        pools.insert(
            "broken".to_string(),
            common_lib::config::PoolConfig {
                plugin_command: None,
                params: serde_json::json!({}),
            },
        );
        let config = ConfigHandle::new(Config { pools, database_map: HashMap::new() });
        let err = Registry::new(config, Arc::new(InMemoryResourceStore::new()), adapter()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParams { .. }));
    }
}
