//! The shared configuration file format read from `CONFIG_PATH` by both
//! `godemand-core` and `pg-broker`: a pool map (each pool's untyped
//! controller `params`, parsed into a typed shape by whichever crate
//! owns that controller implementation) plus the broker's
//! database-name → pool-id mapping. Polled on a background task and
//! published through `ConfigHandle` so every task reads the latest
//! version without taking a lock.

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::sync::Arc;

/// One pool's configuration. `params` stays untyped here: the
/// controller implementation that owns a pool is the one that knows
/// its own parameter schema and parses it once at load time (see
/// `controller::ControllerParams`), rather than this ambient config
/// layer guessing at a shape every controller must share.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    #[serde(default)]
    pub plugin_command: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The full contents of `CONFIG_PATH`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,
    #[serde(default)]
    pub database_map: HashMap<String, String>,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file '{}': {}", path, source))]
    Read { path: String, source: std::io::Error },

    #[snafu(display("failed to parse config file '{}': {}", path, source))]
    Parse { path: String, source: serde_json::Error },
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, ConfigError> {
        let body = tokio::fs::read(path).await.context(Read { path })?;
        serde_json::from_slice(&body).context(Parse { path })
    }
}

/// A hot-reloadable handle to the current `Config`. Cheap to clone;
/// every holder observes the latest successfully loaded version. A
/// failed reload is logged at `warn` and the previous config is kept —
/// config-reload failure is non-fatal.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<arc_swap::ArcSwap<Config>>,
}

impl ConfigHandle {
    pub fn new(initial: Config) -> Self {
        Self {
            inner: Arc::new(arc_swap::ArcSwap::from_pointee(initial)),
        }
    }

    pub async fn from_path(path: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(Config::load(path).await?))
    }

    pub fn load(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    pub fn store(&self, config: Config) {
        self.inner.store(Arc::new(config));
    }

    /// Spawn the background poll-and-swap task. Calls `on_reload` after
    /// every successful swap (used by `godemand-core` to rebuild its
    /// per-pool controllers). Runs until `shutdown` fires.
    pub fn spawn_reloader<F>(&self, path: String, period: std::time::Duration, shutdown: shutdown::Shutdown, mut on_reload: F)
    where
        F: FnMut(&Config) + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => return,
                    _ = interval.tick() => {}
                }
                match Config::load(&path).await {
                    Ok(config) => {
                        handle.store(config);
                        on_reload(&handle.load());
                    }
                    Err(err) => tracing::warn!(%err, path = %path, "config reload failed, keeping previous config"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_parses_pools_and_database_map() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("godemand-config-test-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            serde_json::json!({
                "pools": {
                    "pg11": {
                        "params": {"snapshotPrefix": "pg11"}
                    }
                },
                "databaseMap": {"db1": "pg11"}
            })
            .to_string(),
        )
        .await
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.database_map.get("db1").map(String::as_str), Some("pg11"));
        assert_eq!(
            config.pools.get("pg11").unwrap().params.get("snapshotPrefix").and_then(|v| v.as_str()),
            Some("pg11")
        );

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let err = Config::load("/nonexistent/godemand.json").await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
