//! Typed controller parameters, parsed once at config-load time instead
//! of threading an untyped key/value map through every call site. A
//! pool whose config is missing a required field fails at startup with
//! a clear error rather than surfacing a confusing behavior the first
//! time the controller touches that pool.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_loads() -> f64 {
    10.0
}
fn default_max_serv_seconds() -> i64 {
    10_800
}
fn default_max_life_seconds() -> i64 {
    1_800
}
fn default_max_idle_seconds() -> i64 {
    300
}
fn default_max_sync_window_seconds() -> i64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerParams {
    #[serde(default = "default_max_loads")]
    pub max_loads: f64,
    #[serde(default = "default_max_serv_seconds")]
    pub max_serv_second: i64,
    #[serde(default = "default_max_life_seconds")]
    pub max_life_second: i64,
    #[serde(default = "default_max_idle_seconds")]
    pub max_idle_second: i64,
    #[serde(default = "default_max_sync_window_seconds")]
    pub max_sync_window: i64,

    pub snapshot_prefix: String,
    pub snapshot_project_id: String,
    pub instance_project_id: String,
    pub instance_zone: String,
    pub instance_machine: String,
}

impl ControllerParams {
    pub fn max_serv_duration(&self) -> Duration {
        Duration::from_secs(self.max_serv_second.max(0) as u64)
    }
    pub fn max_life_duration(&self) -> Duration {
        Duration::from_secs(self.max_life_second.max(0) as u64)
    }
    pub fn max_idle_duration(&self) -> Duration {
        Duration::from_secs(self.max_idle_second.max(0) as u64)
    }
    pub fn max_sync_window_duration(&self) -> Duration {
        Duration::from_secs(self.max_sync_window.max(0) as u64)
    }

    /// `godemand=<prefix>` label applied to every instance/disk this
    /// controller creates.
    pub fn godemand_label(&self) -> (String, String) {
        ("godemand".to_string(), self.snapshot_prefix.clone())
    }
}
