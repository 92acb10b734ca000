//! Shared data model: `Pool`, `Resource`, `ResourceState`, `Client`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form metadata bag recorded by the controller: `addr` (serving
/// endpoint `host:port`), `load` (loadavg probe endpoint), `snapshot`
/// (source snapshot self-link used to build the instance's disk).
pub type Meta = HashMap<String, String>;

/// Lifecycle states a `Resource` can be in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ResourceState {
    Pending,
    Booting,
    Serving,
    Terminating,
    Terminated,
    Deleting,
    Deleted,
    Error,
    Unknown,
}

impl ResourceState {
    /// Selection rank used when picking a resource to serve a request:
    /// `Serving=0, Booting=1, Terminated=2, Terminating=3, Pending=4`,
    /// everything else (`Deleting`/`Deleted`/`Unknown`/`Error`) is 99
    /// and is filtered out of candidacy entirely.
    pub fn selection_rank(&self) -> u8 {
        match self {
            ResourceState::Serving => 0,
            ResourceState::Booting => 1,
            ResourceState::Terminated => 2,
            ResourceState::Terminating => 3,
            ResourceState::Pending => 4,
            ResourceState::Deleting
            | ResourceState::Deleted
            | ResourceState::Unknown
            | ResourceState::Error => 99,
        }
    }

    /// Whether this state is terminal: a record may be retained but is
    /// ignored by selection and heartbeats.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Deleted)
    }
}

/// One compute-instance record, possibly not yet materialised in the
/// cloud.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Globally unique id, assigned at creation as
    /// `godemand-<pool-prefix>-<yyyymmddhhmmss>`.
    pub id: String,
    pub pool_id: String,
    pub state: ResourceState,
    pub created_at: DateTime<Utc>,
    pub state_change: DateTime<Utc>,
    pub last_synced: DateTime<Utc>,
    pub last_client_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub meta: Meta,
}

impl Resource {
    /// Construct a freshly synthesised `Pending` resource, as
    /// `FindResource` does when no eligible candidate exists.
    pub fn new_pending(id: String, pool_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            pool_id,
            state: ResourceState::Pending,
            created_at: now,
            state_change: now,
            last_synced: now,
            last_client_heartbeat: now,
            meta: Meta::new(),
        }
    }

    /// `meta["addr"]`, the serving endpoint, if present.
    pub fn addr(&self) -> Option<&str> {
        self.meta.get("addr").map(String::as_str)
    }

    /// `meta["load"]`, the loadavg probe endpoint, if present.
    pub fn load_addr(&self) -> Option<&str> {
        self.meta.get("load").map(String::as_str)
    }

    /// `meta["snapshot"]`, the source snapshot self-link, if present.
    pub fn snapshot(&self) -> Option<&str> {
        self.meta.get("snapshot").map(String::as_str)
    }

    /// The idle anchor used by the `Serving` sync step: the more recent
    /// of the last client heartbeat and the last state change.
    pub fn idle_anchor(&self) -> DateTime<Utc> {
        self.last_client_heartbeat.max(self.state_change)
    }
}

/// A named class of interchangeable backend instances.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: String,
    #[serde(default)]
    pub resources: HashMap<String, Resource>,
}

impl Pool {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resources: HashMap::new(),
        }
    }
}

/// Caller metadata passed to `find_resource`/heartbeat calls: the
/// proxy's client address plus `{user, database}`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Client {
    pub id: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_rank_orders_serving_first() {
        assert!(ResourceState::Serving.selection_rank() < ResourceState::Booting.selection_rank());
        assert!(ResourceState::Booting.selection_rank() < ResourceState::Terminated.selection_rank());
        assert!(ResourceState::Terminated.selection_rank() < ResourceState::Terminating.selection_rank());
        assert!(ResourceState::Terminating.selection_rank() < ResourceState::Pending.selection_rank());
        assert!(ResourceState::Pending.selection_rank() < ResourceState::Deleting.selection_rank());
    }

    #[test]
    fn idle_anchor_is_the_more_recent_timestamp() {
        let now = Utc::now();
        let mut r = Resource::new_pending("id".into(), "pool".into(), now);
        r.state_change = now;
        r.last_client_heartbeat = now - chrono::Duration::seconds(10);
        assert_eq!(r.idle_anchor(), now);

        r.last_client_heartbeat = now + chrono::Duration::seconds(10);
        assert_eq!(r.idle_anchor(), r.last_client_heartbeat);
    }
}
