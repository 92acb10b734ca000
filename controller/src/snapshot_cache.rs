//! Per-controller cache of the latest snapshot per `(project, prefix)`,
//! used to rate-limit the relatively expensive "list snapshots" call.
//! Deliberately not persisted and not process-global: it lives on the
//! `DefaultController` instance that owns it.

use crate::cloud::Snapshot;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Clone)]
struct Entry {
    snapshot: Option<Snapshot>,
    found_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SnapshotCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached snapshot if one was found at or after
    /// `not_before` (a resource's `created_at`, per the freshness gate's
    /// refresh rule); `None` forces the caller to refresh.
    pub fn get(&self, project: &str, prefix: &str, not_before: DateTime<Utc>) -> Option<Option<Snapshot>> {
        let entries = self.entries.lock();
        entries
            .get(&(project.to_string(), prefix.to_string()))
            .filter(|e| e.found_at >= not_before)
            .map(|e| e.snapshot.clone())
    }

    pub fn put(&self, project: &str, prefix: &str, snapshot: Option<Snapshot>, found_at: DateTime<Utc>) {
        self.entries
            .lock()
            .insert((project.to_string(), prefix.to_string()), Entry { snapshot, found_at });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_entry_is_not_returned() {
        let cache = SnapshotCache::new();
        let t0 = Utc::now();
        cache.put("proj", "pg11", None, t0);

        let created_at = t0 + chrono::Duration::seconds(10);
        assert!(cache.get("proj", "pg11", created_at).is_none());
    }

    #[test]
    fn fresh_entry_is_returned() {
        let cache = SnapshotCache::new();
        let t0 = Utc::now();
        cache.put("proj", "pg11", None, t0);
        assert_eq!(cache.get("proj", "pg11", t0 - chrono::Duration::seconds(1)), Some(None));
    }
}
