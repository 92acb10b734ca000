//! In-memory `CloudAdapter` used by controller tests: a fake compute
//! backend that tracks instances, disks and snapshots in a mutex-guarded
//! map, with no network calls and no retry semantics of its own (the
//! retry semantics live in `RetryingAdapter`, which wraps this in tests
//! exactly as it wraps `GceAdapter` in production).

use super::{CloudAdapter, CloudError, Disk, DiskStatus, Instance, InstanceStatus, Placement, Snapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct FakeCloudAdapter {
    instances: Mutex<HashMap<String, Instance>>,
    disks: Mutex<HashMap<String, Disk>>,
    snapshots: Mutex<Vec<Snapshot>>,
    /// Injected failures, consumed one at a time, keyed by the
    /// operation name a test wants to make fail next.
    fail_next: Mutex<HashMap<String, CloudError>>,
}

impl FakeCloudAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_instance(&self, instance: Instance) {
        self.instances.lock().insert(instance.name.clone(), instance);
    }

    pub fn put_disk(&self, disk: Disk) {
        self.disks.lock().insert(disk.name.clone(), disk);
    }

    pub fn put_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.lock().push(snapshot);
    }

    pub fn remove_instance(&self, name: &str) {
        self.instances.lock().remove(name);
    }

    pub fn set_instance_status(&self, name: &str, status: InstanceStatus) {
        if let Some(instance) = self.instances.lock().get_mut(name) {
            instance.status = status;
        }
    }

    /// Arrange for the named operation's next call to fail with `err`.
    pub fn fail_next(&self, op: &str, err: CloudError) {
        self.fail_next.lock().insert(op.to_string(), err);
    }

    fn take_failure(&self, op: &str) -> Option<CloudError> {
        self.fail_next.lock().remove(op)
    }
}

#[async_trait]
impl CloudAdapter for FakeCloudAdapter {
    async fn find_instance(&self, _placement: &Placement, name: &str) -> Result<Option<Instance>, CloudError> {
        if let Some(err) = self.take_failure("find_instance") {
            return Err(err);
        }
        Ok(self.instances.lock().get(name).cloned())
    }

    async fn find_disk(&self, _placement: &Placement, name: &str) -> Result<Option<Disk>, CloudError> {
        if let Some(err) = self.take_failure("find_disk") {
            return Err(err);
        }
        Ok(self.disks.lock().get(name).cloned())
    }

    async fn find_latest_snapshot(
        &self,
        _placement: &Placement,
        prefix: &str,
    ) -> Result<Option<Snapshot>, CloudError> {
        if let Some(err) = self.take_failure("find_latest_snapshot") {
            return Err(err);
        }
        let snapshots = self.snapshots.lock();
        Ok(snapshots
            .iter()
            .filter(|s| s.name.starts_with(prefix))
            .max_by_key(|s| s.creation_timestamp)
            .cloned())
    }

    async fn create_disk(
        &self,
        _placement: &Placement,
        name: &str,
        source_snapshot: &str,
        _idempotency_token: &str,
    ) -> Result<(), CloudError> {
        if let Some(err) = self.take_failure("create_disk") {
            return Err(err);
        }
        self.disks.lock().entry(name.to_string()).or_insert(Disk {
            name: name.to_string(),
            status: DiskStatus::Ready,
            source_snapshot: Some(source_snapshot.to_string()),
            users: vec![],
        });
        Ok(())
    }

    async fn create_instance(
        &self,
        _placement: &Placement,
        name: &str,
        disk_name: &str,
        _startup_script: &str,
        _labels: &HashMap<String, String>,
        _idempotency_token: &str,
    ) -> Result<(), CloudError> {
        if let Some(err) = self.take_failure("create_instance") {
            return Err(err);
        }
        self.instances.lock().entry(name.to_string()).or_insert(Instance {
            name: name.to_string(),
            status: InstanceStatus::Provisioning,
            network_ip: None,
        });
        if let Some(disk) = self.disks.lock().get_mut(disk_name) {
            if !disk.users.contains(&name.to_string()) {
                disk.users.push(name.to_string());
            }
        }
        Ok(())
    }

    async fn start_instance(&self, _placement: &Placement, name: &str, _idempotency_token: &str) -> Result<(), CloudError> {
        if let Some(err) = self.take_failure("start_instance") {
            return Err(err);
        }
        let mut instances = self.instances.lock();
        match instances.get_mut(name) {
            Some(instance) => {
                instance.status = InstanceStatus::Running;
                Ok(())
            }
            None => Err(CloudError::NotFound),
        }
    }

    async fn stop_instance(&self, _placement: &Placement, name: &str, _idempotency_token: &str) -> Result<(), CloudError> {
        if let Some(err) = self.take_failure("stop_instance") {
            return Err(err);
        }
        let mut instances = self.instances.lock();
        match instances.get_mut(name) {
            Some(instance) => {
                instance.status = InstanceStatus::Terminated;
                Ok(())
            }
            None => Err(CloudError::NotFound),
        }
    }

    async fn delete_instance(&self, _placement: &Placement, name: &str, _idempotency_token: &str) -> Result<(), CloudError> {
        if let Some(err) = self.take_failure("delete_instance") {
            return Err(err);
        }
        match self.instances.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound),
        }
    }

    async fn delete_disk(&self, _placement: &Placement, name: &str, _idempotency_token: &str) -> Result<(), CloudError> {
        if let Some(err) = self.take_failure("delete_disk") {
            return Err(err);
        }
        match self.disks.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_latest_snapshot_picks_the_newest_matching_one() {
        let fake = FakeCloudAdapter::new();
        let placement = Placement {
            project_id: "p".into(),
            zone: "z".into(),
            machine_type: "m".into(),
        };
        let base = chrono::Utc::now();
        fake.put_snapshot(Snapshot {
            self_link: "link-old".into(),
            name: "pg11-old".into(),
            creation_timestamp: base,
        });
        fake.put_snapshot(Snapshot {
            self_link: "link-new".into(),
            name: "pg11-new".into(),
            creation_timestamp: base + chrono::Duration::seconds(60),
        });
        fake.put_snapshot(Snapshot {
            self_link: "link-other".into(),
            name: "other-prefix".into(),
            creation_timestamp: base + chrono::Duration::seconds(120),
        });

        let latest = fake
            .find_latest_snapshot(&placement, "pg11")
            .await
            .unwrap()
            .expect("a matching snapshot should be found");
        assert_eq!(latest.self_link, "link-new");
    }

    #[tokio::test]
    async fn find_latest_snapshot_returns_none_when_nothing_matches() {
        let fake = FakeCloudAdapter::new();
        let placement = Placement {
            project_id: "p".into(),
            zone: "z".into(),
            machine_type: "m".into(),
        };
        let found = fake.find_latest_snapshot(&placement, "pg11").await.unwrap();
        assert!(found.is_none());
    }
}
