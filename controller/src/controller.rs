//! The `Controller` trait and its default implementation: the
//! selection policy (`find_resource`) and the per-resource state
//! machine (`sync_resource`).

use crate::cloud::{CloudAdapter, CloudError, DiskStatus, InstanceStatus, Placement};
use crate::error::{self, ControllerError};
use crate::params::ControllerParams;
use crate::poke;
use crate::snapshot_cache::SnapshotCache;
use crate::startup_script::{self, StartupParams};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_lib::model::{Client, Pool, Resource, ResourceState};
use snafu::ResultExt;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait Controller: Send + Sync {
    /// Choose (or synthesize) a resource to serve `client`'s request
    /// against `pool`. Never mutates the store itself — the caller
    /// persists whichever resource is returned.
    async fn find_resource(&self, pool: &Pool, client: &Client, now: DateTime<Utc>) -> Result<Resource, ControllerError>;

    /// Advance `resource` one step through its lifecycle, returning the
    /// (possibly unchanged) updated record.
    async fn sync_resource(&self, resource: Resource, now: DateTime<Utc>) -> Result<Resource, ControllerError>;
}

pub struct DefaultController<A: ?Sized> {
    adapter: Arc<A>,
    params: ControllerParams,
    snapshot_cache: SnapshotCache,
}

impl<A: CloudAdapter + ?Sized> DefaultController<A> {
    pub fn new(adapter: Arc<A>, params: ControllerParams) -> Self {
        Self { adapter, params, snapshot_cache: SnapshotCache::new() }
    }

    fn placement(&self) -> Placement {
        Placement {
            project_id: self.params.instance_project_id.clone(),
            zone: self.params.instance_zone.clone(),
            machine_type: self.params.instance_machine.clone(),
        }
    }

    /// The resource's own disk/instance name is its id.
    fn instance_name(resource: &Resource) -> &str {
        &resource.id
    }

    /// Refreshes the snapshot cache if necessary and reports whether
    /// `resource`'s recorded snapshot is older than the current latest
    /// one (a lexicographic self-link compare, per the provider's
    /// time-ordered self-link naming convention).
    async fn is_stale(&self, resource: &Resource) -> Result<bool, ControllerError> {
        let project = &self.params.snapshot_project_id;
        let prefix = &self.params.snapshot_prefix;

        let latest = match self.snapshot_cache.get(project, prefix, resource.created_at) {
            Some(cached) => cached,
            None => {
                let found = self
                    .adapter
                    .find_latest_snapshot(&self.placement(), prefix)
                    .await
                    .context(error::Cloud)?;
                self.snapshot_cache.put(project, prefix, found.clone(), Utc::now());
                found
            }
        };

        match (resource.snapshot(), latest) {
            (Some(recorded), Some(latest)) => Ok(recorded < latest.self_link.as_str()),
            _ => Ok(false),
        }
    }

    async fn pending(&self, mut resource: Resource, now: DateTime<Utc>) -> Result<Resource, ControllerError> {
        let placement = self.placement();
        let name = Self::instance_name(&resource).to_string();

        if self.adapter.find_instance(&placement, &name).await.context(error::Cloud)?.is_some() {
            resource.state = ResourceState::Booting;
            resource.last_synced = now;
            return Ok(resource);
        }

        let disk = match self.adapter.find_disk(&placement, &name).await.context(error::Cloud)? {
            Some(disk) => disk,
            None => {
                let snapshot = self
                    .adapter
                    .find_latest_snapshot(&placement, &self.params.snapshot_prefix)
                    .await
                    .context(error::Cloud)?;
                self.snapshot_cache.put(&self.params.snapshot_project_id, &self.params.snapshot_prefix, snapshot.clone(), now);
                let snapshot = match snapshot {
                    Some(s) => s,
                    None => {
                        resource.state = ResourceState::Deleted;
                        resource.last_synced = now;
                        return Ok(resource);
                    }
                };

                let token = Uuid::new_v4().to_string();
                self.adapter
                    .create_disk(&placement, &name, &snapshot.self_link, &token)
                    .await
                    .context(error::Cloud)?;

                match self.adapter.find_disk(&placement, &name).await.context(error::Cloud)? {
                    Some(disk) => disk,
                    None => {
                        return Err(CloudError::Transient { reason: "disk vanished right after creation".into() })
                            .context(error::Cloud);
                    }
                }
            }
        };

        match disk.status {
            DiskStatus::Creating | DiskStatus::Restoring => Err(CloudError::Transient {
                reason: format!("disk '{}' still {:?}", name, disk.status),
            })
            .context(error::Cloud),
            DiskStatus::Failed => {
                let token = Uuid::new_v4().to_string();
                self.adapter.delete_disk(&placement, &name, &token).await.context(error::Cloud)?;
                Err(CloudError::DiskFailed).context(error::Cloud)
            }
            DiskStatus::Other => Err(CloudError::Transient {
                reason: format!("disk '{}' in unrecognised state", name),
            })
            .context(error::Cloud),
            DiskStatus::Ready => {
                if !disk.users.is_empty() {
                    return error::DiskInUse { disk: name }.fail();
                }

                let pg_version = self.params.snapshot_prefix.trim_start_matches("pg").to_string();
                let snapshot_source = disk.source_snapshot.clone().unwrap_or_default();
                let script = startup_script::render(&StartupParams::with_defaults(&pg_version, snapshot_source))
                    .context(error::StartupScript)?;

                let mut labels = HashMap::new();
                let (label_key, label_value) = self.params.godemand_label();
                labels.insert(label_key, label_value);

                let token = Uuid::new_v4().to_string();
                self.adapter
                    .create_instance(&placement, &name, &name, &script, &labels, &token)
                    .await
                    .context(error::Cloud)?;

                if let Some(source_snapshot) = disk.source_snapshot {
                    resource.meta.insert("snapshot".to_string(), source_snapshot);
                }
                resource.state = ResourceState::Booting;
                resource.last_synced = now;
                Ok(resource)
            }
        }
    }

    async fn booting(&self, mut resource: Resource, now: DateTime<Utc>) -> Result<Resource, ControllerError> {
        let placement = self.placement();
        let name = Self::instance_name(&resource).to_string();

        let instance = match self.adapter.find_instance(&placement, &name).await.context(error::Cloud)? {
            Some(i) => i,
            None => {
                resource.state = ResourceState::Deleted;
                resource.last_synced = now;
                return Ok(resource);
            }
        };

        match instance.status {
            InstanceStatus::Running => {
                if let Some(ip) = &instance.network_ip {
                    if poke::poke(&format!("{}:8743", ip), 5).await {
                        resource.state = ResourceState::Serving;
                        resource.meta.insert("addr".to_string(), format!("{}:5432", ip));
                        resource.meta.insert("load".to_string(), format!("{}:8743", ip));
                    }
                }
            }
            InstanceStatus::Stopped | InstanceStatus::Terminated => {
                let token = Uuid::new_v4().to_string();
                self.adapter.start_instance(&placement, &name, &token).await.context(error::Cloud)?;
            }
            _ => {}
        }

        if resource.state == ResourceState::Booting {
            let abandon_after = self.params.max_idle_duration() * 2;
            if resource.state_change + chrono::Duration::from_std(abandon_after).unwrap_or_default() < now {
                resource.state = ResourceState::Deleting;
            }
        }

        resource.last_synced = now;
        Ok(resource)
    }

    async fn serving(&self, mut resource: Resource, now: DateTime<Utc>) -> Result<Resource, ControllerError> {
        if resource.last_synced + chrono::Duration::from_std(self.params.max_sync_window_duration()).unwrap_or_default() > now {
            return Ok(resource);
        }

        let placement = self.placement();
        let name = Self::instance_name(&resource).to_string();

        let instance = match self.adapter.find_instance(&placement, &name).await.context(error::Cloud)? {
            Some(i) => i,
            None => {
                resource.state = ResourceState::Deleted;
                resource.last_synced = now;
                return Ok(resource);
            }
        };

        match instance.status {
            InstanceStatus::Stopping => resource.state = ResourceState::Terminating,
            InstanceStatus::Terminated => resource.state = ResourceState::Terminated,
            InstanceStatus::Provisioning | InstanceStatus::Staging => resource.state = ResourceState::Booting,
            InstanceStatus::Running => {
                let anchor = resource.idle_anchor();
                if anchor + chrono::Duration::from_std(self.params.max_idle_duration()).unwrap_or_default() < now {
                    resource.state = ResourceState::Terminating;
                } else if resource.created_at + chrono::Duration::from_std(self.params.max_serv_duration()).unwrap_or_default() < now {
                    resource.state = ResourceState::Deleting;
                } else if let Some(addr) = resource.addr() {
                    if !poke::poke(addr, 5).await {
                        resource.state = ResourceState::Terminating;
                    }
                }
            }
            InstanceStatus::Stopped | InstanceStatus::Other => resource.state = ResourceState::Deleting,
        }

        resource.last_synced = now;
        Ok(resource)
    }

    async fn terminating(&self, mut resource: Resource, now: DateTime<Utc>) -> Result<Resource, ControllerError> {
        let placement = self.placement();
        let name = Self::instance_name(&resource).to_string();

        let instance = match self.adapter.find_instance(&placement, &name).await.context(error::Cloud)? {
            Some(i) => i,
            None => {
                resource.state = ResourceState::Deleted;
                resource.last_synced = now;
                return Ok(resource);
            }
        };

        if instance.status == InstanceStatus::Terminated {
            resource.state = ResourceState::Terminated;
        } else {
            let token = Uuid::new_v4().to_string();
            self.adapter.stop_instance(&placement, &name, &token).await.context(error::Cloud)?;
        }

        resource.last_synced = now;
        Ok(resource)
    }

    async fn terminated(&self, mut resource: Resource, now: DateTime<Utc>) -> Result<Resource, ControllerError> {
        if resource.last_synced + chrono::Duration::from_std(self.params.max_sync_window_duration()).unwrap_or_default() > now {
            return Ok(resource);
        }

        let placement = self.placement();
        let name = Self::instance_name(&resource).to_string();

        let instance = match self.adapter.find_instance(&placement, &name).await.context(error::Cloud)? {
            Some(i) => i,
            None => {
                resource.state = ResourceState::Deleted;
                resource.last_synced = now;
                return Ok(resource);
            }
        };

        let age_exceeds_max_life = now - resource.created_at > chrono::Duration::from_std(self.params.max_life_duration()).unwrap_or_default();
        if age_exceeds_max_life && self.is_stale(&resource).await? {
            resource.state = ResourceState::Deleting;
        } else if instance.status == InstanceStatus::Running {
            resource.state = ResourceState::Booting;
        }

        resource.last_synced = now;
        Ok(resource)
    }

    async fn deleting(&self, mut resource: Resource, now: DateTime<Utc>) -> Result<Resource, ControllerError> {
        let placement = self.placement();
        let name = Self::instance_name(&resource).to_string();

        match self.adapter.find_instance(&placement, &name).await.context(error::Cloud)? {
            None => resource.state = ResourceState::Deleted,
            Some(_) => {
                let token = Uuid::new_v4().to_string();
                self.adapter.delete_instance(&placement, &name, &token).await.context(error::Cloud)?;
                resource.state = ResourceState::Deleted;
            }
        }

        resource.last_synced = now;
        Ok(resource)
    }
}

/// Orders selection candidates: primary key is the state's selection
/// rank, ascending. Secondary key: within `Serving`, most-recent
/// `state_change` first (prefer a freshly-ready instance); within
/// every other state, oldest `state_change` first (advance whichever
/// has been waiting longest).
fn candidate_order(a: &Resource, b: &Resource) -> std::cmp::Ordering {
    let rank_order = a.state.selection_rank().cmp(&b.state.selection_rank());
    if rank_order != std::cmp::Ordering::Equal {
        return rank_order;
    }
    if a.state == ResourceState::Serving {
        b.state_change.cmp(&a.state_change)
    } else {
        a.state_change.cmp(&b.state_change)
    }
}

#[async_trait]
impl<A: CloudAdapter + ?Sized> Controller for DefaultController<A> {
    #[tracing::instrument(skip(self, pool, client))]
    async fn find_resource(&self, pool: &Pool, _client: &Client, now: DateTime<Utc>) -> Result<Resource, ControllerError> {
        let mut candidates: Vec<Resource> = pool
            .resources
            .values()
            .filter(|r| r.state.selection_rank() < 99)
            .cloned()
            .collect();
        candidates.sort_by(candidate_order);

        for mut candidate in candidates {
            if now.signed_duration_since(candidate.created_at)
                > chrono::Duration::from_std(self.params.max_life_duration()).unwrap_or_default()
                && self.is_stale(&candidate).await?
            {
                continue;
            }

            if candidate.state == ResourceState::Serving {
                if let Some(load_addr) = candidate.load_addr() {
                    if let Some(load) = poke::read_load(load_addr).await {
                        if load.overloaded(self.params.max_loads) {
                            continue;
                        }
                    }
                }
            }

            if matches!(candidate.state, ResourceState::Terminated | ResourceState::Terminating) {
                candidate.state = ResourceState::Booting;
            }
            return Ok(candidate);
        }

        let id = format!("godemand-{}-{}", self.params.snapshot_prefix, now.format("%Y%m%d%H%M%S"));
        Ok(Resource::new_pending(id, pool.id.clone(), now))
    }

    #[tracing::instrument(skip(self, resource))]
    async fn sync_resource(&self, resource: Resource, now: DateTime<Utc>) -> Result<Resource, ControllerError> {
        match resource.state {
            ResourceState::Pending => self.pending(resource, now).await,
            ResourceState::Booting => self.booting(resource, now).await,
            ResourceState::Serving => self.serving(resource, now).await,
            ResourceState::Terminating => self.terminating(resource, now).await,
            ResourceState::Terminated => self.terminated(resource, now).await,
            ResourceState::Deleting => self.deleting(resource, now).await,
            ResourceState::Deleted | ResourceState::Error | ResourceState::Unknown => Ok(resource),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Disk, DiskStatus, FakeCloudAdapter, Instance, InstanceStatus, Snapshot};

    fn params() -> ControllerParams {
        serde_json::from_value(serde_json::json!({
            "snapshotPrefix": "pg11",
            "snapshotProjectId": "proj",
            "instanceProjectId": "proj",
            "instanceZone": "us-central1-a",
            "instanceMachine": "n1-standard-1",
            "maxIdleSecond": 300,
            "maxServSecond": 10_800,
            "maxLifeSecond": 1_800,
        }))
        .unwrap()
    }

    fn controller() -> DefaultController<FakeCloudAdapter> {
        DefaultController::new(Arc::new(FakeCloudAdapter::new()), params())
    }

    #[tokio::test]
    async fn find_resource_synthesizes_pending_when_pool_is_empty() {
        let ctl = controller();
        let pool = Pool::new("pool-1");
        let client = Client::default();
        let now = Utc::now();

        let resource = ctl.find_resource(&pool, &client, now).await.unwrap();
        assert_eq!(resource.state, ResourceState::Pending);
        assert!(resource.id.starts_with("godemand-pg11-"));
        assert_eq!(resource.pool_id, "pool-1");
    }

    #[tokio::test]
    async fn find_resource_prefers_serving_over_booting() {
        let ctl = controller();
        let now = Utc::now();
        let mut pool = Pool::new("pool-1");

        let mut booting = Resource::new_pending("r-booting".into(), "pool-1".into(), now);
        booting.state = ResourceState::Booting;
        let mut serving = Resource::new_pending("r-serving".into(), "pool-1".into(), now);
        serving.state = ResourceState::Serving;
        pool.resources.insert(booting.id.clone(), booting);
        pool.resources.insert(serving.id.clone(), serving);

        let chosen = ctl.find_resource(&pool, &Client::default(), now).await.unwrap();
        assert_eq!(chosen.id, "r-serving");
    }

    #[tokio::test]
    async fn find_resource_skips_overloaded_serving_candidate() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"20.0 5.0 3.0").await;
            }
        });

        let ctl = controller();
        let now = Utc::now();
        let mut pool = Pool::new("pool-1");
        let mut serving = Resource::new_pending("r-serving".into(), "pool-1".into(), now);
        serving.state = ResourceState::Serving;
        serving.meta.insert("load".to_string(), addr.to_string());
        pool.resources.insert(serving.id.clone(), serving);

        let chosen = ctl.find_resource(&pool, &Client::default(), now).await.unwrap();
        assert_eq!(chosen.state, ResourceState::Pending, "the only candidate is overloaded, so a new one is synthesized");
    }

    #[tokio::test]
    async fn find_resource_restarts_a_terminated_candidate() {
        let ctl = controller();
        let now = Utc::now();
        let mut pool = Pool::new("pool-1");
        let mut terminated = Resource::new_pending("r-1".into(), "pool-1".into(), now);
        terminated.state = ResourceState::Terminated;
        pool.resources.insert(terminated.id.clone(), terminated);

        let chosen = ctl.find_resource(&pool, &Client::default(), now).await.unwrap();
        assert_eq!(chosen.state, ResourceState::Booting);
    }

    #[tokio::test]
    async fn sync_pending_marks_deleted_when_no_snapshot_exists() {
        let ctl = controller();
        let now = Utc::now();
        let resource = Resource::new_pending("r-1".into(), "pool-1".into(), now);

        let synced = ctl.sync_resource(resource, now).await.unwrap();
        assert_eq!(synced.state, ResourceState::Deleted);
        assert_eq!(synced.last_synced, now);
    }

    #[tokio::test]
    async fn sync_pending_creates_disk_then_boots_once_ready() {
        let adapter = FakeCloudAdapter::new();
        adapter.put_snapshot(Snapshot {
            self_link: "link-1".into(),
            name: "pg11-snap".into(),
            creation_timestamp: Utc::now(),
        });
        let ctl = DefaultController::new(Arc::new(adapter), params());
        let now = Utc::now();
        let resource = Resource::new_pending("r-1".into(), "pool-1".into(), now);

        let synced = ctl.sync_resource(resource, now).await.unwrap();
        assert_eq!(synced.state, ResourceState::Booting);
        assert_eq!(synced.meta.get("snapshot").map(String::as_str), Some("link-1"));
    }

    #[tokio::test]
    async fn sync_pending_errors_when_disk_has_other_users() {
        let adapter = FakeCloudAdapter::new();
        adapter.put_disk(Disk {
            name: "r-1".into(),
            status: DiskStatus::Ready,
            source_snapshot: Some("link-1".into()),
            users: vec!["someone-else".into()],
        });
        let ctl = DefaultController::new(Arc::new(adapter), params());
        let now = Utc::now();
        let resource = Resource::new_pending("r-1".into(), "pool-1".into(), now);

        let err = ctl.sync_resource(resource, now).await.unwrap_err();
        assert!(matches!(err, ControllerError::DiskInUse { .. }));
    }

    #[tokio::test]
    async fn sync_booting_marks_deleted_when_instance_vanished() {
        let ctl = controller();
        let now = Utc::now();
        let mut resource = Resource::new_pending("r-1".into(), "pool-1".into(), now);
        resource.state = ResourceState::Booting;

        let synced = ctl.sync_resource(resource, now).await.unwrap();
        assert_eq!(synced.state, ResourceState::Deleted);
    }

    #[tokio::test]
    async fn sync_booting_abandons_after_twice_the_idle_window() {
        let adapter = FakeCloudAdapter::new();
        adapter.put_instance(Instance {
            name: "r-1".into(),
            status: InstanceStatus::Provisioning,
            network_ip: None,
        });
        let ctl = DefaultController::new(Arc::new(adapter), params());
        let created = Utc::now() - chrono::Duration::seconds(10 * 60 * 60);
        let mut resource = Resource::new_pending("r-1".into(), "pool-1".into(), created);
        resource.state = ResourceState::Booting;
        resource.state_change = created;

        let synced = ctl.sync_resource(resource, Utc::now()).await.unwrap();
        assert_eq!(synced.state, ResourceState::Deleting);
    }

    #[tokio::test]
    async fn sync_serving_short_circuits_within_sync_window() {
        let ctl = controller();
        let now = Utc::now();
        let mut resource = Resource::new_pending("r-1".into(), "pool-1".into(), now);
        resource.state = ResourceState::Serving;
        resource.last_synced = now;

        let synced = ctl.sync_resource(resource.clone(), now + chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(synced, resource);
    }

    #[tokio::test]
    async fn sync_serving_reaps_idle_resource_past_max_idle() {
        let adapter = FakeCloudAdapter::new();
        adapter.put_instance(Instance {
            name: "r-1".into(),
            status: InstanceStatus::Running,
            network_ip: Some("127.0.0.1".into()),
        });
        let ctl = DefaultController::new(Arc::new(adapter), params());
        let created = Utc::now() - chrono::Duration::seconds(3600);
        let mut resource = Resource::new_pending("r-1".into(), "pool-1".into(), created);
        resource.state = ResourceState::Serving;
        resource.state_change = created;
        resource.last_client_heartbeat = created;
        resource.last_synced = created;

        let synced = ctl.sync_resource(resource, Utc::now()).await.unwrap();
        assert_eq!(synced.state, ResourceState::Terminating);
    }

    #[tokio::test]
    async fn sync_serving_terminates_on_unreachable_probe() {
        let adapter = FakeCloudAdapter::new();
        adapter.put_instance(Instance {
            name: "r-1".into(),
            status: InstanceStatus::Running,
            network_ip: Some("127.0.0.1".into()),
        });
        let ctl = DefaultController::new(Arc::new(adapter), params());
        let now = Utc::now();
        let mut resource = Resource::new_pending("r-1".into(), "pool-1".into(), now);
        resource.state = ResourceState::Serving;
        resource.meta.insert("addr".to_string(), "127.0.0.1:1".to_string());
        resource.last_synced = now - chrono::Duration::seconds(60);

        let synced = ctl.sync_resource(resource, now).await.unwrap();
        assert_eq!(synced.state, ResourceState::Terminating);
    }

    #[tokio::test]
    async fn sync_deleting_transitions_to_deleted_once_instance_is_gone() {
        let ctl = controller();
        let now = Utc::now();
        let mut resource = Resource::new_pending("r-1".into(), "pool-1".into(), now);
        resource.state = ResourceState::Deleting;

        let synced = ctl.sync_resource(resource, now).await.unwrap();
        assert_eq!(synced.state, ResourceState::Deleted);
    }

    #[tokio::test]
    async fn sync_deleted_is_a_no_op() {
        let ctl = controller();
        let now = Utc::now();
        let mut resource = Resource::new_pending("r-1".into(), "pool-1".into(), now);
        resource.state = ResourceState::Deleted;
        resource.last_synced = now - chrono::Duration::seconds(1000);
        let before = resource.clone();

        let synced = ctl.sync_resource(resource, now).await.unwrap();
        assert_eq!(synced, before);
    }
}
