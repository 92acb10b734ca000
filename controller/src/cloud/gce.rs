//! A GCE-shaped `CloudAdapter`: talks to the Google Compute Engine v1
//! REST API directly over `reqwest` rather than through a generated
//! client SDK. The request/response shapes mirror
//! `google.golang.org/api/compute/v1` closely enough that
//! `FindLatestSnapshot`'s "filter server-side, order client-side"
//! workaround and `IsStatusNotFound`'s 404-as-not-found convention
//! carry over unchanged.

use super::{CloudAdapter, CloudError, Disk, DiskStatus, Instance, InstanceStatus, Placement, Snapshot};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1/projects";

pub struct GceAdapter {
    http: reqwest::Client,
    bearer_token: String,
}

impl GceAdapter {
    pub fn new(http: reqwest::Client, bearer_token: String) -> Self {
        Self { http, bearer_token }
    }

    fn instances_url(&self, placement: &Placement, instance: &str) -> String {
        format!(
            "{}/{}/zones/{}/instances/{}",
            COMPUTE_BASE, placement.project_id, placement.zone, instance
        )
    }

    fn disks_url(&self, placement: &Placement, disk: &str) -> String {
        format!(
            "{}/{}/zones/{}/disks/{}",
            COMPUTE_BASE, placement.project_id, placement.zone, disk
        )
    }

    fn snapshots_list_url(&self, project_id: &str, prefix: &str) -> String {
        format!(
            "{}/{}/global/snapshots?filter={}",
            COMPUTE_BASE,
            project_id,
            format!("(name = \"{}*\") AND (status = \"READY\")", prefix),
        )
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.bearer_token)
    }

    async fn map_status(resp: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            reqwest::StatusCode::NOT_FOUND => Err(CloudError::NotFound),
            s if s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                Err(CloudError::Transient { reason: format!("compute API returned {}", s) })
            }
            s => Err(CloudError::Transient { reason: format!("compute API returned {}", s) }),
        }
    }
}

#[derive(Deserialize)]
struct GceInstance {
    status: String,
    #[serde(rename = "networkInterfaces", default)]
    network_interfaces: Vec<GceNetworkInterface>,
}

#[derive(Deserialize)]
struct GceNetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
}

#[derive(Deserialize)]
struct GceDisk {
    status: String,
    #[serde(rename = "sourceSnapshot", default)]
    source_snapshot: Option<String>,
    #[serde(default)]
    users: Vec<String>,
}

#[derive(Deserialize)]
struct GceSnapshotList {
    #[serde(default)]
    items: Vec<GceSnapshot>,
}

#[derive(Deserialize)]
struct GceSnapshot {
    #[serde(rename = "selfLink")]
    self_link: String,
    name: String,
    #[serde(rename = "creationTimestamp")]
    creation_timestamp: chrono::DateTime<chrono::Utc>,
}

fn instance_status(raw: &str) -> InstanceStatus {
    match raw {
        "PROVISIONING" => InstanceStatus::Provisioning,
        "STAGING" => InstanceStatus::Staging,
        "RUNNING" => InstanceStatus::Running,
        "STOPPING" => InstanceStatus::Stopping,
        "STOPPED" | "SUSPENDED" | "SUSPENDING" => InstanceStatus::Stopped,
        "TERMINATED" => InstanceStatus::Terminated,
        _ => InstanceStatus::Other,
    }
}

fn disk_status(raw: &str) -> DiskStatus {
    match raw {
        "CREATING" => DiskStatus::Creating,
        "RESTORING" => DiskStatus::Restoring,
        "READY" => DiskStatus::Ready,
        "FAILED" => DiskStatus::Failed,
        _ => DiskStatus::Other,
    }
}

#[async_trait]
impl CloudAdapter for GceAdapter {
    async fn find_instance(&self, placement: &Placement, name: &str) -> Result<Option<Instance>, CloudError> {
        let resp = self
            .authed(self.http.get(self.instances_url(placement, name)))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        let resp = match Self::map_status(resp).await {
            Ok(r) => r,
            Err(CloudError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body: GceInstance = resp.json().await.map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        Ok(Some(Instance {
            name: name.to_string(),
            status: instance_status(&body.status),
            network_ip: body.network_interfaces.into_iter().next().and_then(|i| i.network_ip),
        }))
    }

    async fn find_disk(&self, placement: &Placement, name: &str) -> Result<Option<Disk>, CloudError> {
        let resp = self
            .authed(self.http.get(self.disks_url(placement, name)))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        let resp = match Self::map_status(resp).await {
            Ok(r) => r,
            Err(CloudError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body: GceDisk = resp.json().await.map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        Ok(Some(Disk {
            name: name.to_string(),
            status: disk_status(&body.status),
            source_snapshot: body.source_snapshot,
            users: body.users,
        }))
    }

    async fn find_latest_snapshot(
        &self,
        placement: &Placement,
        prefix: &str,
    ) -> Result<Option<Snapshot>, CloudError> {
        let resp = self
            .authed(self.http.get(self.snapshots_list_url(&placement.project_id, prefix)))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        let resp = Self::map_status(resp).await?;
        let body: GceSnapshotList = resp.json().await.map_err(|e| CloudError::Transient { reason: e.to_string() })?;

        // The provider rejects combining `filter` with `orderBy`, so the
        // newest-first ordering happens here, client-side.
        Ok(body
            .items
            .into_iter()
            .max_by_key(|s| s.creation_timestamp)
            .map(|s| Snapshot {
                self_link: s.self_link,
                name: s.name,
                creation_timestamp: s.creation_timestamp,
            }))
    }

    async fn create_disk(
        &self,
        placement: &Placement,
        name: &str,
        source_snapshot: &str,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        let url = format!(
            "{}/{}/zones/{}/disks?requestId={}",
            COMPUTE_BASE, placement.project_id, placement.zone, idempotency_token
        );
        let body = serde_json::json!({
            "name": name,
            "sourceSnapshot": source_snapshot,
        });
        let resp = self
            .authed(self.http.post(url).json(&body))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        Self::map_status(resp).await.map(drop)
    }

    async fn create_instance(
        &self,
        placement: &Placement,
        name: &str,
        disk_name: &str,
        startup_script: &str,
        labels: &HashMap<String, String>,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        let url = format!(
            "{}/{}/zones/{}/instances?requestId={}",
            COMPUTE_BASE, placement.project_id, placement.zone, idempotency_token
        );
        let body = serde_json::json!({
            "name": name,
            "machineType": format!("zones/{}/machineTypes/{}", placement.zone, placement.machine_type),
            "labels": labels,
            "disks": [{ "source": self.disks_url(placement, disk_name), "boot": true }],
            "networkInterfaces": [{ "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }] }],
            "scheduling": { "preemptible": true },
            "metadata": { "items": [{ "key": "startup-script", "value": startup_script }] },
        });
        let resp = self
            .authed(self.http.post(url).json(&body))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        Self::map_status(resp).await.map(drop)
    }

    async fn start_instance(&self, placement: &Placement, name: &str, idempotency_token: &str) -> Result<(), CloudError> {
        let url = format!("{}/start?requestId={}", self.instances_url(placement, name), idempotency_token);
        let resp = self
            .authed(self.http.post(url))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        Self::map_status(resp).await.map(drop)
    }

    async fn stop_instance(&self, placement: &Placement, name: &str, idempotency_token: &str) -> Result<(), CloudError> {
        let url = format!("{}/stop?requestId={}", self.instances_url(placement, name), idempotency_token);
        let resp = self
            .authed(self.http.post(url))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        Self::map_status(resp).await.map(drop)
    }

    async fn delete_instance(&self, placement: &Placement, name: &str, idempotency_token: &str) -> Result<(), CloudError> {
        let url = format!("{}?requestId={}", self.instances_url(placement, name), idempotency_token);
        let resp = self
            .authed(self.http.delete(url))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        Self::map_status(resp).await.map(drop)
    }

    async fn delete_disk(&self, placement: &Placement, name: &str, idempotency_token: &str) -> Result<(), CloudError> {
        let url = format!("{}?requestId={}", self.disks_url(placement, name), idempotency_token);
        let resp = self
            .authed(self.http.delete(url))
            .send()
            .await
            .map_err(|e| CloudError::Transient { reason: e.to_string() })?;
        Self::map_status(resp).await.map(drop)
    }
}
