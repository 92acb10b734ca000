//! The Cloud Compute Adapter: everything the controller needs to
//! observe and mutate compute instances, disks and snapshots, plus a
//! uniform retry wrapper that adds idempotency tokens on top of any
//! implementation.

mod fake;
mod gce;
mod retry;

pub use fake::FakeCloudAdapter;
pub use gce::GceAdapter;
pub use retry::RetryingAdapter;

use async_trait::async_trait;
use snafu::Snafu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Stopped,
    Terminated,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Creating,
    Restoring,
    Ready,
    Failed,
    Other,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub status: InstanceStatus,
    /// Internal IP once `Running`; used for `meta.addr`/`meta.load`.
    pub network_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Disk {
    pub name: String,
    pub status: DiskStatus,
    pub source_snapshot: Option<String>,
    /// Non-empty while another instance still references the disk.
    pub users: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub self_link: String,
    pub name: String,
    pub creation_timestamp: chrono::DateTime<chrono::Utc>,
}

/// Parameters the adapter needs to locate or create cloud resources:
/// project, zone and machine type, threaded through from
/// `ControllerParams`.
#[derive(Debug, Clone)]
pub struct Placement {
    pub project_id: String,
    pub zone: String,
    pub machine_type: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CloudError {
    #[snafu(display("resource not found"))]
    NotFound,

    #[snafu(display("transient cloud API error: {}", reason))]
    Transient { reason: String },

    #[snafu(display("disk entered FAILED state"))]
    DiskFailed,

    #[snafu(display("operation exhausted its retry budget: {}", reason))]
    RetriesExhausted { reason: String },
}

/// The raw, non-retrying operations against the cloud provider. A
/// production implementation (`GceAdapter`) talks to the real compute
/// API; `FakeCloudAdapter` is the in-memory double used by tests.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    async fn find_instance(&self, placement: &Placement, name: &str) -> Result<Option<Instance>, CloudError>;
    async fn find_disk(&self, placement: &Placement, name: &str) -> Result<Option<Disk>, CloudError>;

    /// Lists snapshots named `<prefix>*` with status READY, returns the
    /// one with the newest `creation_timestamp`. Ordering happens on the
    /// client side: providers generally reject combining a name filter
    /// with a server-side order-by.
    async fn find_latest_snapshot(
        &self,
        placement: &Placement,
        prefix: &str,
    ) -> Result<Option<Snapshot>, CloudError>;

    async fn create_disk(
        &self,
        placement: &Placement,
        name: &str,
        source_snapshot: &str,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    async fn create_instance(
        &self,
        placement: &Placement,
        name: &str,
        disk_name: &str,
        startup_script: &str,
        labels: &std::collections::HashMap<String, String>,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    async fn start_instance(
        &self,
        placement: &Placement,
        name: &str,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    async fn stop_instance(
        &self,
        placement: &Placement,
        name: &str,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    async fn delete_instance(
        &self,
        placement: &Placement,
        name: &str,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    async fn delete_disk(
        &self,
        placement: &Placement,
        name: &str,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;
}
