use super::{CloudAdapter, CloudError, Disk, Instance, Placement, Snapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_RETRIES: usize = 5;
const RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Wraps any `CloudAdapter` with the uniform retry policy: one fresh
/// idempotency token per logical call reused across every attempt, a
/// 1 s sleep between attempts, `not-found` treated as success for
/// delete/stop/start, and the first success (or the last error on
/// exhaustion) returned. Read-only lookups pass straight through —
/// only mutating calls are retried.
pub struct RetryingAdapter<A> {
    inner: A,
    retries: usize,
}

impl<A: CloudAdapter> RetryingAdapter<A> {
    pub fn new(inner: A) -> Self {
        Self { inner, retries: DEFAULT_RETRIES }
    }

    pub fn with_retries(inner: A, retries: usize) -> Self {
        Self { inner, retries }
    }

    /// Run `op` up to `self.retries` times, sleeping 1 s between
    /// attempts. `op` receives the same idempotency token on every
    /// attempt. `treat_not_found_as_success` makes a `NotFound` error
    /// resolve to `Ok(())` immediately, per the delete/stop/start
    /// contract.
    async fn retry_mutation<'a, F, Fut>(&'a self, treat_not_found_as_success: bool, mut op: F) -> Result<(), CloudError>
    where
        F: FnMut(&'a A, String) -> Fut,
        Fut: std::future::Future<Output = Result<(), CloudError>>,
    {
        let token = Uuid::new_v4().to_string();
        let mut last_err = None;
        for attempt in 0..self.retries.max(1) {
            match op(&self.inner, token.clone()).await {
                Ok(()) => return Ok(()),
                Err(CloudError::NotFound) if treat_not_found_as_success => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "cloud API call failed, retrying");
                    last_err = Some(e);
                    if attempt + 1 < self.retries {
                        tokio::time::sleep(RETRY_SLEEP).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(CloudError::RetriesExhausted {
            reason: "no attempts were made".into(),
        }))
    }
}

#[async_trait]
impl<A: CloudAdapter + Sync> CloudAdapter for RetryingAdapter<A> {
    async fn find_instance(&self, placement: &Placement, name: &str) -> Result<Option<Instance>, CloudError> {
        self.inner.find_instance(placement, name).await
    }

    async fn find_disk(&self, placement: &Placement, name: &str) -> Result<Option<Disk>, CloudError> {
        self.inner.find_disk(placement, name).await
    }

    async fn find_latest_snapshot(
        &self,
        placement: &Placement,
        prefix: &str,
    ) -> Result<Option<Snapshot>, CloudError> {
        self.inner.find_latest_snapshot(placement, prefix).await
    }

    async fn create_disk(
        &self,
        placement: &Placement,
        name: &str,
        source_snapshot: &str,
        _idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.retry_mutation(false, |inner, token| {
            inner.create_disk(placement, name, source_snapshot, &token)
        })
        .await
    }

    async fn create_instance(
        &self,
        placement: &Placement,
        name: &str,
        disk_name: &str,
        startup_script: &str,
        labels: &HashMap<String, String>,
        _idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.retry_mutation(false, |inner, token| {
            inner.create_instance(placement, name, disk_name, startup_script, labels, &token)
        })
        .await
    }

    async fn start_instance(&self, placement: &Placement, name: &str, _idempotency_token: &str) -> Result<(), CloudError> {
        self.retry_mutation(true, |inner, token| inner.start_instance(placement, name, &token))
            .await
    }

    async fn stop_instance(&self, placement: &Placement, name: &str, _idempotency_token: &str) -> Result<(), CloudError> {
        self.retry_mutation(true, |inner, token| inner.stop_instance(placement, name, &token))
            .await
    }

    async fn delete_instance(&self, placement: &Placement, name: &str, _idempotency_token: &str) -> Result<(), CloudError> {
        self.retry_mutation(true, |inner, token| inner.delete_instance(placement, name, &token))
            .await
    }

    async fn delete_disk(&self, placement: &Placement, name: &str, _idempotency_token: &str) -> Result<(), CloudError> {
        self.retry_mutation(true, |inner, token| inner.delete_disk(placement, name, &token))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::FakeCloudAdapter;
    use super::*;

    #[tokio::test]
    async fn delete_on_missing_instance_is_treated_as_success() {
        let fake = FakeCloudAdapter::new();
        let retrying = RetryingAdapter::new(fake);
        let placement = Placement {
            project_id: "p".into(),
            zone: "z".into(),
            machine_type: "m".into(),
        };
        retrying
            .delete_instance(&placement, "does-not-exist", "ignored")
            .await
            .expect("not-found should be treated as success");
    }

    #[tokio::test]
    async fn repeated_create_instance_calls_settle_on_one_instance() {
        let fake = FakeCloudAdapter::new();
        let placement = Placement {
            project_id: "p".into(),
            zone: "z".into(),
            machine_type: "m".into(),
        };
        fake.put_disk(super::Disk {
            name: "disk-1".into(),
            status: super::DiskStatus::Ready,
            source_snapshot: Some("snap-1".into()),
            users: vec![],
        });
        let retrying = RetryingAdapter::new(fake);
        let labels = HashMap::new();
        for _ in 0..2 {
            retrying
                .create_instance(&placement, "inst-1", "disk-1", "#!/bin/sh", &labels, "ignored")
                .await
                .unwrap();
        }
        let created = retrying.find_instance(&placement, "inst-1").await.unwrap();
        assert!(created.is_some());
    }
}
