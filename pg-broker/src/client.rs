//! Thin `reqwest` client for the two control-plane endpoints the broker
//! calls: `Request-Resource` on connection resolution, `Heartbeat` while
//! a session is active.

use common_lib::model::{Client, Resource};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("request to control plane at {} failed: {}", url, source))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("control plane at {} returned {}: {}", url, status, body))]
    Status { url: String, status: reqwest::StatusCode, body: String },
}

pub struct GodemandClient {
    http: reqwest::Client,
    base_url: String,
}

impl GodemandClient {
    pub fn new(base_url: String) -> Self {
        Self { http: reqwest::Client::new(), base_url }
    }

    pub async fn request_resource(&self, pool: &str, client: Client) -> Result<Resource, ClientError> {
        let url = format!("{}/resources/request", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "pool": pool, "client": client }))
            .send()
            .await
            .context(Request { url: url.clone() })?;
        Self::parse_json(url, resp).await
    }

    pub async fn heartbeat(&self, pool: &str, resource_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/resources/heartbeat", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "pool": pool, "resource_id": resource_id }))
            .send()
            .await
            .context(Request { url: url.clone() })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Self::status_err(url, resp).await
        }
    }

    async fn parse_json(url: String, resp: reqwest::Response) -> Result<Resource, ClientError> {
        if resp.status().is_success() {
            resp.json().await.context(Request { url })
        } else {
            Self::status_err(url, resp).await
        }
    }

    async fn status_err<T>(url: String, resp: reqwest::Response) -> Result<T, ClientError> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Status { url, status, body }.fail()
    }
}
