//! The control-plane HTTP API: a hand-written `actix_web` scope, not
//! an openapi-generated one — four endpoints plus a liveness probe
//! doesn't earn the codegen machinery a much larger REST surface would.

mod error;
mod handlers;

pub use error::ApiError;

use crate::registry::Registry;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;

pub async fn run(registry: Arc<Registry>, addr: &str, shutdown: shutdown::Shutdown, grace: std::time::Duration) -> std::io::Result<()> {
    let data = web::Data::new(registry);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/livez", web::get().to(handlers::livez))
            .route("/resources/request", web::post().to(handlers::request_resource))
            .route("/resources/heartbeat", web::post().to(handlers::heartbeat))
            .route("/pools/{id}", web::get().to(handlers::get_pool))
            .route("/resources/{pool}/{id}", web::get().to(handlers::get_resource))
    })
    .bind(addr)?
    .shutdown_timeout(grace.as_secs())
    .run();

    let handle = server.handle();
    let waiter = shutdown.clone();
    tokio::spawn(async move {
        waiter.wait().await;
        handle.stop(true).await;
    });

    server.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use common_lib::config::{Config, ConfigHandle, PoolConfig};
    use common_lib::store::InMemoryResourceStore;
    use controller::cloud::{GceAdapter, RetryingAdapter};
    use std::collections::HashMap;

    fn test_registry() -> Arc<Registry> {
        let mut pools = HashMap::new();
        pools.insert(
            "pg11".to_string(),
            PoolConfig {
                plugin_command: None,
                params: serde_json::json!({
                    "snapshotPrefix": "pg11",
                    "snapshotProjectId": "proj",
                    "instanceProjectId": "proj",
                    "instanceZone": "us-central1-a",
                    "instanceMachine": "n1-standard-1",
                }),
            },
        );
        let config = ConfigHandle::new(Config { pools, database_map: HashMap::new() });
        let store = Arc::new(InMemoryResourceStore::new());
        let adapter = Arc::new(RetryingAdapter::new(GceAdapter::new(reqwest::Client::new(), "token".into())));
        Registry::new(config, store, adapter).unwrap()
    }

    #[actix_web::test]
    async fn request_resource_creates_a_pending_resource_for_an_empty_pool() {
        let registry = test_registry();
        let data = web::Data::new(registry);
        let app = test::init_service(
            App::new()
                .app_data(data.clone())
                .route("/resources/request", web::post().to(handlers::request_resource)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/resources/request")
            .set_json(serde_json::json!({"pool": "pg11", "client": {"id": "1.2.3.4:5", "meta": {}}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["state"], "pending");
        assert!(body["id"].as_str().unwrap().starts_with("godemand-pg11-"));
    }

    #[actix_web::test]
    async fn request_resource_rejects_an_unconfigured_pool() {
        let registry = test_registry();
        let data = web::Data::new(registry);
        let app = test::init_service(
            App::new()
                .app_data(data.clone())
                .route("/resources/request", web::post().to(handlers::request_resource)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/resources/request")
            .set_json(serde_json::json!({"pool": "nope", "client": {"id": "x", "meta": {}}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn heartbeat_returns_gone_for_a_missing_resource() {
        let registry = test_registry();
        let data = web::Data::new(registry);
        let app = test::init_service(
            App::new()
                .app_data(data.clone())
                .route("/resources/heartbeat", web::post().to(handlers::heartbeat)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/resources/heartbeat")
            .set_json(serde_json::json!({"pool": "pg11", "resource_id": "r-1", "client": {"id": "x", "meta": {}}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::GONE);
    }

    #[actix_web::test]
    async fn get_pool_creates_an_empty_pool_on_first_touch() {
        let registry = test_registry();
        let data = web::Data::new(registry);
        let app = test::init_service(App::new().app_data(data.clone()).route("/pools/{id}", web::get().to(handlers::get_pool))).await;

        let req = test::TestRequest::get().uri("/pools/pg11").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["id"], "pg11");
    }
}
