//! The four HTTP endpoints a proxy or operator talks to, plus a
//! liveness probe. `Request-Resource` is the sole way a resource is
//! created; `Heartbeat` is the only other pool-locked write. The two
//! `GET` endpoints are lock-free reads.

use actix_web::{web, HttpResponse};
use chrono::Utc;
use common_lib::model::{Client, Resource};
use std::sync::Arc;

use super::error::ApiError;
use crate::registry::Registry;

#[derive(serde::Deserialize)]
pub struct RequestResourceBody {
    pub pool: String,
    #[serde(default)]
    pub client: Client,
}

#[derive(serde::Deserialize)]
pub struct HeartbeatBody {
    pub pool: String,
    pub resource_id: String,
    #[serde(default)]
    pub client: Client,
}

pub async fn request_resource(registry: web::Data<Arc<Registry>>, body: web::Json<RequestResourceBody>) -> Result<HttpResponse, ApiError> {
    let RequestResourceBody { pool: pool_id, client } = body.into_inner();
    let controller = registry.controller_for(&pool_id)?;
    let now = Utc::now();

    let store = registry.store();
    let store_for_closure = store.clone();
    let result_slot: Arc<tokio::sync::Mutex<Option<Result<Resource, ApiError>>>> = Arc::new(tokio::sync::Mutex::new(None));
    let slot_for_closure = result_slot.clone();
    let pool_id_for_closure = pool_id.clone();

    store
        .with_lock(
            &pool_id,
            Box::new(move || {
                Box::pin(async move {
                    let outcome: Result<Resource, ApiError> = async {
                        let pool = store_for_closure.get_pool(&pool_id_for_closure).await?;
                        let mut chosen = controller.find_resource(&pool, &client, now).await?;
                        chosen.last_client_heartbeat = now;
                        chosen.last_synced = now;
                        let saved = store_for_closure.save_resource(&pool_id_for_closure, chosen).await?;
                        Ok(saved)
                    }
                    .await;
                    *slot_for_closure.lock().await = Some(outcome);
                    Ok(())
                })
            }),
        )
        .await?;

    let outcome = result_slot.lock().await.take().expect("with_lock always invokes its closure exactly once");
    Ok(HttpResponse::Ok().json(outcome?))
}

pub async fn heartbeat(registry: web::Data<Arc<Registry>>, body: web::Json<HeartbeatBody>) -> Result<HttpResponse, ApiError> {
    let HeartbeatBody { pool: pool_id, resource_id, client: _client } = body.into_inner();
    let now = Utc::now();

    let store = registry.store();
    let store_for_closure = store.clone();
    let result_slot: Arc<tokio::sync::Mutex<Option<Result<(), ApiError>>>> = Arc::new(tokio::sync::Mutex::new(None));
    let slot_for_closure = result_slot.clone();
    let pool_id_for_closure = pool_id.clone();
    let resource_id_for_closure = resource_id.clone();

    store
        .with_lock(
            &pool_id,
            Box::new(move || {
                Box::pin(async move {
                    let outcome: Result<(), ApiError> = async {
                        let mut pool = store_for_closure.get_pool(&pool_id_for_closure).await?;
                        let resource = pool.resources.remove(&resource_id_for_closure).filter(|r| !r.state.is_terminal());
                        match resource {
                            Some(mut resource) => {
                                resource.last_client_heartbeat = now;
                                store_for_closure.save_resource(&pool_id_for_closure, resource).await?;
                                Ok(())
                            }
                            None => Err(ApiError::ResourceGone {
                                pool_id: pool_id_for_closure.clone(),
                                resource_id: resource_id_for_closure.clone(),
                            }),
                        }
                    }
                    .await;
                    *slot_for_closure.lock().await = Some(outcome);
                    Ok(())
                })
            }),
        )
        .await?;

    result_slot.lock().await.take().expect("with_lock always invokes its closure exactly once")?;
    Ok(HttpResponse::Ok().json(serde_json::json!({})))
}

pub async fn get_pool(registry: web::Data<Arc<Registry>>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let pool_id = path.into_inner();
    let pool = registry.store().get_pool(&pool_id).await?;
    Ok(HttpResponse::Ok().json(pool))
}

pub async fn get_resource(registry: web::Data<Arc<Registry>>, path: web::Path<(String, String)>) -> Result<HttpResponse, ApiError> {
    let (pool_id, resource_id) = path.into_inner();
    let pool = registry.store().get_pool(&pool_id).await?;
    match pool.resources.get(&resource_id) {
        Some(resource) => Ok(HttpResponse::Ok().json(resource)),
        None => Err(ApiError::ResourceNotFound { pool_id, resource_id }),
    }
}

pub async fn livez() -> HttpResponse {
    HttpResponse::Ok().finish()
}
