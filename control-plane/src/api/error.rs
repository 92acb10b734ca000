//! Maps the HTTP API's failure modes onto status codes: store
//! unavailability is fatal to the call (503), an unconfigured pool or a
//! missing resource is a client-facing 404, a heartbeat against a
//! gone/terminal resource is 410.

use actix_web::{HttpResponse, ResponseError};
use common_lib::store::StoreError;
use controller::ControllerError;
use snafu::Snafu;

use crate::registry::RegistryError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("store unavailable: {}", source))]
    Store { source: StoreError },

    #[snafu(display("pool '{}' is not configured", pool_id))]
    UnknownPool { pool_id: String },

    #[snafu(display("resource '{}' in pool '{}' does not exist", resource_id, pool_id))]
    ResourceNotFound { pool_id: String, resource_id: String },

    #[snafu(display("resource '{}' in pool '{}' is gone or terminal", resource_id, pool_id))]
    ResourceGone { pool_id: String, resource_id: String },

    #[snafu(display("controller failed to select a resource: {}", source))]
    Controller { source: ControllerError },

    #[snafu(display("controller misconfiguration: {}", source))]
    Config { source: RegistryError },
}

impl From<StoreError> for ApiError {
    fn from(source: StoreError) -> Self {
        ApiError::Store { source }
    }
}

impl From<ControllerError> for ApiError {
    fn from(source: ControllerError) -> Self {
        ApiError::Controller { source }
    }
}

impl From<RegistryError> for ApiError {
    fn from(source: RegistryError) -> Self {
        match source {
            RegistryError::UnknownPool { pool_id } => ApiError::UnknownPool { pool_id },
            other => ApiError::Config { source: other },
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            ApiError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UnknownPool { .. } => StatusCode::NOT_FOUND,
            ApiError::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::ResourceGone { .. } => StatusCode::GONE,
            ApiError::Controller { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({ "error": self.to_string() }))
    }
}
