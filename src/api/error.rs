use crate::logic::{OrchestrateError, QueryLifecycleError, RegistryError};
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

/// OPTIMADE error body: `{"errors": [{status, title, detail, source?}]}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorObject>,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub status: u16,
    pub title: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
}

#[derive(Debug, Serialize)]
pub struct ErrorSource {
    pub pointer: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<T, ApiError>;

pub fn error_response(status: StatusCode, title: &str, detail: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            errors: vec![ErrorObject {
                status: status.as_u16(),
                title: title.to_string(),
                detail: detail.into(),
                source: None,
            }],
        }),
    )
}

pub fn not_found(detail: impl Into<String>) -> ApiError {
    error_response(StatusCode::NOT_FOUND, "Not Found", detail)
}

pub fn bad_request(detail: impl Into<String>) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, "Bad Request", detail)
}

pub fn conflict(title: &str, detail: impl Into<String>) -> ApiError {
    error_response(StatusCode::CONFLICT, title, detail)
}

pub fn filter_not_supported() -> ApiError {
    error_response(
        StatusCode::BAD_REQUEST,
        "Filter Not Supported",
        "the `filter` query parameter is not supported at this endpoint",
    )
}

/// 500 with a stable title; the cause goes to the log, not the client.
pub fn internal(cause: impl std::fmt::Display) -> ApiError {
    log::error!("internal error: {cause}");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
        "an internal error occurred",
    )
}

pub fn from_store(error: StoreError) -> ApiError {
    match error {
        StoreError::NotFound => not_found("resource not found"),
        other => internal(other),
    }
}

pub fn from_registry(error: RegistryError) -> ApiError {
    match error {
        RegistryError::GatewayExists(id) => conflict(
            "Gateway Exists",
            format!("a gateway with id {id:?} already exists"),
        ),
        RegistryError::UnknownDatabase(id) => bad_request(format!(
            "no database registered under id {id:?}; register it first or supply a full descriptor"
        )),
        RegistryError::Store(StoreError::NotFound) => not_found("gateway not found"),
        other => internal(other),
    }
}

pub fn from_lifecycle(error: QueryLifecycleError) -> ApiError {
    match error {
        QueryLifecycleError::NotFound(id) => {
            not_found(format!("no query record with id {id:?}"))
        }
        other => internal(other),
    }
}

pub fn from_orchestrate(error: OrchestrateError) -> ApiError {
    match error {
        OrchestrateError::Registry(e) => from_registry(e),
        OrchestrateError::Lifecycle(e) => from_lifecycle(e),
    }
}
