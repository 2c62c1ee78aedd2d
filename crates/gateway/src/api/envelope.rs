//! The unified response envelope:
//! `{status: "ok"|"ACCEPTED"|"ERROR"|"processing", message?, stage?, data?}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use pv_domain::error::{Error, ErrorKind};

use crate::runtime::stage::Phase;

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub fn ok(data: Value) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            status: "ok",
            message: None,
            stage: None,
            data: Some(data),
        }),
    )
        .into_response()
}

pub fn ok_with_stage(data: Value, stage: Phase) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            status: "ok",
            message: None,
            stage: Some(stage.as_str()),
            data: Some(data),
        }),
    )
        .into_response()
}

pub fn accepted(data: Value) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse {
            status: "ACCEPTED",
            message: None,
            stage: None,
            data: Some(data),
        }),
    )
        .into_response()
}

pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// 102 Processing — the turn is still thinking and there is nothing new
/// to return yet.
pub fn processing(stage: Phase) -> Response {
    (
        StatusCode::PROCESSING,
        Json(ApiResponse {
            status: "processing",
            message: None,
            stage: Some(stage.as_str()),
            data: None,
        }),
    )
        .into_response()
}

pub fn error_response(err: &Error) -> Response {
    let code = match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Conflict | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Permanent | ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        code,
        Json(ApiResponse {
            status: "ERROR",
            message: Some(err.to_string()),
            stage: None,
            data: None,
        }),
    )
        .into_response()
}

/// Wrapper letting handlers bubble domain errors with `?`.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(&self.0)
    }
}

pub type ApiResult = std::result::Result<Response, ApiError>;
