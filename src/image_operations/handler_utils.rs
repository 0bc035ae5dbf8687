// handler_utils.rs
//
// Error taxonomy shared by every surface, mapped to HTTP at the edge.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    LengthRequired,
    PayloadTooLarge,
    UnsupportedMediaType,
    GatewayTimeout,
    ServiceUnavailable,
    Internal(anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::LengthRequired => StatusCode::LENGTH_REQUIRED,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::BadRequest(msg) => msg.clone(),
            AppError::Unauthorized => "unauthorized".to_string(),
            AppError::Forbidden => "forbidden".to_string(),
            AppError::NotFound => "not found".to_string(),
            AppError::Conflict => "conflict".to_string(),
            AppError::LengthRequired => "length required".to_string(),
            AppError::PayloadTooLarge => "payload too large".to_string(),
            AppError::UnsupportedMediaType => "unsupported media type".to_string(),
            AppError::GatewayTimeout => "timeout".to_string(),
            AppError::ServiceUnavailable => "service unavailable".to_string(),
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                "internal error".to_string()
            }
        };

        let mut resp = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        resp
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.into())
    }
}

/// Body of `GET /files` list responses.
#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub keys: Vec<String>,
    pub has_more: bool,
    pub next_page: String,
}
