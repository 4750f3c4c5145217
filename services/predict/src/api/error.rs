use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Request failures, each mapped to one HTTP status
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request!")]
    RequestMalformed,

    #[error("not found!")]
    NotFound,

    #[error("method not allowed!")]
    MethodNotAllowed,

    #[error("payload too large!")]
    PayloadTooLarge,

    #[error("unsupported media type!")]
    UnsupportedMedia,

    /// Details are logged and alerted, never returned to the client
    #[error("internal server error!")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RequestMalformed => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMedia => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::RequestMalformed => "BAD_REQUEST",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ApiError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ApiError::UnsupportedMedia => "UNSUPPORTED_MEDIA_TYPE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn internal(details: impl std::fmt::Display) -> Self {
        ApiError::Internal(details.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                error: self.to_string(),
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}
