use crate::store::StoreError;
use crate::upstream::UpstreamCallError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorEnvelope {
    pub(crate) error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) message: String,
    #[serde(rename = "type")]
    pub(crate) error_type: String,
    pub(crate) param: Option<String>,
    pub(crate) code: String,
}

impl From<&AppError> for ErrorEnvelope {
    fn from(err: &AppError) -> Self {
        ErrorEnvelope {
            error: ErrorBody {
                message: err.message.clone(),
                error_type: err.error_type.clone(),
                param: err.param.clone(),
                code: err.code.clone(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope::from(&self);
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures of the chat relay core.
///
/// Tokenizer failures never show up here: they are logged and counted as
/// zero tokens, never surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid user token")]
    Auth,
    #[error("license expires")]
    LicenseExpired,
    #[error("content is empty")]
    EmptyContent,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("upstream error: {}", .0.message)]
    Upstream(UpstreamCallError),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl From<UpstreamCallError> for RelayError {
    fn from(err: UpstreamCallError) -> Self {
        RelayError::Upstream(err)
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        let message = err.to_string();
        match err {
            RelayError::Auth => AppError::new(StatusCode::FORBIDDEN, "invalid_user", message)
                .with_type("authentication_error"),
            RelayError::LicenseExpired => {
                AppError::new(StatusCode::FORBIDDEN, "license_expired", message)
                    .with_type("authentication_error")
            }
            RelayError::EmptyContent => {
                AppError::new(StatusCode::BAD_REQUEST, "content_empty", message)
                    .with_param("messages")
            }
            RelayError::InvalidPayload(_) => {
                AppError::new(StatusCode::BAD_REQUEST, "invalid_payload", message)
            }
            RelayError::Upstream(up) => {
                let status = up.status.unwrap_or(StatusCode::BAD_GATEWAY);
                let code = up.code.unwrap_or_else(|| "upstream_error".to_string());
                AppError::new(status, code, message).with_type("upstream_error")
            }
            RelayError::Persistence(_) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "persistence_error", message)
                    .with_type("server_error")
            }
        }
    }
}
