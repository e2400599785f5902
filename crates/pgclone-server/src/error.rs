//! The error document every API failure is rendered as.

use crate::correlator::{CallbackError, CorrelatorError};
use crate::lifecycle::LifecycleError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub id: String,
    pub status: String,
    pub code: String,
    pub title: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, title: &str, detail: impl Into<String>) -> Self {
        Self {
            id: code.to_string(),
            status: status.as_u16().to_string(),
            code: code.to_string(),
            title: title.to_string(),
            detail: detail.into(),
            source: None,
        }
    }

    pub fn with_parameter(mut self, parameter: &str) -> Self {
        self.source = Some(ErrorSource {
            pointer: None,
            parameter: Some(parameter.to_string()),
        });
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
            .parse()
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_server_error",
            "Internal Server Error",
            "Something went wrong :(",
        )
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "resource_not_found",
            "Resource Not Found",
            detail,
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Unauthorized",
            "You do not have permission to view this resource",
        )
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", "Conflict", detail)
    }

    pub fn bad_request(detail: impl Into<String>, parameter: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", "Bad Request", detail)
            .with_parameter(parameter)
    }

    pub fn invalid_json(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_json", "Invalid JSON", detail)
    }

    pub fn oauth_error(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "oauth_error", "OAuth Error", detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unprocessable_entity",
            "Unprocessable Entity",
            detail,
        )
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout", "Timeout", detail)
    }

    pub fn service_unavailable(code: &str, detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            code,
            "Service Unavailable",
            detail,
        )
    }

    /// A handler needed an authenticated user but none was attached.
    pub fn missing_identity() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "missing_identity",
            "Internal Server Error",
            "Could not acquire authenticated user",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::invalid_json(rejection.body_text())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound { kind, id } => {
                ApiError::not_found(format!("{kind} {id} could not be found"))
            }
            LifecycleError::ImageNotReady(_) => ApiError::unprocessable(err.to_string()),
            LifecycleError::Conflict(detail) => ApiError::conflict(detail),
            LifecycleError::NoPortAvailable { .. } => {
                ApiError::service_unavailable("no_port_available", err.to_string())
            }
            LifecycleError::ProvisionTimedOut { .. }
            | LifecycleError::Executor(_)
            | LifecycleError::Store(_) => {
                error!(error = %err, "Request failed");
                ApiError::internal()
            }
        }
    }
}

impl From<CorrelatorError> for ApiError {
    fn from(err: CorrelatorError) -> Self {
        match err {
            CorrelatorError::DuplicateState => {
                ApiError::conflict(err.to_string()).with_parameter("state")
            }
            CorrelatorError::TimedOut(_)
            | CorrelatorError::Callback(CallbackError::ExchangeTimedOut(_)) => {
                ApiError::timeout(err.to_string())
            }
            CorrelatorError::Callback(e) => ApiError::oauth_error(e.to_string()),
            CorrelatorError::Abandoned => {
                error!(error = %err, "Token request failed");
                ApiError::internal()
            }
        }
    }
}
