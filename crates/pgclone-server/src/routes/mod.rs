//! HTTP handlers. Authentication is applied by the router, see
//! [`crate::create_app`].

pub mod access_tokens;
pub mod images;
pub mod instances;

use crate::error::ApiError;
use axum::response::IntoResponse;
use axum::Json;
use pgclone_common::ImageId;

pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Resource ids arrive as strings; anything but a positive integer is a
/// client error naming `parameter`.
pub(crate) fn parse_id(raw: &str, parameter: &str) -> Result<ImageId, ApiError> {
    match raw.trim().parse::<ImageId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::bad_request(
            format!("{raw:?} is not a valid {parameter}"),
            parameter,
        )),
    }
}
