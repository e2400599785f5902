use super::parse_id;
use crate::error::ApiError;
use crate::middleware::AuthenticatedUser;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use pgclone_common::{Image, NewImage};
use tracing::info;

pub async fn list_images_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Image>>, ApiError> {
    Ok(Json(state.images.list_images().await?))
}

pub async fn get_image_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Image>, ApiError> {
    let id = parse_id(&id, "id")?;
    Ok(Json(state.images.get_image(id).await?))
}

pub async fn create_image_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Result<Json<NewImage>, JsonRejection>,
) -> Result<(StatusCode, Json<Image>), ApiError> {
    let Json(new_image) = payload?;
    let image = state.images.create_image(new_image).await?;
    info!(image_id = image.id, user = %user.0, "Image registered");
    Ok((StatusCode::CREATED, Json(image)))
}

/// Finalise an uploaded image.
pub async fn done_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<Image>, ApiError> {
    let id = parse_id(&id, "id")?;
    let image = state.images.finalise_image(id).await?;
    info!(image_id = id, user = %user.0, "Image finalised");
    Ok(Json(image))
}

pub async fn destroy_image_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id, "id")?;
    state.images.destroy_image(id).await?;
    info!(image_id = id, user = %user.0, "Image destroyed");
    Ok(StatusCode::NO_CONTENT)
}
