use super::parse_id;
use crate::error::ApiError;
use crate::middleware::AuthenticatedUser;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use pgclone_common::Instance;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub image_id: String,
}

pub async fn list_instances_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Instance>>, ApiError> {
    Ok(Json(state.instances.list_instances().await?))
}

pub async fn get_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    let id = parse_id(&id, "id")?;
    Ok(Json(state.instances.get_instance(id).await?))
}

pub async fn create_instance_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Instance>), ApiError> {
    let Json(request) = payload?;
    let image_id = parse_id(&request.image_id, "image_id")?;

    let instance = state.instances.create_instance(image_id).await?;
    info!(
        instance_id = instance.id,
        image_id,
        port = instance.port,
        user = %user.0,
        "Instance created"
    );
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn destroy_instance_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id, "id")?;
    state.instances.destroy_instance(id).await?;
    info!(instance_id = id, user = %user.0, "Instance destroyed");
    Ok(StatusCode::NO_CONTENT)
}
