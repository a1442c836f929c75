/// 控制器接口

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use super::error::ApiError;
use crate::app_state::AppState;
use crate::services::controller_service::DeleteControllerQuery;
use crate::services::ControllerService;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_controllers))
        .route("/:system_id", get(get_controller).delete(delete_controller))
}

async fn list_controllers(State(state): State<AppState>) -> impl IntoResponse {
    Json(ControllerService::new(state).list_controllers().await)
}

async fn get_controller(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node = ControllerService::new(state).get_controller(&system_id).await?;
    Ok(Json(node))
}

/// 注销控制器；唯一主控需要 `?force=true`
async fn delete_controller(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
    Query(query): Query<DeleteControllerQuery>,
) -> Result<impl IntoResponse, ApiError> {
    ControllerService::new(state)
        .delete_controller(&system_id, query.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
