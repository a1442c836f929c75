/// 机器与电源接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use validator::Validate;

use super::error::ApiError;
use crate::app_state::AppState;
use crate::db::models::machine::{CreateMachineDto, PowerRequestDto};
use crate::services::MachineService;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_machines).post(create_machine))
        .route("/:system_id", get(get_machine).delete(delete_machine))
        .route("/:system_id/power", post(power_action).get(power_history))
}

async fn list_machines(State(state): State<AppState>) -> impl IntoResponse {
    Json(MachineService::new(state).list_machines().await)
}

async fn create_machine(
    State(state): State<AppState>,
    Json(dto): Json<CreateMachineDto>,
) -> Result<impl IntoResponse, ApiError> {
    dto.validate()?;
    let machine = MachineService::new(state).create_machine(dto).await?;
    Ok((StatusCode::CREATED, Json(machine)))
}

async fn get_machine(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let machine = MachineService::new(state).get_machine(&system_id).await?;
    Ok(Json(machine))
}

async fn delete_machine(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    MachineService::new(state).delete_machine(&system_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 电源操作，阻塞到操作结束或超时
async fn power_action(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
    Json(dto): Json<PowerRequestDto>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = MachineService::new(state).power(&system_id, dto.action).await?;
    Ok(Json(operation))
}

async fn power_history(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let history = MachineService::new(state).power_history(&system_id).await?;
    Ok(Json(history))
}
