/// 集群配置接口

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};

use super::error::ApiError;
use crate::app_state::AppState;
use crate::services::settings_service::SetSettingDto;
use crate::services::SettingsService;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_settings))
        .route("/:name", put(set_setting))
}

async fn list_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(SettingsService::new(state).list_settings().await)
}

async fn set_setting(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(dto): Json<SetSettingDto>,
) -> Result<impl IntoResponse, ApiError> {
    let setting = SettingsService::new(state).set_setting(&name, &dto.value).await?;
    Ok(Json(setting))
}
