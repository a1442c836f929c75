/// 网络拓扑接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use common::models::{RangeId, SubnetId, VlanId};
use validator::Validate;

use super::error::ApiError;
use crate::app_state::AppState;
use crate::services::controller_service::VlanDhcpDto;
use crate::services::topology_service::{
    CreateFabricDto, CreateRangeDto, CreateReservationDto, CreateSubnetDto, CreateVlanDto,
    UpdateSubnetDto,
};
use crate::services::{ControllerService, TopologyService};

/// 创建路由
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/topology", get(get_topology))
        .route("/fabrics", post(create_fabric))
        .route("/vlans", post(create_vlan))
        .route("/vlans/:vlan_id", delete(delete_vlan))
        .route("/vlans/:vlan_id/dhcp", put(configure_vlan_dhcp))
        .route("/peerings", get(list_peerings))
        .route("/subnets", post(create_subnet))
        .route("/subnets/:subnet_id", put(update_subnet))
        .route("/subnets/:subnet_id/ranges", post(add_range))
        .route("/subnets/:subnet_id/reservations", post(add_reservation))
        .route("/ranges/:range_id", delete(remove_range))
}

async fn get_topology(State(state): State<AppState>) -> impl IntoResponse {
    Json(TopologyService::new(state).snapshot().await)
}

async fn create_fabric(
    State(state): State<AppState>,
    Json(dto): Json<CreateFabricDto>,
) -> Result<impl IntoResponse, ApiError> {
    dto.validate()?;
    let fabric = TopologyService::new(state).create_fabric(dto).await?;
    Ok((StatusCode::CREATED, Json(fabric)))
}

async fn create_vlan(
    State(state): State<AppState>,
    Json(dto): Json<CreateVlanDto>,
) -> Result<impl IntoResponse, ApiError> {
    dto.validate()?;
    let vlan = TopologyService::new(state).create_vlan(dto).await?;
    Ok((StatusCode::CREATED, Json(vlan)))
}

async fn delete_vlan(
    State(state): State<AppState>,
    Path(vlan_id): Path<VlanId>,
) -> Result<impl IntoResponse, ApiError> {
    TopologyService::new(state).delete_vlan(vlan_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 设置 VLAN 的 DHCP 开关与主备机架
async fn configure_vlan_dhcp(
    State(state): State<AppState>,
    Path(vlan_id): Path<VlanId>,
    Json(dto): Json<VlanDhcpDto>,
) -> Result<impl IntoResponse, ApiError> {
    let service = ControllerService::new(state.clone());
    let peering = service.configure_vlan_dhcp(vlan_id, dto).await?;
    let vlan = state.registry.get_vlan(vlan_id).await?;
    Ok(Json(serde_json::json!({ "vlan": vlan, "peering": peering })))
}

async fn list_peerings(State(state): State<AppState>) -> impl IntoResponse {
    Json(ControllerService::new(state).peerings().await)
}

async fn create_subnet(
    State(state): State<AppState>,
    Json(dto): Json<CreateSubnetDto>,
) -> Result<impl IntoResponse, ApiError> {
    dto.validate()?;
    let subnet = TopologyService::new(state).create_subnet(dto).await?;
    Ok((StatusCode::CREATED, Json(subnet)))
}

async fn update_subnet(
    State(state): State<AppState>,
    Path(subnet_id): Path<SubnetId>,
    Json(dto): Json<UpdateSubnetDto>,
) -> Result<impl IntoResponse, ApiError> {
    let subnet = TopologyService::new(state).update_subnet(subnet_id, dto).await?;
    Ok(Json(subnet))
}

async fn add_range(
    State(state): State<AppState>,
    Path(subnet_id): Path<SubnetId>,
    Json(dto): Json<CreateRangeDto>,
) -> Result<impl IntoResponse, ApiError> {
    dto.validate()?;
    let range = TopologyService::new(state).add_range(subnet_id, dto).await?;
    Ok((StatusCode::CREATED, Json(range)))
}

async fn remove_range(
    State(state): State<AppState>,
    Path(range_id): Path<RangeId>,
) -> Result<impl IntoResponse, ApiError> {
    let range = TopologyService::new(state).remove_range(range_id).await?;
    Ok(Json(range))
}

async fn add_reservation(
    State(state): State<AppState>,
    Path(subnet_id): Path<SubnetId>,
    Json(dto): Json<CreateReservationDto>,
) -> Result<impl IntoResponse, ApiError> {
    let reservation = TopologyService::new(state)
        .add_host_reservation(subnet_id, dto)
        .await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}
