/// 节点部署接口

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{Error, Phase};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use tracing::error;

use super::error::ApiError;
use crate::{
    app_state::AppState,
    db::models::{
        deployment_history::{HistoryEntryResponse, HistoryResponse},
        node::{NodeListResponse, NodeResponse, NodeStatsResponse, ProvisionNodeDto, ProvisionResponse},
    },
    services::{CleanupService, PhaseTracker, ProvisioningService},
};

/// 节点路由
pub fn node_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes).post(provision_node))
        .route("/stats", get(get_stats))
        .route("/:id", get(get_node).delete(delete_node))
        .route("/:id/history", get(get_history))
        .route("/:id/cleanup", post(cleanup_node))
        .route("/:id/reprovision", post(reprovision_node))
}

/// 分页查询参数
#[derive(Debug, Deserialize)]
pub struct ListNodesQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub phase: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

/// 通用响应
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

/// 后台执行分配，请求立即返回
fn spawn_allocation(state: AppState, node_id: String) {
    tokio::spawn(async move {
        let service = ProvisioningService::new(state);
        if let Err(e) = service.allocate(&node_id).await {
            error!("后台分配失败: node_id={}, error={}", node_id, e);
        }
    });
}

/// 提交部署请求
pub async fn provision_node(
    State(state): State<AppState>,
    payload: Result<Json<ProvisionNodeDto>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    let Json(dto) = payload?;

    let service = ProvisioningService::new(state.clone());
    let response = service.submit(dto).await?;
    spawn_allocation(state, response.node_id.clone());

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// 获取节点列表
pub async fn list_nodes(
    State(state): State<AppState>,
    query: Result<Query<ListNodesQuery>, QueryRejection>,
) -> Result<Json<NodeListResponse>, ApiError> {
    let Query(query) = query?;
    let phase = query.phase.as_deref().map(str::parse::<Phase>).transpose()?;

    let service = ProvisioningService::new(state);
    Ok(Json(service.list_nodes(query.page, query.page_size, phase).await?))
}

/// 获取节点统计
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<NodeStatsResponse>, ApiError> {
    let service = ProvisioningService::new(state);
    Ok(Json(service.stats().await?))
}

/// 获取节点状态
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeResponse>, ApiError> {
    let service = ProvisioningService::new(state);
    Ok(Json(service.get_node(&id).await?))
}

/// 获取部署历史
pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let tracker = PhaseTracker::new(state);
    Ok(Json(tracker.history(&id).await?))
}

/// 按管理地址查询历史
pub async fn get_history_by_address(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<Vec<HistoryEntryResponse>>, ApiError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::Validation(format!("无效的 IP 地址: {}", ip)))?;

    let tracker = PhaseTracker::new(state);
    Ok(Json(tracker.history_by_address(&ip.to_string()).await?))
}

/// 清理节点资源，未完成时返回 502 和清理报告
pub async fn cleanup_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let service = CleanupService::new(state);
    let report = service.cleanup(&id).await?;

    match report.error() {
        None => Ok(Json(report).into_response()),
        Some(err) => Ok((
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "success": false,
                "error": err.code(),
                "message": err.to_string(),
                "report": report,
            })),
        )
            .into_response()),
    }
}

/// 重新部署终态节点
pub async fn reprovision_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    let service = ProvisioningService::new(state.clone());
    let response = service.reprovision(&id).await?;
    spawn_allocation(state, response.node_id.clone());

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// 删除节点记录
pub async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let service = ProvisioningService::new(state);
    service.delete_node(&id).await?;

    Ok(Json(ApiResponse {
        success: true,
        message: "节点已删除".to_string(),
    }))
}
