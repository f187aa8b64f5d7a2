/// 启动中节点使用的接口
///
/// 脚本按来源地址下发，配置文档按路径中的管理 IP 下发，阶段回调默认以来源地址定位节点

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use common::{Error, Phase, PhaseStatus};
use serde::Deserialize;
use std::net::IpAddr;

use super::client_ip::ClientIp;
use super::error::ApiError;
use crate::{
    app_state::AppState,
    services::{BootConfigService, CallbackTarget, PhaseReport, PhaseTracker, PhaseUpdateResponse},
};

pub fn boot_routes() -> Router<AppState> {
    Router::new()
        .route("/script", get(boot_script))
        .route("/server/:ip", get(server_config))
        .route("/phase", post(phase_callback))
}

/// 阶段回调请求
#[derive(Debug, Deserialize)]
pub struct PhaseCallbackRequest {
    /// 不提供时按来源地址定位节点
    pub node_id: Option<String>,
    pub phase: String,
    pub status: String,
    pub message: Option<String>,
}

/// iPXE 启动脚本
pub async fn boot_script(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
) -> Result<impl IntoResponse, ApiError> {
    let service = BootConfigService::new(state);
    let script = service.boot_script(ip).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], script))
}

/// 节点 JSON 配置
pub async fn server_config(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::Validation(format!("无效的 IP 地址: {}", ip)))?;

    let service = BootConfigService::new(state);
    let document = service.server_config(ip).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], document))
}

/// 阶段回调
pub async fn phase_callback(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    payload: Result<Json<PhaseCallbackRequest>, JsonRejection>,
) -> Result<Json<PhaseUpdateResponse>, ApiError> {
    let Json(request) = payload?;
    let report = PhaseReport {
        phase: request.phase.parse::<Phase>()?,
        status: request.status.parse::<PhaseStatus>()?,
        message: request.message,
    };

    let target = match request.node_id {
        Some(node_id) => CallbackTarget::NodeId(node_id),
        None => CallbackTarget::Address(ip),
    };

    let tracker = PhaseTracker::new(state);
    Ok(Json(tracker.apply_callback(target, report).await?))
}
