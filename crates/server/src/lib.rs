/// HCI Provisioner - Server
///
/// 裸金属节点部署编排：分配云网络资源、下发启动配置、跟踪部署阶段、清理资源

pub mod api;
pub mod app_state;
pub mod boot;
pub mod cloud;
pub mod config;
pub mod db;
pub mod locks;
pub mod metrics;
pub mod services;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app_state::AppState;

/// 构建完整路由
pub fn build_router(state: AppState) -> Router {
    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api::api_routes())
        .nest("/boot", api::boot_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_handler() -> &'static str {
    "HCI Provisioner API v1"
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.sea_db.ping().await.is_ok();
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if database { "ok" } else { "degraded" },
            "database": database,
            "cloud_provider": state.cloud.provider_type(),
        })),
    )
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
}
