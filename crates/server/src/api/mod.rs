pub mod boot;
pub mod client_ip;
pub mod error;
pub mod nodes;

use axum::{routing::get, Router};

use crate::app_state::AppState;

pub use error::ApiError;

/// 运维 API 路由
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/nodes", nodes::node_routes())
        .route("/history/:ip", get(nodes::get_history_by_address))
}

/// 启动中节点访问的路由
pub fn boot_routes() -> Router<AppState> {
    boot::boot_routes()
}
