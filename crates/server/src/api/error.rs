/// 错误到 HTTP 响应的映射

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::Error;
use serde_json::json;
use tracing::error;

/// API 错误
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PhaseConflict { .. } | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Allocation { .. } | Error::Cleanup(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("请求处理失败: code={}, error={}", self.0.code(), self.0);
        }

        let body = match &self.0 {
            // 冲突响应带上当前权威阶段
            Error::PhaseConflict {
                current,
                reported,
                reason,
            } => json!({
                "success": false,
                "accepted": false,
                "error": self.0.code(),
                "message": self.0.to_string(),
                "current_phase": current,
                "reported_phase": reported,
                "reason": reason,
            }),
            other => json!({
                "success": false,
                "error": other.code(),
                "message": other.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}
