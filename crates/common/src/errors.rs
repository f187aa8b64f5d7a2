use thiserror::Error;

use crate::models::phase::{Phase, RejectReason};

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 请求格式错误，在任何资源分配之前拒绝
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 乱序或回退的阶段回调，不修改任何状态
    #[error("阶段冲突: 当前阶段 {current}，上报阶段 {reported} ({reason})")]
    PhaseConflict {
        current: Phase,
        reported: Phase,
        reason: RejectReason,
    },

    #[error("资源冲突: {0}")]
    Conflict(String),

    /// 云资源分配失败，transient 表示重试预算已耗尽的瞬时错误
    #[error("资源分配失败: {message}")]
    Allocation { transient: bool, message: String },

    #[error("资源清理失败: {0}")]
    Cleanup(String),

    #[error("启动配置生成失败: {0}")]
    BootConfig(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 错误码，用于 API 响应
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::PhaseConflict { .. } => "PHASE_CONFLICT",
            Error::Conflict(_) => "CONFLICT",
            Error::Allocation { .. } => "ALLOCATION_ERROR",
            Error::Cleanup(_) => "CLEANUP_ERROR",
            Error::BootConfig(_) => "BOOT_CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(feature = "db")]
impl From<sea_orm::DbErr> for Error {
    fn from(err: sea_orm::DbErr) -> Self {
        Error::Database(err.to_string())
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
