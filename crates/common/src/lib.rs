/// HCI Provisioner - 公共库
///
/// 提供部署阶段状态机、领域类型、统一错误和工具函数

pub mod errors;
pub mod models;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use models::phase::{Phase, PhaseDecision, PhaseStatus, RejectReason};
