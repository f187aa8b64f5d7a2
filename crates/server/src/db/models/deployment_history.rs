/// 部署历史数据模型
///
/// 只追加，不修改也不重排。`phase` 是该事件之后节点所处的阶段，
/// 因此按时间取最后一条即可得到当前阶段；`reported_phase` 保留回调原始上报值。

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "deployment_history")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(indexed)]
    pub node_id: String,
    /// 启动中的节点以来源地址识别自己
    #[sea_orm(indexed)]
    pub management_ip: Option<String>,
    /// 节点内单调递增的序号
    pub seq: i32,
    pub phase: String,
    pub reported_phase: String,
    pub status: String, // pending, success, failure
    pub accepted: bool,
    pub message: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub type DeploymentHistoryEntry = Model;

/// 历史事件响应 DTO
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryEntryResponse {
    pub seq: i32,
    pub phase: String,
    pub reported_phase: String,
    pub status: String,
    pub accepted: bool,
    pub message: Option<String>,
    pub management_ip: Option<String>,
    pub timestamp: String,
}

impl From<DeploymentHistoryEntry> for HistoryEntryResponse {
    fn from(entry: DeploymentHistoryEntry) -> Self {
        Self {
            seq: entry.seq,
            phase: entry.phase,
            reported_phase: entry.reported_phase,
            status: entry.status,
            accepted: entry.accepted,
            message: entry.message,
            management_ip: entry.management_ip,
            timestamp: entry.created_at.to_rfc3339(),
        }
    }
}

/// 部署历史响应
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub node_id: String,
    pub current_phase: String,
    pub entries: Vec<HistoryEntryResponse>,
}
