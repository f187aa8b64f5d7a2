/// 部署阶段跟踪
///
/// 节点阶段只在节点锁内修改，每次判定（无论接受与否）追加一条历史

use chrono::Utc;
use common::models::phase::evaluate_callback;
use common::{Error, Phase, PhaseDecision, PhaseStatus, RejectReason, Result};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, NotSet, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::db::models::deployment_history::{
    ActiveModel as HistoryActiveModel, Column as HistoryColumn, DeploymentHistoryEntry,
    Entity as HistoryEntity, HistoryEntryResponse, HistoryResponse,
};
use crate::db::models::node::{ActiveModel as NodeActiveModel, Column as NodeColumn, Entity as NodeEntity, Node};
use crate::metrics;

/// 回调定位节点的方式
#[derive(Debug, Clone)]
pub enum CallbackTarget {
    NodeId(String),
    /// 启动中节点的来源地址
    Address(IpAddr),
}

/// 外部阶段上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub message: Option<String>,
}

/// 回调处理结果
#[derive(Debug, Serialize, Deserialize)]
pub struct PhaseUpdateResponse {
    pub accepted: bool,
    pub node_id: String,
    pub phase: String,
    /// 同一阶段的重复投递
    pub duplicate: bool,
    pub message: Option<String>,
}

pub struct PhaseTracker {
    state: AppState,
}

impl PhaseTracker {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 处理外部阶段回调
    pub async fn apply_callback(
        &self,
        target: CallbackTarget,
        report: PhaseReport,
    ) -> Result<PhaseUpdateResponse> {
        let db = self.state.sea_db();
        let node = find_target(&db, &target).await?;

        let _guard = self.state.node_locks().acquire(&node.id).await;

        // 等锁期间节点可能已被清理或删除
        let node = NodeEntity::find_by_id(node.id.clone())
            .one(&db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("节点 {} 不存在", node.id)))?;
        if let CallbackTarget::Address(ip) = &target {
            if node.management_ip.as_deref() != Some(ip.to_string().as_str()) {
                return Err(Error::NotFound(format!("地址 {} 未关联任何节点", ip)));
            }
        }

        let current = current_phase(&node)?;
        let decision = evaluate_callback(current, report.phase, report.status);
        let node_id = node.id.clone();

        let txn = db.begin().await?;
        let response = match decision {
            PhaseDecision::Advance { from, to } => {
                let updated = set_phase(&txn, node, to, report.message.clone()).await?;
                append_history(&txn, &updated, report.phase, to, report.status, true, report.message.clone()).await?;
                info!("节点阶段推进: node_id={}, {} -> {}", node_id, from, to);
                metrics::record_phase_callback("advanced");
                PhaseUpdateResponse {
                    accepted: true,
                    node_id,
                    phase: to.to_string(),
                    duplicate: false,
                    message: report.message,
                }
            }
            PhaseDecision::Duplicate { phase } => {
                // 进度说明只更新消息，不改变阶段
                let node = match (&report.status, &report.message) {
                    (PhaseStatus::Pending, Some(message)) => {
                        set_phase(&txn, node, phase, Some(message.clone())).await?
                    }
                    _ => node,
                };
                append_history(&txn, &node, report.phase, phase, report.status, true, report.message.clone()).await?;
                info!("重复的阶段回调: node_id={}, phase={}, status={}", node_id, phase, report.status);
                metrics::record_phase_callback("duplicate");
                PhaseUpdateResponse {
                    accepted: true,
                    node_id,
                    phase: phase.to_string(),
                    duplicate: true,
                    message: report.message,
                }
            }
            PhaseDecision::Fail { from, failed_phase } => {
                let message = format!(
                    "{} 阶段失败: {}",
                    failed_phase,
                    report.message.as_deref().unwrap_or("未提供原因")
                );
                let updated = set_phase(&txn, node, Phase::Error, Some(message.clone())).await?;
                append_history(
                    &txn,
                    &updated,
                    report.phase,
                    Phase::Error,
                    PhaseStatus::Failure,
                    true,
                    Some(message.clone()),
                )
                .await?;
                warn!("节点部署失败: node_id={}, from={}, failed_phase={}", node_id, from, failed_phase);
                metrics::record_phase_callback("failed");
                PhaseUpdateResponse {
                    accepted: true,
                    node_id,
                    phase: Phase::Error.to_string(),
                    duplicate: false,
                    message: Some(message),
                }
            }
            PhaseDecision::Reject { reason } => {
                let message = rejection_message(reason, &report);
                append_history(&txn, &node, report.phase, current, PhaseStatus::Failure, false, Some(message)).await?;
                txn.commit().await?;

                warn!(
                    "拒绝阶段回调: node_id={}, current={}, reported={}, status={}, reason={}",
                    node_id, current, report.phase, report.status, reason
                );
                metrics::record_phase_callback(reason.as_str());
                return Err(Error::PhaseConflict {
                    current,
                    reported: report.phase,
                    reason,
                });
            }
        };

        txn.commit().await?;
        Ok(response)
    }

    /// 节点的完整部署历史
    pub async fn history(&self, node_id: &str) -> Result<HistoryResponse> {
        let db = self.state.sea_db();
        let node = NodeEntity::find_by_id(node_id.to_string())
            .one(&db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("节点 {} 不存在", node_id)))?;

        let entries = HistoryEntity::find()
            .filter(HistoryColumn::NodeId.eq(node_id))
            .order_by_asc(HistoryColumn::Seq)
            .all(&db)
            .await?;

        Ok(HistoryResponse {
            node_id: node.id,
            current_phase: node.phase,
            entries: entries.into_iter().map(HistoryEntryResponse::from).collect(),
        })
    }

    /// 按管理地址查询历史（包括已下线节点在该地址上留下的记录）
    pub async fn history_by_address(&self, ip: &str) -> Result<Vec<HistoryEntryResponse>> {
        let entries = HistoryEntity::find()
            .filter(HistoryColumn::ManagementIp.eq(ip))
            .order_by_asc(HistoryColumn::CreatedAt)
            .order_by_asc(HistoryColumn::Id)
            .all(&self.state.sea_db())
            .await?;
        Ok(entries.into_iter().map(HistoryEntryResponse::from).collect())
    }
}

async fn find_target<C: ConnectionTrait>(db: &C, target: &CallbackTarget) -> Result<Node> {
    match target {
        CallbackTarget::NodeId(id) => NodeEntity::find_by_id(id.clone())
            .one(db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("节点 {} 不存在", id))),
        CallbackTarget::Address(ip) => NodeEntity::find()
            .filter(NodeColumn::ManagementIp.eq(ip.to_string()))
            .filter(NodeColumn::Retired.eq(false))
            .one(db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("地址 {} 未关联任何节点", ip))),
    }
}

fn rejection_message(reason: RejectReason, report: &PhaseReport) -> String {
    let mut message = format!("rejected: {} ({} {})", reason, report.phase, report.status);
    if let Some(detail) = &report.message {
        message.push_str(": ");
        message.push_str(detail);
    }
    message
}

/// 解析节点当前阶段
pub(crate) fn current_phase(node: &Node) -> Result<Phase> {
    node.phase
        .parse()
        .map_err(|_| Error::Internal(format!("节点 {} 的阶段无法识别: {}", node.id, node.phase)))
}

/// 更新节点阶段与消息
pub(crate) async fn set_phase<C: ConnectionTrait>(
    db: &C,
    node: Node,
    phase: Phase,
    message: Option<String>,
) -> Result<Node> {
    let mut active: NodeActiveModel = node.into();
    active.phase = Set(phase.to_string());
    active.message = Set(message);
    active.updated_at = Set(Utc::now().into());
    Ok(active.update(db).await?)
}

/// 追加一条历史，序号与时间戳在节点内单调
pub(crate) async fn append_history<C: ConnectionTrait>(
    db: &C,
    node: &Node,
    reported: Phase,
    resulting: Phase,
    status: PhaseStatus,
    accepted: bool,
    message: Option<String>,
) -> Result<DeploymentHistoryEntry> {
    let last = HistoryEntity::find()
        .filter(HistoryColumn::NodeId.eq(node.id.as_str()))
        .order_by_desc(HistoryColumn::Seq)
        .one(db)
        .await?;

    let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
    let (seq, created_at) = match last {
        Some(last) => (last.seq + 1, now.max(last.created_at)),
        None => (1, now),
    };

    let entry = HistoryActiveModel {
        id: NotSet,
        node_id: Set(node.id.clone()),
        management_ip: Set(node.management_ip.clone()),
        seq: Set(seq),
        phase: Set(resulting.to_string()),
        reported_phase: Set(reported.to_string()),
        status: Set(status.to_string()),
        accepted: Set(accepted),
        message: Set(message),
        created_at: Set(created_at),
    };
    Ok(entry.insert(db).await?)
}

/// 内部阶段迁移（请求受理、分配开始、分配完成、分配失败），调用方持有节点锁
pub(crate) async fn transition_internal<C: ConnectionTrait>(
    db: &C,
    node: Node,
    to: Phase,
    status: PhaseStatus,
    message: Option<String>,
) -> Result<Node> {
    let from = current_phase(&node)?;
    if !from.can_transition_to(to) {
        return Err(Error::Conflict(format!(
            "节点 {} 不能从 {} 进入 {}",
            node.id, from, to
        )));
    }

    let updated = set_phase(db, node, to, message.clone()).await?;
    append_history(db, &updated, to, to, status, true, message).await?;
    info!("节点阶段变更: node_id={}, {} -> {}", updated.id, from, to);
    Ok(updated)
}
