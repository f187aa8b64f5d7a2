/// 资源清理
///
/// 按创建的逆序释放：裸金属服务器 -> DNS 记录 -> 业务 IP -> 管理 IP。
/// 资源已不存在视为成功；任何一步硬失败都保留分配记录，之后的步骤跳过，等待重试。

use chrono::Utc;
use common::models::AllocationStatus;
use common::{Error, Phase, PhaseStatus, Result};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::cloud::{CloudError, RetryPolicy};
use crate::db::models::network_allocation::{
    ActiveModel as AllocationActiveModel, Column as AllocationColumn, Entity as AllocationEntity,
    NetworkAllocation,
};
use crate::db::models::node::{ActiveModel as NodeActiveModel, Entity as NodeEntity, Node};
use crate::metrics;
use crate::services::phase_tracker::{current_phase, transition_internal};

/// 清理步骤，按执行顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    BareMetalServer,
    DnsRecord,
    WorkloadIp,
    ManagementIp,
}

impl CleanupStep {
    pub const ORDER: [CleanupStep; 4] = [
        CleanupStep::BareMetalServer,
        CleanupStep::DnsRecord,
        CleanupStep::WorkloadIp,
        CleanupStep::ManagementIp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStep::BareMetalServer => "bare_metal_server",
            CleanupStep::DnsRecord => "dns_record",
            CleanupStep::WorkloadIp => "workload_ip",
            CleanupStep::ManagementIp => "management_ip",
        }
    }

    fn resource_id(&self, allocation: &NetworkAllocation) -> Option<String> {
        match self {
            CleanupStep::BareMetalServer => allocation.bare_metal_server_id.clone(),
            CleanupStep::DnsRecord => allocation.dns_record_id.clone(),
            CleanupStep::WorkloadIp => allocation.workload_ip_id.clone(),
            CleanupStep::ManagementIp => allocation.management_ip_id.clone(),
        }
    }

    /// 资源删除后清掉记录中的 ID
    fn clear(&self, active: &mut AllocationActiveModel) {
        match self {
            CleanupStep::BareMetalServer => active.bare_metal_server_id = Set(None),
            CleanupStep::DnsRecord => active.dns_record_id = Set(None),
            CleanupStep::WorkloadIp => active.workload_ip_id = Set(None),
            CleanupStep::ManagementIp => active.management_ip_id = Set(None),
        }
    }
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单步结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Deleted,
    /// 云端已不存在，视为成功
    AlreadyAbsent,
    /// 记录中没有该资源
    NoOp,
    Failed,
    /// 前面的步骤失败，未执行
    Skipped,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StepOutcome::Deleted | StepOutcome::AlreadyAbsent | StepOutcome::NoOp
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupStepReport {
    pub step: CleanupStep,
    pub outcome: StepOutcome,
    pub resource_id: Option<String>,
    pub message: Option<String>,
}

/// 清理报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub node_id: String,
    pub allocation_id: Option<String>,
    pub steps: Vec<CleanupStepReport>,
    /// 所有步骤成功或无需操作
    pub complete: bool,
}

impl CleanupReport {
    fn new(node_id: &str, allocation_id: Option<String>, steps: Vec<CleanupStepReport>) -> Self {
        let complete = steps.iter().all(|s| s.outcome.is_success());
        Self {
            node_id: node_id.to_string(),
            allocation_id,
            steps,
            complete,
        }
    }

    pub fn outcome(&self, step: CleanupStep) -> Option<StepOutcome> {
        self.steps.iter().find(|s| s.step == step).map(|s| s.outcome)
    }

    /// 未完成时的错误，携带失败步骤的原始信息
    pub fn error(&self) -> Option<Error> {
        if self.complete {
            return None;
        }
        let failed: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Failed)
            .map(|s| format!("{}: {}", s.step, s.message.as_deref().unwrap_or("")))
            .collect();
        Some(Error::Cleanup(failed.join("; ")))
    }
}

pub struct CleanupService {
    state: AppState,
    retry: RetryPolicy,
}

impl CleanupService {
    pub fn new(state: AppState) -> Self {
        let retry = state.retry_policy();
        Self { state, retry }
    }

    /// 运维发起的清理
    ///
    /// 未到终态的节点先置为 error；全部释放后节点下线，IP 索引随之清空
    pub async fn cleanup(&self, node_id: &str) -> Result<CleanupReport> {
        let report = {
            let _guard = self.state.node_locks().acquire(node_id).await;
            self.cleanup_locked(node_id).await?
        };

        if report.complete {
            // 节点已下线，回收锁；重新部署时会再创建
            self.state.node_locks().forget(node_id).await;
            info!("节点清理完成: node_id={}", node_id);
            metrics::record_cleanup("complete");
        } else {
            error!("节点清理未完成: node_id={}, steps={:?}", node_id, report.steps);
            metrics::record_cleanup("incomplete");
        }
        Ok(report)
    }

    async fn cleanup_locked(&self, node_id: &str) -> Result<CleanupReport> {
        let db = self.state.sea_db();

        let mut node = NodeEntity::find_by_id(node_id.to_string())
            .one(&db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("节点 {} 不存在", node_id)))?;

        if !current_phase(&node)?.is_terminal() {
            let txn = db.begin().await?;
            node = transition_internal(
                &txn,
                node,
                Phase::Error,
                PhaseStatus::Failure,
                Some("operator cleanup".to_string()),
            )
            .await?;
            txn.commit().await?;
        }

        let allocation = live_allocation(&db, node_id).await?;
        let report = match allocation {
            Some(allocation) => {
                let (allocation, report) = self.release(node_id, allocation).await?;
                if report.complete {
                    self.finish(node, Some(allocation)).await?;
                }
                report
            }
            None => {
                let steps = CleanupStep::ORDER
                    .iter()
                    .map(|step| CleanupStepReport {
                        step: *step,
                        outcome: StepOutcome::NoOp,
                        resource_id: None,
                        message: None,
                    })
                    .collect();
                self.finish(node, None).await?;
                CleanupReport::new(node_id, None, steps)
            }
        };
        Ok(report)
    }

    /// 释放一条分配记录中的全部资源，调用方持有节点锁
    ///
    /// 全部成功时记录标记为 released
    pub async fn release(
        &self,
        node_id: &str,
        allocation: NetworkAllocation,
    ) -> Result<(NetworkAllocation, CleanupReport)> {
        let db = self.state.sea_db();
        let cloud = self.state.cloud();
        let mut allocation = allocation;
        let mut steps = Vec::with_capacity(CleanupStep::ORDER.len());
        let mut failed = false;

        for step in CleanupStep::ORDER {
            let resource_id = step.resource_id(&allocation);
            let Some(id) = resource_id.clone() else {
                steps.push(CleanupStepReport {
                    step,
                    outcome: StepOutcome::NoOp,
                    resource_id: None,
                    message: None,
                });
                continue;
            };

            if failed {
                steps.push(CleanupStepReport {
                    step,
                    outcome: StepOutcome::Skipped,
                    resource_id,
                    message: None,
                });
                continue;
            }

            let result = match step {
                CleanupStep::BareMetalServer => {
                    self.retry
                        .run("delete_bare_metal_server", || cloud.delete_bare_metal_server(&id))
                        .await
                }
                CleanupStep::DnsRecord => {
                    self.retry
                        .run("delete_dns_record", || cloud.delete_dns_record(&id))
                        .await
                }
                CleanupStep::WorkloadIp => {
                    let subnet = allocation.workload_subnet_id.clone().unwrap_or_default();
                    self.retry
                        .run("release_ip", || cloud.release_ip(&subnet, &id))
                        .await
                }
                CleanupStep::ManagementIp => {
                    let subnet = allocation.management_subnet_id.clone().unwrap_or_default();
                    self.retry
                        .run("release_ip", || cloud.release_ip(&subnet, &id))
                        .await
                }
            };

            let outcome = match result {
                Ok(()) => StepOutcome::Deleted,
                Err(CloudError::NotFound(_)) => StepOutcome::AlreadyAbsent,
                Err(e) => {
                    warn!("清理步骤失败: node_id={}, step={}, resource_id={}, error={}", node_id, step, id, e);
                    failed = true;
                    steps.push(CleanupStepReport {
                        step,
                        outcome: StepOutcome::Failed,
                        resource_id,
                        message: Some(e.to_string()),
                    });
                    continue;
                }
            };

            // 每删除一个资源立即落库，重试时不会重复删除
            let mut active: AllocationActiveModel = allocation.into();
            step.clear(&mut active);
            active.updated_at = Set(Utc::now().into());
            allocation = active.update(&db).await?;

            info!("清理步骤完成: node_id={}, step={}, resource_id={}, outcome={:?}", node_id, step, id, outcome);
            steps.push(CleanupStepReport {
                step,
                outcome,
                resource_id,
                message: None,
            });
        }

        let report = CleanupReport::new(node_id, Some(allocation.id.clone()), steps);
        if report.complete {
            let now = Utc::now();
            let mut active: AllocationActiveModel = allocation.into();
            active.status = Set(AllocationStatus::Released.as_str().to_string());
            active.released_at = Set(Some(now.into()));
            active.updated_at = Set(now.into());
            allocation = active.update(&db).await?;
        }

        Ok((allocation, report))
    }

    /// 节点下线：清空地址索引并标记 retired
    async fn finish(&self, node: Node, allocation: Option<NetworkAllocation>) -> Result<Node> {
        let db = self.state.sea_db();
        let txn = db.begin().await?;

        if let Some(allocation) = allocation {
            if allocation.status.parse::<AllocationStatus>()?.is_live() {
                let mut active: AllocationActiveModel = allocation.into();
                active.status = Set(AllocationStatus::Released.as_str().to_string());
                active.released_at = Set(Some(Utc::now().into()));
                active.update(&txn).await?;
            }
        }

        let mut active: NodeActiveModel = node.into();
        active.management_ip = Set(None);
        active.workload_ip = Set(None);
        active.dns_name = Set(None);
        active.retired = Set(true);
        active.updated_at = Set(Utc::now().into());
        let node = active.update(&txn).await?;

        txn.commit().await?;
        Ok(node)
    }
}

/// 节点当前仍持有资源的分配记录（最近一次）
pub(crate) async fn live_allocation<C: sea_orm::ConnectionTrait>(
    db: &C,
    node_id: &str,
) -> Result<Option<NetworkAllocation>> {
    Ok(AllocationEntity::find()
        .filter(AllocationColumn::NodeId.eq(node_id))
        .filter(AllocationColumn::Status.ne(AllocationStatus::Released.as_str()))
        .order_by_desc(AllocationColumn::CreatedAt)
        .one(db)
        .await?)
}
