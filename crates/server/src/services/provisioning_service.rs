/// 节点部署编排
///
/// 受理请求 -> 节点记录（requested）-> 分配云资源 -> allocated / error。
/// 之后的阶段由启动中的节点回调推进，终态不会自动触发清理。

use chrono::Utc;
use common::models::{AllocationStatus, ClusterOperation};
use common::utils::generate_id;
use common::{Error, Phase, PhaseStatus, Result};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use validator::Validate;

use crate::app_state::AppState;
use crate::config::FailurePolicy;
use crate::db::models::network_allocation::{
    ActiveModel as AllocationActiveModel, AllocationSummary, Column as AllocationColumn,
    Entity as AllocationEntity, NetworkAllocation,
};
use crate::db::models::node::{
    ActiveModel as NodeActiveModel, Column as NodeColumn, Entity as NodeEntity, Node,
    NodeListResponse, NodeResponse, NodeStatsResponse, ProvisionNodeDto, ProvisionResponse,
};
use crate::metrics;
use crate::services::allocator::{AllocationOutcome, AllocatorService};
use crate::services::cleanup_service::{live_allocation, CleanupService};
use crate::services::phase_tracker::{append_history, current_phase, transition_internal};

/// 解析后的集群归属
struct ClusterPlacement {
    name: String,
    id: String,
    target_ip: Option<String>,
}

pub struct ProvisioningService {
    state: AppState,
}

impl ProvisioningService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 受理部署请求，创建 requested 状态的节点
    ///
    /// 只做校验和落库，云资源分配由 `allocate` 执行
    pub async fn submit(&self, dto: ProvisionNodeDto) -> Result<ProvisionResponse> {
        dto.validate()
            .map_err(|e| Error::Validation(e.to_string()))?;

        let config = self.state.config();
        if !config.hardware_profiles.iter().any(|p| p == &dto.server_profile) {
            return Err(Error::Validation(format!(
                "不支持的硬件规格: {}",
                dto.server_profile
            )));
        }

        let workload_subnet = dto
            .network
            .workload_subnet
            .clone()
            .or_else(|| config.cloud.default_workload_subnet.clone())
            .ok_or_else(|| Error::Validation("未指定业务网络子网".to_string()))?;

        let db = self.state.sea_db();
        // 集群解析、重名检查与插入在同一把集群锁内完成
        let _guard = self.state.cluster_locks().acquire(&dto.cluster_name).await;
        let placement = self.resolve_cluster(&dto).await?;

        // 同一集群内节点名唯一
        let duplicate = NodeEntity::find()
            .filter(NodeColumn::ClusterName.eq(placement.name.as_str()))
            .filter(NodeColumn::Name.eq(dto.name.as_str()))
            .filter(NodeColumn::Retired.eq(false))
            .one(&db)
            .await?;
        if duplicate.is_some() {
            return Err(Error::Conflict(format!(
                "集群 {} 中已存在节点 {}",
                placement.name, dto.name
            )));
        }

        let node_id = generate_id();
        let now = Utc::now();
        let redundancy_factor = dto
            .redundancy_factor
            .unwrap_or(i32::from(config.boot.redundancy_factor));

        let txn = db.begin().await?;
        let node = NodeActiveModel {
            id: Set(node_id.clone()),
            name: Set(dto.name.clone()),
            position: Set(dto.position),
            server_profile: Set(dto.server_profile.clone()),
            role: Set(dto.role.as_str().to_string()),
            cluster_operation: Set(dto.cluster_operation.as_str().to_string()),
            cluster_name: Set(placement.name),
            cluster_id: Set(Some(placement.id)),
            cluster_target_ip: Set(placement.target_ip),
            redundancy_factor: Set(redundancy_factor),
            management_subnet: Set(dto.network.management_subnet.clone()),
            workload_subnet: Set(workload_subnet),
            management_ip: Set(None),
            workload_ip: Set(None),
            dns_name: Set(None),
            phase: Set(Phase::Requested.to_string()),
            message: Set(Some("provisioning requested".to_string())),
            retired: Set(false),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
        .insert(&txn)
        .await?;
        append_history(
            &txn,
            &node,
            Phase::Requested,
            Phase::Requested,
            PhaseStatus::Success,
            true,
            node.message.clone(),
        )
        .await?;
        txn.commit().await?;

        metrics::record_provision_request();
        info!(
            "受理部署请求: node_id={}, name={}, cluster={}, operation={}",
            node.id, node.name, node.cluster_name, node.cluster_operation
        );

        Ok(self.accepted(&node))
    }

    /// 为 requested 状态的节点分配云资源
    pub async fn allocate(&self, node_id: &str) -> Result<NodeResponse> {
        let db = self.state.sea_db();
        let _guard = self.state.node_locks().acquire(node_id).await;

        let node = self.find_node(node_id).await?;
        if current_phase(&node)? != Phase::Requested {
            return Err(Error::Conflict(format!(
                "节点 {} 当前阶段为 {}，不能开始分配",
                node_id, node.phase
            )));
        }
        if live_allocation(&db, node_id).await?.is_some() {
            return Err(Error::Conflict(format!("节点 {} 已有未释放的网络分配", node_id)));
        }

        let txn = db.begin().await?;
        let node = transition_internal(&txn, node, Phase::Allocating, PhaseStatus::Pending, None).await?;
        txn.commit().await?;

        let allocator = AllocatorService::new(self.state.clone());
        let node = match allocator.allocate(&node).await {
            Ok(AllocationOutcome::Allocated(allocation)) => {
                match self.commit_allocation(node.clone(), &allocation).await {
                    Ok(node) => node,
                    Err(e) => {
                        // 提交失败（如管理 IP 唯一索引冲突）：回滚后按分配失败处理
                        error!("提交分配结果失败: node_id={}, error={}", node_id, e);
                        metrics::record_allocation_failure("commit");
                        let message = format!("allocation commit failed: {}", e);
                        self.fail_allocation(node, allocation, message).await?;
                        return Err(e);
                    }
                }
            }
            Ok(AllocationOutcome::Failed { allocation, step, error }) => {
                let message = format!("allocation failed at {}: {}", step, error);
                self.fail_allocation(node, allocation, message).await?
            }
            Err(e) => {
                // 数据库错误：节点置为 error，已记录的资源等待运维清理
                error!("分配过程出错: node_id={}, error={}", node_id, e);
                let txn = db.begin().await?;
                transition_internal(
                    &txn,
                    node,
                    Phase::Error,
                    PhaseStatus::Failure,
                    Some(format!("allocation aborted: {}", e)),
                )
                .await?;
                txn.commit().await?;
                return Err(e);
            }
        };

        self.node_response(node).await
    }

    /// 地址索引、分配状态与阶段在同一事务中更新
    async fn commit_allocation(&self, node: Node, allocation: &NetworkAllocation) -> Result<Node> {
        let txn = self.state.sea_db().begin().await?;

        let mut active: AllocationActiveModel = allocation.clone().into();
        active.status = Set(AllocationStatus::Allocated.as_str().to_string());
        active.updated_at = Set(Utc::now().into());
        active.update(&txn).await?;

        let mut active: NodeActiveModel = node.into();
        active.management_ip = Set(allocation.management_ip.clone());
        active.workload_ip = Set(allocation.workload_ip.clone());
        active.dns_name = Set(allocation.dns_name.clone());
        let node = active.update(&txn).await?;

        let node = transition_internal(&txn, node, Phase::Allocated, PhaseStatus::Success, None).await?;
        txn.commit().await?;
        Ok(node)
    }

    /// 节点置为 error，分配记录标记 failed，并按 failure_policy 处理残留资源
    async fn fail_allocation(
        &self,
        node: Node,
        allocation: NetworkAllocation,
        message: String,
    ) -> Result<Node> {
        let node_id = node.id.clone();
        let txn = self.state.sea_db().begin().await?;

        let allocation = if allocation.status.parse::<AllocationStatus>()? == AllocationStatus::Allocating {
            let mut active: AllocationActiveModel = allocation.into();
            active.status = Set(AllocationStatus::Failed.as_str().to_string());
            active.error_message = Set(Some(message.clone()));
            active.updated_at = Set(Utc::now().into());
            active.update(&txn).await?
        } else {
            allocation
        };

        let node = transition_internal(&txn, node, Phase::Error, PhaseStatus::Failure, Some(message)).await?;
        txn.commit().await?;

        if self.state.config().allocation.failure_policy == FailurePolicy::Cleanup
            && allocation.holds_resources()
        {
            let cleanup = CleanupService::new(self.state.clone());
            let (_, report) = cleanup.release(&node_id, allocation).await?;
            if let Some(e) = report.error() {
                error!("自动清理部分分配失败: node_id={}, error={}", node_id, e);
            } else {
                info!("已自动清理部分分配: node_id={}", node_id);
            }
        }
        Ok(node)
    }

    /// 终态节点重新部署
    pub async fn reprovision(&self, node_id: &str) -> Result<ProvisionResponse> {
        let db = self.state.sea_db();
        let _guard = self.state.node_locks().acquire(node_id).await;

        let node = self.find_node(node_id).await?;
        let phase = current_phase(&node)?;
        if !phase.is_terminal() {
            return Err(Error::Conflict(format!(
                "节点 {} 仍在部署中（{}）",
                node_id, phase
            )));
        }
        if live_allocation(&db, node_id).await?.is_some() {
            return Err(Error::Conflict(format!(
                "节点 {} 仍持有网络资源，请先清理",
                node_id
            )));
        }

        let txn = db.begin().await?;
        let message = Some(format!("reprovision requested (was {})", phase));
        let mut active: NodeActiveModel = node.into();
        active.phase = Set(Phase::Requested.to_string());
        active.message = Set(message.clone());
        active.retired = Set(false);
        active.updated_at = Set(Utc::now().into());
        let node = active.update(&txn).await?;
        append_history(
            &txn,
            &node,
            Phase::Requested,
            Phase::Requested,
            PhaseStatus::Success,
            true,
            message,
        )
        .await?;
        txn.commit().await?;

        info!("节点重新部署: node_id={}, previous_phase={}", node_id, phase);
        Ok(self.accepted(&node))
    }

    /// 节点状态与最近一次分配摘要
    pub async fn get_node(&self, node_id: &str) -> Result<NodeResponse> {
        let node = self.find_node(node_id).await?;
        self.node_response(node).await
    }

    /// 节点列表
    pub async fn list_nodes(
        &self,
        page: usize,
        page_size: usize,
        phase: Option<Phase>,
    ) -> Result<NodeListResponse> {
        let db = self.state.sea_db();
        let page = page.max(1);
        let page_size = page_size.clamp(1, 200);

        let mut query = NodeEntity::find();
        if let Some(phase) = phase {
            query = query.filter(NodeColumn::Phase.eq(phase.as_str()));
        }
        query = query
            .order_by_desc(NodeColumn::UpdatedAt)
            .order_by_asc(NodeColumn::Id);

        let total = query.clone().count(&db).await?;
        let nodes = query
            .offset(((page - 1) * page_size) as u64)
            .limit(page_size as u64)
            .all(&db)
            .await?;

        Ok(NodeListResponse {
            nodes: nodes.into_iter().map(NodeResponse::from).collect(),
            total,
            page,
            page_size,
        })
    }

    /// 按阶段汇总
    pub async fn stats(&self) -> Result<NodeStatsResponse> {
        let nodes = NodeEntity::find().all(&self.state.sea_db()).await?;

        let mut by_phase = BTreeMap::new();
        for phase in Phase::LINEAR.iter().chain(std::iter::once(&Phase::Error)) {
            by_phase.insert(phase.to_string(), 0u64);
        }
        let mut retired_nodes = 0;
        for node in &nodes {
            if node.retired {
                retired_nodes += 1;
            }
            *by_phase.entry(node.phase.clone()).or_insert(0) += 1;
        }

        Ok(NodeStatsResponse {
            total_nodes: nodes.len() as u64,
            retired_nodes,
            by_phase,
        })
    }

    /// 删除节点记录，历史保留
    pub async fn delete_node(&self, node_id: &str) -> Result<()> {
        let db = self.state.sea_db();
        {
            let _guard = self.state.node_locks().acquire(node_id).await;

            let node = self.find_node(node_id).await?;
            if live_allocation(&db, node_id).await?.is_some() {
                return Err(Error::Conflict(format!(
                    "节点 {} 仍持有网络资源，请先清理",
                    node_id
                )));
            }
            if !node.retired && !current_phase(&node)?.is_terminal() {
                return Err(Error::Conflict(format!(
                    "节点 {} 仍在部署中（{}）",
                    node_id, node.phase
                )));
            }

            let txn = db.begin().await?;
            AllocationEntity::delete_many()
                .filter(AllocationColumn::NodeId.eq(node_id))
                .exec(&txn)
                .await?;
            NodeEntity::delete_by_id(node_id.to_string()).exec(&txn).await?;
            txn.commit().await?;
        }

        self.state.node_locks().forget(node_id).await;
        warn!("节点记录已删除: node_id={}", node_id);
        Ok(())
    }

    /// 解析集群归属
    ///
    /// create_new 生成新的集群 ID；join_existing 通过已注册的管理 IP 或集群名找到目标
    async fn resolve_cluster(&self, dto: &ProvisionNodeDto) -> Result<ClusterPlacement> {
        let db = self.state.sea_db();

        match dto.cluster_operation {
            ClusterOperation::CreateNew => {
                if dto.network.existing_cluster_ip.is_some() {
                    return Err(Error::Validation(
                        "create_new 不能指定 existing_cluster_ip".to_string(),
                    ));
                }
                let existing = NodeEntity::find()
                    .filter(NodeColumn::ClusterName.eq(dto.cluster_name.as_str()))
                    .filter(NodeColumn::ClusterOperation.eq(ClusterOperation::CreateNew.as_str()))
                    .filter(NodeColumn::Retired.eq(false))
                    .one(&db)
                    .await?;
                if existing.is_some() {
                    return Err(Error::Conflict(format!(
                        "集群 {} 已存在，请使用 join_existing",
                        dto.cluster_name
                    )));
                }
                Ok(ClusterPlacement {
                    name: dto.cluster_name.clone(),
                    id: generate_id(),
                    target_ip: None,
                })
            }
            ClusterOperation::JoinExisting => {
                let target = match &dto.network.existing_cluster_ip {
                    Some(ip) => NodeEntity::find()
                        .filter(NodeColumn::ManagementIp.eq(ip.as_str()))
                        .filter(NodeColumn::Retired.eq(false))
                        .one(&db)
                        .await?
                        .ok_or_else(|| {
                            Error::Validation(format!("existing_cluster_ip {} 未关联任何已注册节点", ip))
                        })?,
                    None => NodeEntity::find()
                        .filter(NodeColumn::ClusterName.eq(dto.cluster_name.as_str()))
                        .filter(NodeColumn::ClusterOperation.eq(ClusterOperation::CreateNew.as_str()))
                        .filter(NodeColumn::Retired.eq(false))
                        .filter(NodeColumn::ManagementIp.is_not_null())
                        .order_by_asc(NodeColumn::CreatedAt)
                        .one(&db)
                        .await?
                        .ok_or_else(|| {
                            Error::Validation(format!("找不到可加入的集群 {}", dto.cluster_name))
                        })?,
                };

                if target.cluster_name != dto.cluster_name {
                    return Err(Error::Validation(format!(
                        "目标节点 {} 属于集群 {}，与请求的集群 {} 不一致",
                        target.id, target.cluster_name, dto.cluster_name
                    )));
                }

                let target_ip = target.management_ip.clone().ok_or_else(|| {
                    Error::Validation(format!("目标节点 {} 尚未分配管理 IP", target.id))
                })?;
                let cluster_id = target.cluster_id.clone().ok_or_else(|| {
                    Error::Validation(format!("目标节点 {} 没有集群 ID", target.id))
                })?;

                Ok(ClusterPlacement {
                    name: target.cluster_name,
                    id: cluster_id,
                    target_ip: Some(target_ip),
                })
            }
        }
    }

    async fn find_node(&self, node_id: &str) -> Result<Node> {
        NodeEntity::find_by_id(node_id.to_string())
            .one(&self.state.sea_db())
            .await?
            .ok_or_else(|| Error::NotFound(format!("节点 {} 不存在", node_id)))
    }

    async fn node_response(&self, node: Node) -> Result<NodeResponse> {
        let allocation = AllocationEntity::find()
            .filter(AllocationColumn::NodeId.eq(node.id.as_str()))
            .order_by_desc(AllocationColumn::CreatedAt)
            .one(&self.state.sea_db())
            .await?;

        let mut response = NodeResponse::from(node);
        response.allocation = allocation.map(AllocationSummary::from);
        Ok(response)
    }

    fn accepted(&self, node: &Node) -> ProvisionResponse {
        ProvisionResponse {
            node_id: node.id.clone(),
            phase: node.phase.clone(),
            status_url: format!("/api/nodes/{}", node.id),
            history_url: format!("/api/nodes/{}/history", node.id),
        }
    }
}
