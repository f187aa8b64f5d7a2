use common::models::{ClusterOperation, NodeRole};
use common::utils::{validate_host_label, validate_ip_address};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::{Validate, ValidationError};

use super::network_allocation::AllocationSummary;

/// 节点模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub position: i32,
    pub server_profile: String,
    pub role: String,

    // 集群信息
    pub cluster_operation: String,
    pub cluster_name: String,
    pub cluster_id: Option<String>,
    /// join_existing 时目标集群的管理 IP
    pub cluster_target_ip: Option<String>,
    pub redundancy_factor: i32,

    // 请求的网络配置
    pub management_subnet: String,
    pub workload_subnet: String,

    // 分配结果，管理 IP 唯一，作为来源地址到节点的索引
    #[sea_orm(unique)]
    pub management_ip: Option<String>,
    pub workload_ip: Option<String>,
    pub dns_name: Option<String>,

    // 部署状态
    pub phase: String,
    pub message: Option<String>,
    /// 清理完成后逻辑下线
    pub retired: bool,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::network_allocation::Entity")]
    NetworkAllocation,
}

impl Related<super::network_allocation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NetworkAllocation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub type Node = Model;

fn validate_node_name(name: &str) -> Result<(), ValidationError> {
    if validate_host_label(name) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_node_name"))
    }
}

fn validate_ipv4(ip: &str) -> Result<(), ValidationError> {
    if validate_ip_address(ip) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_ipv4"))
    }
}

/// 部署节点请求 DTO
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProvisionNodeDto {
    #[validate(custom = "validate_node_name")]
    pub name: String,

    #[validate(range(min = 1, max = 64))]
    pub position: i32,

    #[validate(length(min = 1, max = 64))]
    pub server_profile: String,

    pub role: NodeRole,

    pub cluster_operation: ClusterOperation,

    #[validate(custom = "validate_node_name")]
    pub cluster_name: String,

    #[validate(range(min = 1, max = 3))]
    pub redundancy_factor: Option<i32>,

    #[validate]
    pub network: NetworkConfigDto,
}

/// 网络配置 DTO
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NetworkConfigDto {
    /// 子网 ID，或 "auto" 自动选择有容量的子网
    #[validate(length(min = 1, max = 128))]
    pub management_subnet: String,

    #[validate(length(min = 1, max = 128))]
    pub workload_subnet: Option<String>,

    /// join_existing 时目标集群已注册的管理 IP
    #[validate(custom = "validate_ipv4")]
    pub existing_cluster_ip: Option<String>,
}

/// 部署受理响应
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub node_id: String,
    pub phase: String,
    pub status_url: String,
    pub history_url: String,
}

/// 节点状态响应 DTO
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeResponse {
    pub id: String,
    pub name: String,
    pub position: i32,
    pub server_profile: String,
    pub role: String,
    pub cluster_operation: String,
    pub cluster_name: String,
    pub cluster_id: Option<String>,
    pub cluster_target_ip: Option<String>,
    pub management_ip: Option<String>,
    pub workload_ip: Option<String>,
    pub dns_name: Option<String>,
    pub phase: String,
    pub message: Option<String>,
    pub retired: bool,
    pub allocation: Option<AllocationSummary>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            name: node.name,
            position: node.position,
            server_profile: node.server_profile,
            role: node.role,
            cluster_operation: node.cluster_operation,
            cluster_name: node.cluster_name,
            cluster_id: node.cluster_id,
            cluster_target_ip: node.cluster_target_ip,
            management_ip: node.management_ip,
            workload_ip: node.workload_ip,
            dns_name: node.dns_name,
            phase: node.phase,
            message: node.message,
            retired: node.retired,
            allocation: None,
            created_at: node.created_at.to_rfc3339(),
            updated_at: node.updated_at.to_rfc3339(),
        }
    }
}

/// 节点列表响应 DTO
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeListResponse {
    pub nodes: Vec<NodeResponse>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
}

/// 按阶段汇总的节点统计
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeStatsResponse {
    pub total_nodes: u64,
    pub retired_nodes: u64,
    pub by_phase: BTreeMap<String, u64>,
}
