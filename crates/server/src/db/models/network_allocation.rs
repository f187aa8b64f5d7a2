/// 网络分配数据模型
///
/// 一次分配尝试对应一行，每个步骤创建的云资源 ID 立即落库，
/// 清理时按记录逆序释放

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "network_allocations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(indexed)]
    pub node_id: String,
    pub status: String, // allocating, allocated, failed, released

    // 管理网络
    pub management_subnet_id: Option<String>,
    pub management_ip_id: Option<String>,
    pub management_ip: Option<String>,

    // 业务网络
    pub workload_subnet_id: Option<String>,
    pub workload_ip_id: Option<String>,
    pub workload_ip: Option<String>,

    // DNS 与裸金属服务器
    pub dns_record_id: Option<String>,
    pub dns_name: Option<String>,
    pub bare_metal_server_id: Option<String>,

    pub error_message: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub released_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::node::Entity",
        from = "Column::NodeId",
        to = "super::node::Column::Id"
    )]
    Node,
}

impl Related<super::node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Node.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub type NetworkAllocation = Model;

impl Model {
    /// 是否仍记录着任何云资源
    pub fn holds_resources(&self) -> bool {
        self.management_ip_id.is_some()
            || self.workload_ip_id.is_some()
            || self.dns_record_id.is_some()
            || self.bare_metal_server_id.is_some()
    }
}

/// 分配摘要，随节点状态返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub id: String,
    pub status: String,
    pub management_subnet_id: Option<String>,
    pub management_ip_id: Option<String>,
    pub workload_subnet_id: Option<String>,
    pub workload_ip_id: Option<String>,
    pub dns_record_id: Option<String>,
    pub bare_metal_server_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub released_at: Option<String>,
}

impl From<NetworkAllocation> for AllocationSummary {
    fn from(allocation: NetworkAllocation) -> Self {
        Self {
            id: allocation.id,
            status: allocation.status,
            management_subnet_id: allocation.management_subnet_id,
            management_ip_id: allocation.management_ip_id,
            workload_subnet_id: allocation.workload_subnet_id,
            workload_ip_id: allocation.workload_ip_id,
            dns_record_id: allocation.dns_record_id,
            bare_metal_server_id: allocation.bare_metal_server_id,
            error_message: allocation.error_message,
            created_at: allocation.created_at.to_rfc3339(),
            released_at: allocation.released_at.map(|dt| dt.to_rfc3339()),
        }
    }
}
