/// 启动配置生成
///
/// 只依赖持久化的节点状态，相同状态生成逐字节相同的结果

pub mod ipxe;
pub mod server_config;

use common::models::{ClusterOperation, NodeRole};
use common::{Error, Result};

use crate::config::BootSettings;
use crate::db::models::node::Node;

pub use ipxe::render_boot_script;
pub use server_config::{render_server_config, ServerConfigDocument};

/// 集群组建指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterDirective {
    /// 以本机管理 IP 创建初始集群
    Create {
        cluster_ip: String,
        redundancy_factor: i32,
        dns_servers: Vec<String>,
    },
    /// 加入目标集群
    Join { cluster_ip: String },
}

/// 渲染所需的完整节点状态，字段齐全才能构造
#[derive(Debug, Clone)]
pub struct BootContext {
    pub node_id: String,
    pub hostname: String,
    pub dns_name: String,
    pub position: i32,
    pub server_profile: String,
    pub role: NodeRole,
    pub cluster_name: String,
    pub cluster_id: Option<String>,
    pub management_ip: String,
    pub workload_ip: String,
    pub directive: ClusterDirective,
    pub base_url: String,
    pub image_base_url: String,
}

impl BootContext {
    pub fn from_node(node: &Node, settings: &BootSettings, base_url: &str) -> Result<Self> {
        let management_ip = required(&node.management_ip, "management_ip", &node.id)?;
        let workload_ip = required(&node.workload_ip, "workload_ip", &node.id)?;
        let dns_name = required(&node.dns_name, "dns_name", &node.id)?;

        let role: NodeRole = node
            .role
            .parse()
            .map_err(|_| Error::BootConfig(format!("节点 {} 的角色无效: {}", node.id, node.role)))?;
        let operation: ClusterOperation = node.cluster_operation.parse().map_err(|_| {
            Error::BootConfig(format!(
                "节点 {} 的集群操作无效: {}",
                node.id, node.cluster_operation
            ))
        })?;

        let directive = match operation {
            ClusterOperation::CreateNew => ClusterDirective::Create {
                cluster_ip: management_ip.clone(),
                redundancy_factor: node.redundancy_factor,
                dns_servers: settings.dns_servers.clone(),
            },
            ClusterOperation::JoinExisting => ClusterDirective::Join {
                cluster_ip: required(&node.cluster_target_ip, "cluster_target_ip", &node.id)?,
            },
        };

        Ok(Self {
            node_id: node.id.clone(),
            hostname: node.name.clone(),
            dns_name,
            position: node.position,
            server_profile: node.server_profile.clone(),
            role,
            cluster_name: node.cluster_name.clone(),
            cluster_id: node.cluster_id.clone(),
            management_ip,
            workload_ip,
            directive,
            base_url: base_url.trim_end_matches('/').to_string(),
            image_base_url: settings.image_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 节点拉取 JSON 配置文档的地址
    pub fn config_url(&self) -> String {
        format!("{}/boot/server/{}", self.base_url, self.management_ip)
    }

    /// 阶段回调地址
    pub fn phase_url(&self) -> String {
        format!("{}/boot/phase", self.base_url)
    }
}

fn required(value: &Option<String>, field: &str, node_id: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(Error::BootConfig(format!("节点 {} 缺少 {}", node_id, field))),
    }
}
