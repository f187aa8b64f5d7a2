use common::Result;
use serde::{Deserialize, Serialize};

use super::{BootContext, ClusterDirective};

/// 单节点 JSON 配置文档，由安装代理在启动后拉取
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfigDocument {
    pub node_id: String,
    pub hostname: String,
    pub dns_name: String,
    pub position: i32,
    pub server_profile: String,
    pub role: String,
    pub network: NetworkSection,
    pub cluster: ClusterSection,
    pub phase_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    pub management_ip: String,
    pub workload_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSection {
    /// create_new 或 join_existing
    pub operation: String,
    pub name: String,
    pub id: Option<String>,
    /// 创建时为本机管理 IP，加入时为目标集群管理 IP
    pub cluster_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redundancy_factor: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dns_servers: Vec<String>,
}

impl From<&BootContext> for ServerConfigDocument {
    fn from(ctx: &BootContext) -> Self {
        let cluster = match &ctx.directive {
            ClusterDirective::Create {
                cluster_ip,
                redundancy_factor,
                dns_servers,
            } => ClusterSection {
                operation: "create_new".to_string(),
                name: ctx.cluster_name.clone(),
                id: ctx.cluster_id.clone(),
                cluster_ip: cluster_ip.clone(),
                redundancy_factor: Some(*redundancy_factor),
                dns_servers: dns_servers.clone(),
            },
            ClusterDirective::Join { cluster_ip } => ClusterSection {
                operation: "join_existing".to_string(),
                name: ctx.cluster_name.clone(),
                id: ctx.cluster_id.clone(),
                cluster_ip: cluster_ip.clone(),
                redundancy_factor: None,
                dns_servers: Vec::new(),
            },
        };

        Self {
            node_id: ctx.node_id.clone(),
            hostname: ctx.hostname.clone(),
            dns_name: ctx.dns_name.clone(),
            position: ctx.position,
            server_profile: ctx.server_profile.clone(),
            role: ctx.role.as_str().to_string(),
            network: NetworkSection {
                management_ip: ctx.management_ip.clone(),
                workload_ip: ctx.workload_ip.clone(),
            },
            cluster,
            phase_url: ctx.phase_url(),
        }
    }
}

/// 渲染 JSON 配置文档
pub fn render_server_config(ctx: &BootContext) -> Result<String> {
    Ok(serde_json::to_string_pretty(&ServerConfigDocument::from(ctx))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::test_support::allocated_node;
    use crate::config::BootSettings;

    #[test]
    fn test_document_for_join_carries_target() {
        let mut node = allocated_node();
        node.cluster_operation = "join_existing".to_string();
        node.cluster_target_ip = Some("10.0.0.7".to_string());
        let ctx = BootContext::from_node(&node, &BootSettings::default(), "http://pxe").unwrap();

        let doc = ServerConfigDocument::from(&ctx);
        assert_eq!(doc.cluster.operation, "join_existing");
        assert_eq!(doc.cluster.cluster_ip, "10.0.0.7");
        assert_eq!(doc.network.management_ip, "10.0.0.2");
        assert!(doc.cluster.redundancy_factor.is_none());
    }

    #[test]
    fn test_rendered_json_is_stable() {
        let ctx = BootContext::from_node(&allocated_node(), &BootSettings::default(), "http://pxe").unwrap();
        let first = render_server_config(&ctx).unwrap();
        assert_eq!(first, render_server_config(&ctx).unwrap());

        let parsed: ServerConfigDocument = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed.cluster.redundancy_factor, Some(2));
        assert_eq!(parsed.phase_url, "http://pxe/boot/phase");
    }
}
