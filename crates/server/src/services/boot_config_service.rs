/// 启动配置服务
///
/// 只读查询：按管理地址找到节点后交给纯函数渲染

use common::{Error, Result};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::net::IpAddr;
use tracing::{debug, error};

use crate::app_state::AppState;
use crate::boot::{render_boot_script, render_server_config, BootContext};
use crate::db::models::node::{Column as NodeColumn, Entity as NodeEntity, Node};

pub struct BootConfigService {
    state: AppState,
}

impl BootConfigService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 按来源地址查找节点，未关联的地址返回 NotFound
    pub async fn resolve_by_address(&self, ip: IpAddr) -> Result<Node> {
        NodeEntity::find()
            .filter(NodeColumn::ManagementIp.eq(ip.to_string()))
            .filter(NodeColumn::Retired.eq(false))
            .one(&self.state.sea_db())
            .await?
            .ok_or_else(|| Error::NotFound(format!("地址 {} 未关联任何节点", ip)))
    }

    fn context(&self, node: &Node) -> Result<BootContext> {
        let config = self.state.config();
        BootContext::from_node(node, &config.boot, config.base_url()).map_err(|e| {
            error!("生成启动配置失败: node_id={}, error={}", node.id, e);
            e
        })
    }

    /// iPXE 启动脚本
    pub async fn boot_script(&self, ip: IpAddr) -> Result<String> {
        let node = self.resolve_by_address(ip).await?;
        debug!("下发启动脚本: node_id={}, ip={}", node.id, ip);
        Ok(render_boot_script(&self.context(&node)?))
    }

    /// JSON 配置文档
    pub async fn server_config(&self, ip: IpAddr) -> Result<String> {
        let node = self.resolve_by_address(ip).await?;
        debug!("下发节点配置: node_id={}, ip={}", node.id, ip);
        render_server_config(&self.context(&node)?)
    }
}
