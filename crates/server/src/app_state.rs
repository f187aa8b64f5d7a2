/// 应用全局状态

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::cloud::{CloudProvider, RetryPolicy};
use crate::config::Config;
use crate::locks::KeyedLocks;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// SeaORM 数据库连接
    pub sea_db: DatabaseConnection,
    /// 云资源 provider
    pub cloud: Arc<dyn CloudProvider>,
    pub config: Arc<Config>,
    /// 节点级互斥锁
    pub node_locks: KeyedLocks,
    /// 集群名级互斥锁，串行化同一集群的受理
    pub cluster_locks: KeyedLocks,
}

impl AppState {
    pub fn new(sea_db: DatabaseConnection, cloud: Arc<dyn CloudProvider>, config: Config) -> Self {
        Self {
            sea_db,
            cloud,
            config: Arc::new(config),
            node_locks: KeyedLocks::new(),
            cluster_locks: KeyedLocks::new(),
        }
    }

    /// 获取 SeaORM 数据库连接（克隆）
    pub fn sea_db(&self) -> DatabaseConnection {
        self.sea_db.clone()
    }

    /// 获取云 provider
    pub fn cloud(&self) -> Arc<dyn CloudProvider> {
        self.cloud.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    pub fn node_locks(&self) -> KeyedLocks {
        self.node_locks.clone()
    }

    pub fn cluster_locks(&self) -> KeyedLocks {
        self.cluster_locks.clone()
    }

    /// 按配置构造的云调用重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.config.retry)
    }
}
