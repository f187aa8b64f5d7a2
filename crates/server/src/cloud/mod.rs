/// 云资源能力抽象
///
/// 编排逻辑只依赖 `CloudProvider`，具体厂商实现可替换

pub mod memory;
pub mod retry;
pub mod vpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;

pub use memory::InMemoryCloudProvider;
pub use retry::RetryPolicy;
pub use vpc::VpcCloudProvider;

/// 云 API 错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("请求被限流: {0}")]
    Throttled(String),

    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("服务暂不可用: {0}")]
    Unavailable(String),

    #[error("配额不足: {0}")]
    Quota(String),

    #[error("请求参数无效: {0}")]
    Validation(String),

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("响应无法解析: {0}")]
    Protocol(String),
}

impl CloudError {
    /// 瞬时错误可以重试，配额与参数错误立即失败
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::Throttled(_) | CloudError::Timeout(_) | CloudError::Unavailable(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CloudError::Throttled(_) => "throttled",
            CloudError::Timeout(_) => "timeout",
            CloudError::Unavailable(_) => "unavailable",
            CloudError::Quota(_) => "quota",
            CloudError::Validation(_) => "validation",
            CloudError::NotFound(_) => "not_found",
            CloudError::Protocol(_) => "protocol",
        }
    }
}

impl From<CloudError> for common::Error {
    fn from(err: CloudError) -> Self {
        common::Error::Allocation {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// 子网信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubnetInfo {
    pub id: String,
    pub name: String,
    pub cidr: String,
    pub available_ips: u32,
}

/// 预留 IP
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReservedIp {
    pub id: String,
    pub subnet_id: String,
    pub address: String,
}

/// 裸金属服务器网卡
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub subnet_id: String,
    pub reserved_ip_id: String,
}

/// 裸金属服务器创建参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BareMetalServerSpec {
    pub name: String,
    pub profile: String,
    pub management: InterfaceSpec,
    pub workload: InterfaceSpec,
    /// 链式加载本服务 iPXE 脚本的引导数据
    pub user_data: String,
}

/// 云资源能力接口
///
/// 创建类操作带幂等键：同一个键重复调用返回第一次创建的资源，
/// 超时后重试不会在云端留下未记录的资源
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// 列出可用子网
    async fn list_subnets(&self) -> CloudResult<Vec<SubnetInfo>>;

    /// 在子网中预留一个 IP
    async fn reserve_ip(
        &self,
        subnet_id: &str,
        name: &str,
        idempotency_key: &str,
    ) -> CloudResult<ReservedIp>;

    /// 释放预留 IP
    async fn release_ip(&self, subnet_id: &str, reserved_ip_id: &str) -> CloudResult<()>;

    /// 创建 A 记录，返回记录 ID
    async fn create_dns_record(
        &self,
        host_name: &str,
        address: &str,
        idempotency_key: &str,
    ) -> CloudResult<String>;

    /// 删除 DNS 记录
    async fn delete_dns_record(&self, record_id: &str) -> CloudResult<()>;

    /// 创建裸金属服务器，返回服务器 ID
    async fn create_bare_metal_server(
        &self,
        spec: &BareMetalServerSpec,
        idempotency_key: &str,
    ) -> CloudResult<String>;

    /// 删除裸金属服务器
    async fn delete_bare_metal_server(&self, server_id: &str) -> CloudResult<()>;

    /// 实现类型
    fn provider_type(&self) -> &str;
}

/// 按配置构造云 provider
pub fn build_provider(cfg: &Config) -> common::Result<Arc<dyn CloudProvider>> {
    match cfg.cloud.provider.as_str() {
        "memory" => {
            let provider = InMemoryCloudProvider::new();
            for subnet in &cfg.cloud.subnets {
                let cidr = subnet.cidr.as_deref().unwrap_or("10.0.0.0/24");
                provider.add_subnet(&subnet.id, cidr)?;
            }
            Ok(Arc::new(provider))
        }
        "vpc" => Ok(Arc::new(VpcCloudProvider::new(&cfg.cloud)?)),
        other => Err(common::Error::Config(format!("不支持的云 provider: {}", other))),
    }
}
