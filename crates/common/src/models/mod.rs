/// 共享数据模型
///
/// 定义节点角色、集群操作、分配状态等领域类型

pub mod phase;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// 节点在集群中的角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Compute,
    Storage,
    ComputeStorage,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Compute => "compute",
            NodeRole::Storage => "storage",
            NodeRole::ComputeStorage => "compute-storage",
        }
    }
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compute" => Ok(NodeRole::Compute),
            "storage" => Ok(NodeRole::Storage),
            "compute-storage" => Ok(NodeRole::ComputeStorage),
            other => Err(Error::Validation(format!("未知的节点角色: {}", other))),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 集群操作：新建集群或加入已有集群
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterOperation {
    CreateNew,
    JoinExisting,
}

impl ClusterOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterOperation::CreateNew => "create_new",
            ClusterOperation::JoinExisting => "join_existing",
        }
    }
}

impl FromStr for ClusterOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_new" => Ok(ClusterOperation::CreateNew),
            "join_existing" => Ok(ClusterOperation::JoinExisting),
            other => Err(Error::Validation(format!("未知的集群操作: {}", other))),
        }
    }
}

impl fmt::Display for ClusterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 网络分配记录状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// 分配进行中
    Allocating,
    /// 四个步骤全部完成
    Allocated,
    /// 分配失败，可能残留部分资源
    Failed,
    /// 所有资源已释放
    Released,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Allocating => "allocating",
            AllocationStatus::Allocated => "allocated",
            AllocationStatus::Failed => "failed",
            AllocationStatus::Released => "released",
        }
    }

    /// 仍持有云资源（或可能持有）的分配
    pub fn is_live(&self) -> bool {
        !matches!(self, AllocationStatus::Released)
    }
}

impl FromStr for AllocationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocating" => Ok(AllocationStatus::Allocating),
            "allocated" => Ok(AllocationStatus::Allocated),
            "failed" => Ok(AllocationStatus::Failed),
            "released" => Ok(AllocationStatus::Released),
            other => Err(Error::Internal(format!("未知的分配状态: {}", other))),
        }
    }
}

/// 常量定义
pub mod constants {
    /// 默认 Server 端口
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// 默认副本因子
    pub const DEFAULT_REDUNDANCY_FACTOR: u8 = 2;

    /// 副本因子上限
    pub const MAX_REDUNDANCY_FACTOR: u8 = 3;

    /// 节点槽位上限
    pub const MAX_NODE_POSITION: i32 = 64;

    /// 子网自动选择标记
    pub const AUTO_SUBNET: &str = "auto";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_role_round_trip_names() {
        assert_eq!("compute-storage".parse::<NodeRole>().unwrap(), NodeRole::ComputeStorage);
        assert_eq!(NodeRole::Storage.as_str(), "storage");
        assert!("gpu".parse::<NodeRole>().is_err());
    }

    #[test]
    fn test_cluster_operation_serde_names() {
        let op: ClusterOperation = serde_json::from_str("\"join_existing\"").unwrap();
        assert_eq!(op, ClusterOperation::JoinExisting);
        assert_eq!(serde_json::to_string(&ClusterOperation::CreateNew).unwrap(), "\"create_new\"");
    }

    #[test]
    fn test_allocation_status_liveness() {
        assert!(AllocationStatus::Failed.is_live());
        assert!(AllocationStatus::Allocating.is_live());
        assert!(!AllocationStatus::Released.is_live());
    }
}
