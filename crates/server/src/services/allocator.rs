/// 云资源分配
///
/// 固定顺序：管理 IP -> 业务 IP -> DNS 记录 -> 裸金属服务器。
/// 每个资源创建成功后立即把 ID 写入分配记录，失败时已记录的 ID 就是需要清理的范围。

use chrono::Utc;
use common::models::constants::AUTO_SUBNET;
use common::models::AllocationStatus;
use common::utils::{fqdn, generate_id};
use common::{Error, Result};
use sea_orm::{ActiveModelTrait, Set};
use serde::Serialize;
use std::fmt;
use tracing::{error, info};

use crate::app_state::AppState;
use crate::cloud::{BareMetalServerSpec, CloudError, InterfaceSpec, RetryPolicy};
use crate::db::models::network_allocation::{ActiveModel as AllocationActiveModel, NetworkAllocation};
use crate::db::models::node::Node;
use crate::metrics;

/// 分配步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStep {
    SubnetSelection,
    ManagementIp,
    WorkloadIp,
    DnsRecord,
    BareMetalServer,
}

impl AllocationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStep::SubnetSelection => "subnet_selection",
            AllocationStep::ManagementIp => "management_ip",
            AllocationStep::WorkloadIp => "workload_ip",
            AllocationStep::DnsRecord => "dns_record",
            AllocationStep::BareMetalServer => "bare_metal_server",
        }
    }
}

impl fmt::Display for AllocationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分配结果
#[derive(Debug)]
pub enum AllocationOutcome {
    /// 四个资源全部创建，记录仍处于 allocating，由调用方在事务中确认
    Allocated(NetworkAllocation),
    /// 某一步失败，allocation 中保留已创建资源的 ID
    Failed {
        allocation: NetworkAllocation,
        step: AllocationStep,
        error: CloudError,
    },
}

struct StepFailure {
    step: AllocationStep,
    error: CloudError,
}

pub struct AllocatorService {
    state: AppState,
    retry: RetryPolicy,
}

impl AllocatorService {
    pub fn new(state: AppState) -> Self {
        let retry = state.retry_policy();
        Self { state, retry }
    }

    /// 为节点创建一次分配尝试
    pub async fn allocate(&self, node: &Node) -> Result<AllocationOutcome> {
        let db = self.state.sea_db();
        let now = Utc::now();

        let mut allocation = AllocationActiveModel {
            id: Set(generate_id()),
            node_id: Set(node.id.clone()),
            status: Set(AllocationStatus::Allocating.as_str().to_string()),
            management_subnet_id: Set(None),
            management_ip_id: Set(None),
            management_ip: Set(None),
            workload_subnet_id: Set(None),
            workload_ip_id: Set(None),
            workload_ip: Set(None),
            dns_record_id: Set(None),
            dns_name: Set(None),
            bare_metal_server_id: Set(None),
            error_message: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            released_at: Set(None),
        }
        .insert(&db)
        .await?;

        info!("开始分配云资源: node_id={}, allocation_id={}", node.id, allocation.id);

        match self.run_steps(node, &mut allocation).await? {
            Ok(()) => {
                info!(
                    "云资源分配完成: node_id={}, management_ip={:?}, server_id={:?}",
                    node.id, allocation.management_ip, allocation.bare_metal_server_id
                );
                Ok(AllocationOutcome::Allocated(allocation))
            }
            Err(StepFailure { step, error }) => {
                error!(
                    "云资源分配失败: node_id={}, step={}, kind={}, error={}",
                    node.id,
                    step,
                    error.kind(),
                    error
                );
                metrics::record_allocation_failure(error.kind());

                // 一个资源都没创建的尝试直接视为已释放
                let status = if allocation.holds_resources() {
                    AllocationStatus::Failed
                } else {
                    AllocationStatus::Released
                };
                let released = status == AllocationStatus::Released;

                let mut active: AllocationActiveModel = allocation.into();
                active.status = Set(status.as_str().to_string());
                active.error_message = Set(Some(format!("{}: {}", step, error)));
                active.updated_at = Set(Utc::now().into());
                if released {
                    active.released_at = Set(Some(Utc::now().into()));
                }
                let allocation = active.update(&db).await?;

                Ok(AllocationOutcome::Failed {
                    allocation,
                    step,
                    error,
                })
            }
        }
    }

    /// 依次执行分配步骤；外层错误是数据库错误，内层是云资源失败
    async fn run_steps(
        &self,
        node: &Node,
        allocation: &mut NetworkAllocation,
    ) -> Result<std::result::Result<(), StepFailure>> {
        let db = self.state.sea_db();
        let cloud = self.state.cloud();
        let config = self.state.config();

        // 子网
        let management_subnet = match self.resolve_subnet(&node.management_subnet).await {
            Ok(id) => id,
            Err(e) => return Ok(Err(StepFailure { step: AllocationStep::SubnetSelection, error: e })),
        };
        let workload_subnet = match self.resolve_subnet(&node.workload_subnet).await {
            Ok(id) => id,
            Err(e) => return Ok(Err(StepFailure { step: AllocationStep::SubnetSelection, error: e })),
        };
        *allocation = update(&db, allocation, |a| {
            a.management_subnet_id = Set(Some(management_subnet.clone()));
            a.workload_subnet_id = Set(Some(workload_subnet.clone()));
        })
        .await?;

        // 1. 管理 IP
        let ip_name = format!("{}-mgmt", node.name);
        let key = idempotency_key(allocation, AllocationStep::ManagementIp);
        let management = match self
            .retry
            .run("reserve_ip", || cloud.reserve_ip(&management_subnet, &ip_name, &key))
            .await
        {
            Ok(ip) => ip,
            Err(e) => return Ok(Err(StepFailure { step: AllocationStep::ManagementIp, error: e })),
        };
        *allocation = update(&db, allocation, |a| {
            a.management_ip_id = Set(Some(management.id.clone()));
            a.management_ip = Set(Some(management.address.clone()));
        })
        .await?;

        // 2. 业务 IP
        let ip_name = format!("{}-workload", node.name);
        let key = idempotency_key(allocation, AllocationStep::WorkloadIp);
        let workload = match self
            .retry
            .run("reserve_ip", || cloud.reserve_ip(&workload_subnet, &ip_name, &key))
            .await
        {
            Ok(ip) => ip,
            Err(e) => return Ok(Err(StepFailure { step: AllocationStep::WorkloadIp, error: e })),
        };
        *allocation = update(&db, allocation, |a| {
            a.workload_ip_id = Set(Some(workload.id.clone()));
            a.workload_ip = Set(Some(workload.address.clone()));
        })
        .await?;

        // 3. DNS 记录：主机名 -> 管理 IP
        let dns_name = fqdn(&node.name, &config.cloud.dns_zone);
        let key = idempotency_key(allocation, AllocationStep::DnsRecord);
        let record_id = match self
            .retry
            .run("create_dns_record", || {
                cloud.create_dns_record(&dns_name, &management.address, &key)
            })
            .await
        {
            Ok(id) => id,
            Err(e) => return Ok(Err(StepFailure { step: AllocationStep::DnsRecord, error: e })),
        };
        *allocation = update(&db, allocation, |a| {
            a.dns_record_id = Set(Some(record_id.clone()));
            a.dns_name = Set(Some(dns_name.clone()));
        })
        .await?;

        // 4. 裸金属服务器，引导数据链式加载本服务的 iPXE 脚本
        let spec = BareMetalServerSpec {
            name: node.name.clone(),
            profile: node.server_profile.clone(),
            management: InterfaceSpec {
                subnet_id: management_subnet.clone(),
                reserved_ip_id: management.id.clone(),
            },
            workload: InterfaceSpec {
                subnet_id: workload_subnet.clone(),
                reserved_ip_id: workload.id.clone(),
            },
            user_data: format!("#!ipxe\nchain {}/boot/script\n", config.base_url()),
        };
        let key = idempotency_key(allocation, AllocationStep::BareMetalServer);
        let server_id = match self
            .retry
            .run("create_bare_metal_server", || {
                cloud.create_bare_metal_server(&spec, &key)
            })
            .await
        {
            Ok(id) => id,
            Err(e) => return Ok(Err(StepFailure { step: AllocationStep::BareMetalServer, error: e })),
        };
        *allocation = update(&db, allocation, |a| {
            a.bare_metal_server_id = Set(Some(server_id.clone()));
        })
        .await?;

        Ok(Ok(()))
    }

    /// 解析子网，"auto" 选择候选子网中剩余地址最多的一个
    async fn resolve_subnet(&self, requested: &str) -> std::result::Result<String, CloudError> {
        if requested != AUTO_SUBNET {
            return Ok(requested.to_string());
        }

        let cloud = self.state.cloud();
        let config = self.state.config();
        let candidates: Vec<&str> = config.cloud.subnets.iter().map(|s| s.id.as_str()).collect();

        let subnets = self.retry.run("list_subnets", || cloud.list_subnets()).await?;
        subnets
            .into_iter()
            .filter(|s| candidates.is_empty() || candidates.contains(&s.id.as_str()))
            .filter(|s| s.available_ips > 0)
            .max_by(|a, b| {
                a.available_ips
                    .cmp(&b.available_ips)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|s| s.id)
            .ok_or_else(|| CloudError::Quota("没有剩余容量的候选子网".to_string()))
    }
}

/// 同一次分配尝试中同一步骤的重试共用一个幂等键
fn idempotency_key(allocation: &NetworkAllocation, step: AllocationStep) -> String {
    format!("{}-{}", allocation.id, step.as_str())
}

async fn update<C, F>(db: &C, allocation: &NetworkAllocation, apply: F) -> Result<NetworkAllocation>
where
    C: sea_orm::ConnectionTrait,
    F: FnOnce(&mut AllocationActiveModel),
{
    let mut active: AllocationActiveModel = allocation.clone().into();
    apply(&mut active);
    active.updated_at = Set(Utc::now().into());
    active
        .update(db)
        .await
        .map_err(|e| Error::Database(format!("记录分配进度失败: {}", e)))
}
