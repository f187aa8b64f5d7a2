/// 内存云 provider
///
/// 用于开发环境和测试，支持按操作注入故障并记录调用

use async_trait::async_trait;
use common::utils::generate_id;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::debug;

use super::{BareMetalServerSpec, CloudError, CloudProvider, CloudResult, ReservedIp, SubnetInfo};

/// 可注入故障的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOperation {
    ListSubnets,
    ReserveIp,
    ReleaseIp,
    CreateDnsRecord,
    DeleteDnsRecord,
    CreateServer,
    DeleteServer,
}

impl CloudOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudOperation::ListSubnets => "list_subnets",
            CloudOperation::ReserveIp => "reserve_ip",
            CloudOperation::ReleaseIp => "release_ip",
            CloudOperation::CreateDnsRecord => "create_dns_record",
            CloudOperation::DeleteDnsRecord => "delete_dns_record",
            CloudOperation::CreateServer => "create_bare_metal_server",
            CloudOperation::DeleteServer => "delete_bare_metal_server",
        }
    }
}

struct SubnetState {
    info: SubnetInfo,
    network: u32,
    host_count: u32,
    used_hosts: HashSet<u32>,
}

#[derive(Default)]
struct State {
    subnets: Vec<SubnetState>,
    /// reserved_ip_id -> (subnet_id, host offset, address)
    reserved_ips: HashMap<String, (String, u32, String)>,
    /// record_id -> (host_name, address)
    dns_records: HashMap<String, (String, String)>,
    /// server_id -> spec
    servers: HashMap<String, BareMetalServerSpec>,
    /// idempotency_key -> 资源 ID
    idempotency: HashMap<String, String>,
    faults: HashMap<CloudOperation, VecDeque<Fault>>,
    calls: Vec<String>,
}

enum Fault {
    /// 请求被拒绝，云端无变化
    Reject(CloudError),
    /// 云端已执行，但调用方收到错误
    LoseResponse(CloudError),
}

impl State {
    /// 记录调用并取出一个待注入的故障
    ///
    /// 返回的错误需要在操作执行之后交给调用方
    fn enter(&mut self, op: CloudOperation, target: &str) -> CloudResult<Option<CloudError>> {
        self.calls.push(format!("{}:{}", op.as_str(), target));
        match self.faults.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(Fault::Reject(err)) => Err(err),
            Some(Fault::LoseResponse(err)) => Ok(Some(err)),
            None => Ok(None),
        }
    }

    /// 幂等键对应且仍存在的资源
    fn replay(&self, key: &str, exists: impl Fn(&State, &str) -> bool) -> Option<String> {
        self.idempotency
            .get(key)
            .filter(|id| exists(self, id.as_str()))
            .cloned()
    }
}

fn finish<T>(lost: Option<CloudError>, value: T) -> CloudResult<T> {
    match lost {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

pub struct InMemoryCloudProvider {
    state: Mutex<State>,
}

impl InMemoryCloudProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// 添加子网（构造阶段）
    pub fn with_subnet(mut self, id: &str, cidr: &str) -> common::Result<Self> {
        let subnet = parse_subnet(id, cidr)?;
        self.state.get_mut().subnets.push(subnet);
        Ok(self)
    }

    /// 运行时添加子网
    pub fn add_subnet(&self, id: &str, cidr: &str) -> common::Result<()> {
        let subnet = parse_subnet(id, cidr)?;
        let mut state = self
            .state
            .try_lock()
            .map_err(|_| common::Error::Internal("云 provider 状态被占用".to_string()))?;
        state.subnets.push(subnet);
        Ok(())
    }

    /// 让指定操作的下一次调用返回错误，可多次调用排队
    pub async fn fail_next(&self, op: CloudOperation, err: CloudError) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().push_back(Fault::Reject(err));
    }

    /// 让指定操作的下一次调用在云端生效，但返回错误（模拟响应丢失）
    pub async fn lose_next_response(&self, op: CloudOperation, err: CloudError) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().push_back(Fault::LoseResponse(err));
    }

    /// 已发生的调用，格式为 "操作:目标"
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn reserved_ip_count(&self) -> usize {
        self.state.lock().await.reserved_ips.len()
    }

    pub async fn dns_record_count(&self) -> usize {
        self.state.lock().await.dns_records.len()
    }

    pub async fn server_count(&self) -> usize {
        self.state.lock().await.servers.len()
    }
}

impl Default for InMemoryCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_subnet(id: &str, cidr: &str) -> common::Result<SubnetState> {
    let (base, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| common::Error::Config(format!("无效的 CIDR 格式: {}", cidr)))?;
    let base: Ipv4Addr = base
        .parse()
        .map_err(|_| common::Error::Config(format!("无效的 CIDR 地址: {}", cidr)))?;
    let prefix: u32 = prefix
        .parse()
        .map_err(|_| common::Error::Config(format!("无效的 CIDR 前缀: {}", cidr)))?;
    if prefix > 30 {
        return Err(common::Error::Config(format!("子网太小: {}", cidr)));
    }
    if prefix < 1 {
        return Err(common::Error::Config(format!("子网太大: {}", cidr)));
    }

    let mask = u32::MAX << (32 - prefix);
    // 去掉网络地址、网关和广播地址
    let host_count = (1u32 << (32 - prefix)).saturating_sub(3);

    Ok(SubnetState {
        info: SubnetInfo {
            id: id.to_string(),
            name: id.to_string(),
            cidr: cidr.to_string(),
            available_ips: host_count,
        },
        network: u32::from(base) & mask,
        host_count,
        used_hosts: HashSet::new(),
    })
}

#[async_trait]
impl CloudProvider for InMemoryCloudProvider {
    async fn list_subnets(&self) -> CloudResult<Vec<SubnetInfo>> {
        let mut state = self.state.lock().await;
        let lost = state.enter(CloudOperation::ListSubnets, "*")?;

        let subnets = state
            .subnets
            .iter()
            .map(|s| SubnetInfo {
                available_ips: s.host_count - s.used_hosts.len() as u32,
                ..s.info.clone()
            })
            .collect();
        finish(lost, subnets)
    }

    async fn reserve_ip(
        &self,
        subnet_id: &str,
        name: &str,
        idempotency_key: &str,
    ) -> CloudResult<ReservedIp> {
        let mut state = self.state.lock().await;
        let lost = state.enter(CloudOperation::ReserveIp, subnet_id)?;

        if let Some(id) = state.replay(idempotency_key, |s, id| s.reserved_ips.contains_key(id)) {
            if let Some((owner, _, address)) = state.reserved_ips.get(&id) {
                debug!("幂等键命中已预留 IP: key={}, id={}", idempotency_key, id);
                let existing = ReservedIp {
                    id: id.clone(),
                    subnet_id: owner.clone(),
                    address: address.clone(),
                };
                return finish(lost, existing);
            }
        }

        let subnet = state
            .subnets
            .iter_mut()
            .find(|s| s.info.id == subnet_id)
            .ok_or_else(|| CloudError::Validation(format!("子网不存在: {}", subnet_id)))?;

        // 主机号从 2 开始，1 留给网关
        let offset = (2..subnet.host_count + 2)
            .find(|h| !subnet.used_hosts.contains(h))
            .ok_or_else(|| CloudError::Quota(format!("子网 {} 没有可用 IP", subnet_id)))?;
        subnet.used_hosts.insert(offset);
        let address = Ipv4Addr::from(subnet.network + offset).to_string();

        let id = format!("rip-{}", generate_id());
        state
            .reserved_ips
            .insert(id.clone(), (subnet_id.to_string(), offset, address.clone()));
        state
            .idempotency
            .insert(idempotency_key.to_string(), id.clone());
        debug!("预留 IP: name={}, subnet={}, address={}", name, subnet_id, address);

        finish(
            lost,
            ReservedIp {
                id,
                subnet_id: subnet_id.to_string(),
                address,
            },
        )
    }

    async fn release_ip(&self, subnet_id: &str, reserved_ip_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        let lost = state.enter(CloudOperation::ReleaseIp, reserved_ip_id)?;

        let (owner, offset, _) = state
            .reserved_ips
            .remove(reserved_ip_id)
            .ok_or_else(|| CloudError::NotFound(format!("预留 IP 不存在: {}", reserved_ip_id)))?;
        if owner != subnet_id {
            debug!("预留 IP {} 实际属于子网 {}", reserved_ip_id, owner);
        }
        if let Some(subnet) = state.subnets.iter_mut().find(|s| s.info.id == owner) {
            subnet.used_hosts.remove(&offset);
        }
        finish(lost, ())
    }

    async fn create_dns_record(
        &self,
        host_name: &str,
        address: &str,
        idempotency_key: &str,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        let lost = state.enter(CloudOperation::CreateDnsRecord, host_name)?;

        if let Some(id) = state.replay(idempotency_key, |s, id| s.dns_records.contains_key(id)) {
            return finish(lost, id);
        }

        let id = format!("dns-{}", generate_id());
        state
            .dns_records
            .insert(id.clone(), (host_name.to_string(), address.to_string()));
        state
            .idempotency
            .insert(idempotency_key.to_string(), id.clone());
        finish(lost, id)
    }

    async fn delete_dns_record(&self, record_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        let lost = state.enter(CloudOperation::DeleteDnsRecord, record_id)?;

        state
            .dns_records
            .remove(record_id)
            .ok_or_else(|| CloudError::NotFound(format!("DNS 记录不存在: {}", record_id)))?;
        finish(lost, ())
    }

    async fn create_bare_metal_server(
        &self,
        spec: &BareMetalServerSpec,
        idempotency_key: &str,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        let lost = state.enter(CloudOperation::CreateServer, &spec.name)?;

        if let Some(id) = state.replay(idempotency_key, |s, id| s.servers.contains_key(id)) {
            return finish(lost, id);
        }

        for ip_id in [&spec.management.reserved_ip_id, &spec.workload.reserved_ip_id] {
            if !state.reserved_ips.contains_key(ip_id.as_str()) {
                return Err(CloudError::Validation(format!("预留 IP 不存在: {}", ip_id)));
            }
        }

        let id = format!("bms-{}", generate_id());
        state.servers.insert(id.clone(), spec.clone());
        state
            .idempotency
            .insert(idempotency_key.to_string(), id.clone());
        finish(lost, id)
    }

    async fn delete_bare_metal_server(&self, server_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        let lost = state.enter(CloudOperation::DeleteServer, server_id)?;

        state
            .servers
            .remove(server_id)
            .ok_or_else(|| CloudError::NotFound(format!("裸金属服务器不存在: {}", server_id)))?;
        finish(lost, ())
    }

    fn provider_type(&self) -> &str {
        "memory"
    }
}
