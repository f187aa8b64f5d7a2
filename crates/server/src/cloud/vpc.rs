/// VPC 云 API 客户端
///
/// 子网、预留 IP、裸金属服务器走 VPC 接口，A 记录走 DNS 服务接口

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

use super::{BareMetalServerSpec, CloudError, CloudProvider, CloudResult, ReservedIp, SubnetInfo};
use crate::config::CloudSettings;

const DNS_RECORD_TTL: u32 = 300;
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct VpcCloudProvider {
    client: Client,
    endpoint: String,
    dns_endpoint: String,
    api_key: String,
    api_version: String,
    zone: String,
    dns_instance_id: String,
    dns_zone_id: String,
}

#[derive(Deserialize)]
struct SubnetList {
    subnets: Vec<SubnetItem>,
}

#[derive(Deserialize)]
struct SubnetItem {
    id: String,
    name: String,
    ipv4_cidr_block: String,
    #[serde(default)]
    available_ipv4_address_count: u32,
}

#[derive(Deserialize)]
struct ReservedIpItem {
    id: String,
    address: String,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

impl VpcCloudProvider {
    pub fn new(settings: &CloudSettings) -> common::Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| common::Error::Config("vpc 模式需要 cloud.api_key".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| common::Error::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            dns_endpoint: settings.dns_endpoint.trim_end_matches('/').to_string(),
            api_key,
            api_version: settings.api_version.clone(),
            zone: settings.zone.clone(),
            dns_instance_id: settings.dns_instance_id.clone(),
            dns_zone_id: settings.dns_zone_id.clone(),
        })
    }

    fn vpc(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .query(&[("version", self.api_version.as_str()), ("generation", "2")])
    }

    fn dns_records_url(&self) -> String {
        format!(
            "{}/v1/instances/{}/dnszones/{}/resource_records",
            self.dns_endpoint, self.dns_instance_id, self.dns_zone_id
        )
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> CloudResult<Response> {
        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!("云 API 请求失败: operation={}, status={}, body={}", operation, status, body);
        Err(classify_status(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> CloudResult<T> {
        let response = self.send(operation, builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CloudError::Protocol(format!("{}: {}", operation, e)))
    }
}

/// 按 HTTP 状态码与响应体对错误分类
pub fn classify_status(status: StatusCode, body: &str) -> CloudError {
    let message = format!("{} {}", status.as_u16(), body);
    if body.to_lowercase().contains("quota") {
        return CloudError::Quota(message);
    }
    match status {
        StatusCode::NOT_FOUND => CloudError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => CloudError::Throttled(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CloudError::Timeout(message),
        s if s.is_server_error() => CloudError::Unavailable(message),
        _ => CloudError::Validation(message),
    }
}

fn classify_transport(err: reqwest::Error) -> CloudError {
    if err.is_timeout() {
        CloudError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        CloudError::Unavailable(err.to_string())
    } else if err.is_decode() {
        CloudError::Protocol(err.to_string())
    } else {
        CloudError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl CloudProvider for VpcCloudProvider {
    async fn list_subnets(&self) -> CloudResult<Vec<SubnetInfo>> {
        let url = format!("{}/v1/subnets", self.endpoint);
        let list: SubnetList = self
            .send_json("list_subnets", self.vpc(self.client.get(&url)))
            .await?;

        Ok(list
            .subnets
            .into_iter()
            .map(|s| SubnetInfo {
                id: s.id,
                name: s.name,
                cidr: s.ipv4_cidr_block,
                available_ips: s.available_ipv4_address_count,
            })
            .collect())
    }

    async fn reserve_ip(
        &self,
        subnet_id: &str,
        name: &str,
        idempotency_key: &str,
    ) -> CloudResult<ReservedIp> {
        let url = format!("{}/v1/subnets/{}/reserved_ips", self.endpoint, subnet_id);
        let body = json!({ "name": name, "auto_delete": false });
        let request = self
            .vpc(self.client.post(&url))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(&body);
        let item: ReservedIpItem = self.send_json("reserve_ip", request).await?;

        debug!("预留 IP: subnet={}, address={}", subnet_id, item.address);
        Ok(ReservedIp {
            id: item.id,
            subnet_id: subnet_id.to_string(),
            address: item.address,
        })
    }

    async fn release_ip(&self, subnet_id: &str, reserved_ip_id: &str) -> CloudResult<()> {
        let url = format!(
            "{}/v1/subnets/{}/reserved_ips/{}",
            self.endpoint, subnet_id, reserved_ip_id
        );
        self.send("release_ip", self.vpc(self.client.delete(&url)))
            .await
            .map(|_| ())
    }

    async fn create_dns_record(
        &self,
        host_name: &str,
        address: &str,
        idempotency_key: &str,
    ) -> CloudResult<String> {
        let body = json!({
            "name": host_name,
            "type": "A",
            "ttl": DNS_RECORD_TTL,
            "rdata": { "ip": address },
        });
        let record: IdOnly = self
            .send_json(
                "create_dns_record",
                self.client
                    .post(self.dns_records_url())
                    .bearer_auth(&self.api_key)
                    .header(IDEMPOTENCY_HEADER, idempotency_key)
                    .json(&body),
            )
            .await?;
        Ok(record.id)
    }

    async fn delete_dns_record(&self, record_id: &str) -> CloudResult<()> {
        let url = format!("{}/{}", self.dns_records_url(), record_id);
        self.send(
            "delete_dns_record",
            self.client.delete(&url).bearer_auth(&self.api_key),
        )
        .await
        .map(|_| ())
    }

    async fn create_bare_metal_server(
        &self,
        spec: &BareMetalServerSpec,
        idempotency_key: &str,
    ) -> CloudResult<String> {
        let url = format!("{}/v1/bare_metal_servers", self.endpoint);
        let body = json!({
            "name": spec.name,
            "profile": { "name": spec.profile },
            "zone": { "name": self.zone },
            "user_data": spec.user_data,
            "primary_network_interface": {
                "name": "management",
                "subnet": { "id": spec.management.subnet_id },
                "primary_ip": { "id": spec.management.reserved_ip_id },
            },
            "network_interfaces": [{
                "name": "workload",
                "subnet": { "id": spec.workload.subnet_id },
                "primary_ip": { "id": spec.workload.reserved_ip_id },
            }],
        });

        let server: IdOnly = self
            .send_json(
                "create_bare_metal_server",
                self.vpc(self.client.post(&url))
                    .header(IDEMPOTENCY_HEADER, idempotency_key)
                    .json(&body),
            )
            .await?;
        Ok(server.id)
    }

    async fn delete_bare_metal_server(&self, server_id: &str) -> CloudResult<()> {
        let url = format!("{}/v1/bare_metal_servers/{}", self.endpoint, server_id);
        self.send("delete_bare_metal_server", self.vpc(self.client.delete(&url)))
            .await
            .map(|_| ())
    }

    fn provider_type(&self) -> &str {
        "vpc"
    }
}
