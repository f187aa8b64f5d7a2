#![allow(dead_code)]

use common::models::{ClusterOperation, NodeRole};
use common::{Phase, PhaseStatus};
use provisioner_server::{
    app_state::AppState,
    cloud::InMemoryCloudProvider,
    config::{Config, SubnetSettings},
    db::{establish_connection, models::node::{NetworkConfigDto, ProvisionNodeDto}, schema::create_tables},
    services::{CallbackTarget, PhaseReport, PhaseTracker, PhaseUpdateResponse, ProvisioningService},
};
use std::sync::Arc;

pub struct TestContext {
    pub state: AppState,
    pub cloud: Arc<InMemoryCloudProvider>,
}

impl TestContext {
    pub fn provisioning(&self) -> ProvisioningService {
        ProvisioningService::new(self.state.clone())
    }

    pub fn tracker(&self) -> PhaseTracker {
        PhaseTracker::new(self.state.clone())
    }

    /// 提交并同步完成分配
    pub async fn provision(&self, dto: ProvisionNodeDto) -> String {
        let accepted = self.provisioning().submit(dto).await.unwrap();
        self.provisioning().allocate(&accepted.node_id).await.unwrap();
        accepted.node_id
    }

    pub async fn report(
        &self,
        node_id: &str,
        phase: Phase,
        status: PhaseStatus,
    ) -> common::Result<PhaseUpdateResponse> {
        self.tracker()
            .apply_callback(
                CallbackTarget::NodeId(node_id.to_string()),
                PhaseReport {
                    phase,
                    status,
                    message: None,
                },
            )
            .await
    }
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.database_url = "sqlite::memory:".to_string();
    cfg.public_base_url = "http://10.99.0.1:3000".to_string();
    cfg.retry.max_attempts = 3;
    cfg.retry.base_delay_ms = 1;
    cfg.retry.max_delay_ms = 5;
    cfg.retry.attempt_timeout_ms = 2_000;
    cfg.cloud.default_workload_subnet = Some("subnet-work".to_string());
    cfg.cloud.subnets = vec![
        SubnetSettings {
            id: "subnet-mgmt".to_string(),
            cidr: Some("10.10.0.0/24".to_string()),
        },
        SubnetSettings {
            id: "subnet-work".to_string(),
            cidr: Some("10.20.0.0/24".to_string()),
        },
    ];
    cfg
}

pub async fn setup() -> TestContext {
    setup_with(test_config()).await
}

pub async fn setup_with(cfg: Config) -> TestContext {
    let db = establish_connection(&cfg.database_url).await.unwrap();
    create_tables(&db).await.unwrap();

    let cloud = Arc::new(
        InMemoryCloudProvider::new()
            .with_subnet("subnet-mgmt", "10.10.0.0/24")
            .unwrap()
            .with_subnet("subnet-work", "10.20.0.0/24")
            .unwrap(),
    );

    let state = AppState::new(db, cloud.clone(), cfg);
    TestContext { state, cloud }
}

pub fn create_request(name: &str, cluster: &str) -> ProvisionNodeDto {
    ProvisionNodeDto {
        name: name.to_string(),
        position: 1,
        server_profile: "cx2d-metal-96x192".to_string(),
        role: NodeRole::ComputeStorage,
        cluster_operation: ClusterOperation::CreateNew,
        cluster_name: cluster.to_string(),
        redundancy_factor: None,
        network: NetworkConfigDto {
            management_subnet: "subnet-mgmt".to_string(),
            workload_subnet: None,
            existing_cluster_ip: None,
        },
    }
}

pub fn join_request(name: &str, cluster: &str, existing_cluster_ip: Option<&str>) -> ProvisionNodeDto {
    let mut dto = create_request(name, cluster);
    dto.position = 2;
    dto.cluster_operation = ClusterOperation::JoinExisting;
    dto.network.existing_cluster_ip = existing_cluster_ip.map(str::to_string);
    dto
}
