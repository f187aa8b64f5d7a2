mod support;

use common::Error;
use provisioner_server::cloud::memory::CloudOperation;
use provisioner_server::cloud::{CloudError, CloudProvider};
use provisioner_server::config::FailurePolicy;
use provisioner_server::db::models::node::{ActiveModel as NodeActiveModel, Entity as NodeEntity};
use provisioner_server::services::{BootConfigService, CleanupService, CleanupStep, StepOutcome};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use support::{create_request, setup, setup_with, test_config};

fn count_calls(calls: &[String], prefix: &str) -> usize {
    calls.iter().filter(|c| c.starts_with(prefix)).count()
}

#[tokio::test]
async fn dns_failure_cleanup_releases_only_the_two_ips() {
    let ctx = setup().await;
    ctx.cloud
        .fail_next(CloudOperation::CreateDnsRecord, CloudError::Validation("zone locked".into()))
        .await;

    let accepted = ctx.provisioning().submit(create_request("hci-a", "prod")).await.unwrap();
    let node = ctx.provisioning().allocate(&accepted.node_id).await.unwrap();
    assert_eq!(node.phase, "error");
    assert!(node.management_ip.is_none());
    let allocation = node.allocation.unwrap();
    assert_eq!(allocation.status, "failed");
    assert!(allocation.management_ip_id.is_some());
    assert!(allocation.workload_ip_id.is_some());
    assert!(allocation.dns_record_id.is_none());
    assert_eq!(ctx.cloud.reserved_ip_count().await, 2);

    let report = CleanupService::new(ctx.state.clone())
        .cleanup(&accepted.node_id)
        .await
        .unwrap();
    assert!(report.complete);
    assert_eq!(report.outcome(CleanupStep::BareMetalServer), Some(StepOutcome::NoOp));
    assert_eq!(report.outcome(CleanupStep::DnsRecord), Some(StepOutcome::NoOp));
    assert_eq!(report.outcome(CleanupStep::WorkloadIp), Some(StepOutcome::Deleted));
    assert_eq!(report.outcome(CleanupStep::ManagementIp), Some(StepOutcome::Deleted));

    let calls = ctx.cloud.calls().await;
    assert_eq!(count_calls(&calls, "release_ip:"), 2);
    assert_eq!(count_calls(&calls, "delete_dns_record:"), 0);
    assert_eq!(count_calls(&calls, "delete_bare_metal_server:"), 0);
    assert_eq!(ctx.cloud.reserved_ip_count().await, 0);
}

#[tokio::test]
async fn cleanup_twice_converges() {
    let ctx = setup().await;
    let node_id = ctx.provision(create_request("hci-a", "prod")).await;
    let cleanup = CleanupService::new(ctx.state.clone());

    let first = cleanup.cleanup(&node_id).await.unwrap();
    assert!(first.complete);
    assert!(first.steps.iter().all(|s| s.outcome == StepOutcome::Deleted));
    assert_eq!(
        first.steps.iter().map(|s| s.step).collect::<Vec<_>>(),
        CleanupStep::ORDER.to_vec()
    );

    let calls_after_first = ctx.cloud.calls().await.len();
    let second = cleanup.cleanup(&node_id).await.unwrap();
    assert!(second.complete);
    assert!(second.steps.iter().all(|s| s.outcome == StepOutcome::NoOp));
    assert_eq!(ctx.cloud.calls().await.len(), calls_after_first);

    assert_eq!(ctx.cloud.reserved_ip_count().await, 0);
    assert_eq!(ctx.cloud.dns_record_count().await, 0);
    assert_eq!(ctx.cloud.server_count().await, 0);

    let node = ctx.provisioning().get_node(&node_id).await.unwrap();
    assert!(node.retired);
    assert_eq!(node.phase, "error");
    assert!(node.management_ip.is_none());
    assert_eq!(node.allocation.map(|a| a.status), Some("released".to_string()));
    assert_eq!(ctx.state.node_locks().len().await, 0);

    // 下线后的地址不再解析
    let boot = BootConfigService::new(ctx.state.clone());
    assert!(matches!(
        boot.boot_script("10.10.0.2".parse().unwrap()).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn failed_cleanup_step_keeps_records_for_retry() {
    let ctx = setup().await;
    let node_id = ctx.provision(create_request("hci-a", "prod")).await;
    ctx.cloud
        .fail_next(CloudOperation::DeleteDnsRecord, CloudError::Validation("record locked".into()))
        .await;
    let cleanup = CleanupService::new(ctx.state.clone());

    let first = cleanup.cleanup(&node_id).await.unwrap();
    assert!(!first.complete);
    assert_eq!(first.outcome(CleanupStep::BareMetalServer), Some(StepOutcome::Deleted));
    assert_eq!(first.outcome(CleanupStep::DnsRecord), Some(StepOutcome::Failed));
    assert_eq!(first.outcome(CleanupStep::WorkloadIp), Some(StepOutcome::Skipped));
    assert_eq!(first.outcome(CleanupStep::ManagementIp), Some(StepOutcome::Skipped));
    match first.error() {
        Some(Error::Cleanup(message)) => assert!(message.contains("record locked")),
        other => panic!("unexpected: {:?}", other),
    }

    let node = ctx.provisioning().get_node(&node_id).await.unwrap();
    assert!(!node.retired);
    assert_eq!(node.management_ip.as_deref(), Some("10.10.0.2"));
    assert_eq!(ctx.cloud.reserved_ip_count().await, 2);
    assert_eq!(ctx.state.node_locks().len().await, 1);

    let second = cleanup.cleanup(&node_id).await.unwrap();
    assert!(second.complete);
    assert_eq!(second.outcome(CleanupStep::BareMetalServer), Some(StepOutcome::NoOp));
    assert_eq!(second.outcome(CleanupStep::DnsRecord), Some(StepOutcome::Deleted));
    assert_eq!(ctx.cloud.reserved_ip_count().await, 0);
    assert_eq!(ctx.state.node_locks().len().await, 0);
}

#[tokio::test]
async fn already_absent_resources_count_as_success() {
    let ctx = setup().await;
    let node_id = ctx.provision(create_request("hci-a", "prod")).await;
    ctx.cloud
        .fail_next(CloudOperation::DeleteServer, CloudError::NotFound("gone".into()))
        .await;

    let report = CleanupService::new(ctx.state.clone()).cleanup(&node_id).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.outcome(CleanupStep::BareMetalServer), Some(StepOutcome::AlreadyAbsent));
}

#[tokio::test]
async fn transient_errors_are_retried_within_budget() {
    let ctx = setup().await;
    for _ in 0..2 {
        ctx.cloud
            .fail_next(CloudOperation::ReserveIp, CloudError::Throttled("429".into()))
            .await;
    }

    let node_id = ctx.provision(create_request("hci-a", "prod")).await;
    let node = ctx.provisioning().get_node(&node_id).await.unwrap();
    assert_eq!(node.phase, "allocated");

    let calls = ctx.cloud.calls().await;
    // 管理 IP 三次尝试，业务 IP 一次
    assert_eq!(count_calls(&calls, "reserve_ip:"), 4);
}

#[tokio::test]
async fn timed_out_creations_are_not_duplicated_on_retry() {
    let ctx = setup().await;
    ctx.cloud
        .lose_next_response(CloudOperation::ReserveIp, CloudError::Timeout("lost".into()))
        .await;
    ctx.cloud
        .lose_next_response(CloudOperation::CreateDnsRecord, CloudError::Timeout("lost".into()))
        .await;
    ctx.cloud
        .lose_next_response(CloudOperation::CreateServer, CloudError::Timeout("lost".into()))
        .await;

    let node_id = ctx.provision(create_request("hci-a", "prod")).await;
    let node = ctx.provisioning().get_node(&node_id).await.unwrap();
    assert_eq!(node.phase, "allocated");
    assert_eq!(node.management_ip.as_deref(), Some("10.10.0.2"));

    let calls = ctx.cloud.calls().await;
    assert_eq!(count_calls(&calls, "reserve_ip:"), 3);
    assert_eq!(count_calls(&calls, "create_bare_metal_server:"), 2);
    assert_eq!(ctx.cloud.reserved_ip_count().await, 2);
    assert_eq!(ctx.cloud.dns_record_count().await, 1);
    assert_eq!(ctx.cloud.server_count().await, 1);

    // 记录中的 ID 就是云端仅有的资源，清理后不留残余
    let report = CleanupService::new(ctx.state.clone()).cleanup(&node_id).await.unwrap();
    assert!(report.complete);
    assert_eq!(ctx.cloud.reserved_ip_count().await, 0);
    assert_eq!(ctx.cloud.dns_record_count().await, 0);
    assert_eq!(ctx.cloud.server_count().await, 0);
}

#[tokio::test]
async fn exhausted_retry_budget_fails_the_node() {
    let ctx = setup().await;
    for _ in 0..3 {
        ctx.cloud
            .fail_next(CloudOperation::CreateServer, CloudError::Unavailable("503".into()))
            .await;
    }

    let accepted = ctx.provisioning().submit(create_request("hci-a", "prod")).await.unwrap();
    let node = ctx.provisioning().allocate(&accepted.node_id).await.unwrap();
    assert_eq!(node.phase, "error");
    assert!(node
        .message
        .as_deref()
        .unwrap_or("")
        .contains("allocation failed at bare_metal_server"));

    let allocation = node.allocation.unwrap();
    assert_eq!(allocation.status, "failed");
    assert!(allocation.dns_record_id.is_some());
    assert!(allocation.bare_metal_server_id.is_none());
    assert_eq!(
        count_calls(&ctx.cloud.calls().await, "create_bare_metal_server:"),
        3
    );
}

#[tokio::test]
async fn quota_errors_are_not_retried() {
    let ctx = setup().await;
    ctx.cloud
        .fail_next(CloudOperation::ReserveIp, CloudError::Quota("over_quota".into()))
        .await;

    let accepted = ctx.provisioning().submit(create_request("hci-a", "prod")).await.unwrap();
    let node = ctx.provisioning().allocate(&accepted.node_id).await.unwrap();
    assert_eq!(node.phase, "error");
    assert_eq!(count_calls(&ctx.cloud.calls().await, "reserve_ip:"), 1);
}

#[tokio::test]
async fn cleanup_policy_releases_partial_allocation() {
    let mut cfg = test_config();
    cfg.allocation.failure_policy = FailurePolicy::Cleanup;
    let ctx = setup_with(cfg).await;
    ctx.cloud
        .fail_next(CloudOperation::CreateDnsRecord, CloudError::Quota("dns quota".into()))
        .await;

    let accepted = ctx.provisioning().submit(create_request("hci-a", "prod")).await.unwrap();
    let node = ctx.provisioning().allocate(&accepted.node_id).await.unwrap();
    assert_eq!(node.phase, "error");
    assert_eq!(node.allocation.map(|a| a.status), Some("released".to_string()));
    assert_eq!(ctx.cloud.reserved_ip_count().await, 0);

    // 没有残留资源，可以直接重新部署
    let retried = ctx.provisioning().reprovision(&accepted.node_id).await.unwrap();
    assert_eq!(retried.phase, "requested");
}

#[tokio::test]
async fn auto_subnet_picks_candidate_with_capacity() {
    let ctx = setup().await;
    let mut dto = create_request("hci-a", "prod");
    dto.network.management_subnet = "auto".to_string();

    let node_id = ctx.provision(dto).await;
    let node = ctx.provisioning().get_node(&node_id).await.unwrap();
    let allocation = node.allocation.unwrap();
    // 两个候选子网容量相同时按 ID 取第一个
    assert_eq!(allocation.management_subnet_id.as_deref(), Some("subnet-mgmt"));
    assert_eq!(allocation.workload_subnet_id.as_deref(), Some("subnet-work"));
}

#[tokio::test]
async fn incomplete_node_state_is_a_generation_failure() {
    let ctx = setup().await;
    let node_id = ctx.provision(create_request("hci-a", "prod")).await;

    let node = NodeEntity::find_by_id(node_id.clone())
        .one(&ctx.state.sea_db())
        .await
        .unwrap()
        .unwrap();
    let mut active: NodeActiveModel = node.into();
    active.workload_ip = Set(None);
    active.update(&ctx.state.sea_db()).await.unwrap();

    let boot = BootConfigService::new(ctx.state.clone());
    let err = boot.boot_script("10.10.0.2".parse().unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::BootConfig(_)));

    let err = boot.boot_script("10.10.0.77".parse().unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn delete_requires_released_resources_and_keeps_history() {
    let ctx = setup().await;
    let node_id = ctx.provision(create_request("hci-a", "prod")).await;

    assert!(matches!(
        ctx.provisioning().delete_node(&node_id).await,
        Err(Error::Conflict(_))
    ));

    CleanupService::new(ctx.state.clone()).cleanup(&node_id).await.unwrap();
    ctx.provisioning().delete_node(&node_id).await.unwrap();

    assert!(matches!(
        ctx.provisioning().get_node(&node_id).await,
        Err(Error::NotFound(_))
    ));
    let entries = ctx.tracker().history_by_address("10.10.0.2").await.unwrap();
    assert!(entries.iter().any(|e| e.phase == "allocated"));
}

#[tokio::test]
async fn address_collision_on_commit_fails_the_node() {
    let ctx = setup().await;
    let node_a = ctx.provision(create_request("hci-a", "prod")).await;
    let allocation_a = ctx.provisioning().get_node(&node_a).await.unwrap().allocation.unwrap();

    // 云端地址被带外释放，下一次预留拿到同一个地址
    ctx.cloud
        .release_ip("subnet-mgmt", allocation_a.management_ip_id.as_deref().unwrap())
        .await
        .unwrap();

    let accepted = ctx.provisioning().submit(create_request("hci-b", "staging")).await.unwrap();
    let err = ctx.provisioning().allocate(&accepted.node_id).await.unwrap_err();
    assert!(matches!(err, Error::Database(_)));

    let node_b = ctx.provisioning().get_node(&accepted.node_id).await.unwrap();
    assert_eq!(node_b.phase, "error");
    assert!(node_b.management_ip.is_none());
    assert!(node_b
        .message
        .as_deref()
        .unwrap_or("")
        .contains("allocation commit failed"));
    let allocation_b = node_b.allocation.unwrap();
    assert_eq!(allocation_b.status, "failed");
    assert!(allocation_b.bare_metal_server_id.is_some());

    // 地址索引仍指向 A
    let boot = BootConfigService::new(ctx.state.clone());
    let script = boot.boot_script("10.10.0.2".parse().unwrap()).await.unwrap();
    assert!(script.contains("set hostname hci-a"));

    let report = CleanupService::new(ctx.state.clone())
        .cleanup(&accepted.node_id)
        .await
        .unwrap();
    assert!(report.complete);
    assert!(report.steps.iter().all(|s| s.outcome == StepOutcome::Deleted));
}

#[tokio::test]
async fn address_collision_with_cleanup_policy_releases_resources() {
    let mut cfg = test_config();
    cfg.allocation.failure_policy = FailurePolicy::Cleanup;
    let ctx = setup_with(cfg).await;
    let node_a = ctx.provision(create_request("hci-a", "prod")).await;
    let allocation_a = ctx.provisioning().get_node(&node_a).await.unwrap().allocation.unwrap();
    ctx.cloud
        .release_ip("subnet-mgmt", allocation_a.management_ip_id.as_deref().unwrap())
        .await
        .unwrap();

    let accepted = ctx.provisioning().submit(create_request("hci-b", "staging")).await.unwrap();
    assert!(ctx.provisioning().allocate(&accepted.node_id).await.is_err());

    let node_b = ctx.provisioning().get_node(&accepted.node_id).await.unwrap();
    assert_eq!(node_b.phase, "error");
    assert_eq!(node_b.allocation.map(|a| a.status), Some("released".to_string()));
    // 只剩 A 的业务 IP 和服务器
    assert_eq!(ctx.cloud.reserved_ip_count().await, 1);
    assert_eq!(ctx.cloud.server_count().await, 1);
}
