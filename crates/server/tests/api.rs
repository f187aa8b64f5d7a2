mod support;

use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{header, Method, Request, StatusCode},
    Router,
};
use provisioner_server::build_router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use support::{setup_with, test_config, TestContext};
use tower::ServiceExt;

async fn app() -> (TestContext, Router) {
    let mut cfg = test_config();
    cfg.trust_forwarded_for = true;
    let ctx = setup_with(cfg).await;
    let router = build_router(ctx.state.clone());
    (ctx, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(router, request).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn provision_body(name: &str) -> Value {
    json!({
        "name": name,
        "position": 1,
        "server_profile": "cx2d-metal-96x192",
        "role": "compute-storage",
        "cluster_operation": "create_new",
        "cluster_name": "prod",
        "redundancy_factor": 2,
        "network": { "management_subnet": "subnet-mgmt" }
    })
}

/// 提交部署并等待后台分配完成
async fn provision_via_api(router: &Router, name: &str) -> String {
    let (status, body) = send_json(router, post_json("/api/nodes", provision_body(name))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let node_id = body["node_id"].as_str().unwrap().to_string();
    assert_eq!(body["phase"], "requested");
    assert_eq!(body["status_url"], format!("/api/nodes/{}", node_id));

    for _ in 0..200 {
        let (_, node) = send_json(router, get(&format!("/api/nodes/{}", node_id))).await;
        if node["phase"] == "allocated" {
            return node_id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node {} was not allocated in time", node_id);
}

#[tokio::test]
async fn malformed_request_body_is_rejected() {
    let (ctx, router) = app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/nodes")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"name\": "))
        .unwrap();

    let (status, body) = send_json(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
    assert_eq!(body["success"], false);
    assert!(ctx.cloud.calls().await.is_empty());
}

#[tokio::test]
async fn invalid_field_values_are_rejected() {
    let (ctx, router) = app().await;
    let mut body = provision_body("hci-a");
    body["position"] = json!(0);

    let (status, body) = send_json(&router, post_json("/api/nodes", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
    assert!(ctx.cloud.calls().await.is_empty());
}

#[tokio::test]
async fn boot_endpoints_serve_allocated_node() {
    let (_ctx, router) = app().await;
    provision_via_api(&router, "hci-a").await;

    let request = Request::builder()
        .uri("/boot/script")
        .header("x-forwarded-for", "10.10.0.2, 192.168.1.1")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    let script = String::from_utf8(body).unwrap();
    assert!(script.starts_with("#!ipxe"));
    assert!(script.contains("set cluster-action create:10.10.0.2:rf2:"));

    let (status, document) = send_json(&router, get("/boot/server/10.10.0.2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(document["hostname"], "hci-a");
    assert_eq!(document["network"]["management_ip"], "10.10.0.2");
    assert_eq!(document["cluster"]["operation"], "create_new");

    let request = Request::builder()
        .uri("/boot/script")
        .header("x-forwarded-for", "10.10.0.99")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");

    let (status, _) = send_json(&router, get("/boot/server/not-an-ip")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn phase_callbacks_use_source_address() {
    let (_ctx, router) = app().await;
    let node_id = provision_via_api(&router, "hci-a").await;

    let callback = |phase: &str| {
        let mut request = post_json("/boot/phase", json!({ "phase": phase, "status": "success" }));
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 10, 0, 2], 41000))));
        request
    };

    let (status, body) = send_json(&router, callback("network_config")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["node_id"], node_id.as_str());
    assert_eq!(body["phase"], "network_config");

    let (status, _) = send_json(&router, callback("imaging")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&router, callback("network_config")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "PHASE_CONFLICT");
    assert_eq!(body["accepted"], false);
    assert_eq!(body["current_phase"], "imaging");

    let (status, body) = send_json(&router, callback("booting_somewhere")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");

    let (status, history) =
        send_json(&router, get(&format!("/api/nodes/{}/history", node_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["current_phase"], "imaging");
    let entries = history["entries"].as_array().unwrap();
    assert!(entries.iter().any(|e| e["accepted"] == false));
}

#[tokio::test]
async fn cleanup_and_delete_through_api() {
    let (ctx, router) = app().await;
    let node_id = provision_via_api(&router, "hci-a").await;

    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/nodes/{}", node_id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send_json(&router, request).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, report) =
        send_json(&router, post_json(&format!("/api/nodes/{}/cleanup", node_id), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["complete"], true);
    assert_eq!(report["steps"].as_array().unwrap().len(), 4);
    assert_eq!(report["steps"][0]["step"], "bare_metal_server");
    assert_eq!(ctx.cloud.reserved_ip_count().await, 0);

    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/nodes/{}", node_id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send_json(&router, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&router, get(&format!("/api/nodes/{}", node_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");

    let (status, entries) = send_json(&router, get("/api/history/10.10.0.2")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!entries.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn listing_stats_health_and_metrics() {
    let (_ctx, router) = app().await;
    provision_via_api(&router, "hci-a").await;

    let (status, list) = send_json(&router, get("/api/nodes?page=1&page_size=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);

    let (status, _) = send_json(&router, get("/api/nodes?phase=not_a_phase")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, stats) = send_json(&router, get("/api/nodes/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["by_phase"]["allocated"], 1);

    let (status, health) = send_json(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["cloud_provider"], "memory");

    let (status, body) = send(&router, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("provision_requests_total"));
}
