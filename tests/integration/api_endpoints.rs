//! Integration tests for API endpoints
//!
//! These tests verify that:
//! - Read endpoints expose agents, latest readings and history
//! - Dispatch endpoints map dispatcher errors to status codes
//! - A failed dispatch can be retried by command id
//! - The status endpoint reports the broker connection and ingest counters

use std::net::SocketAddr;

use chrono::Utc;
use fleet_monitor::api::{ApiState, spawn_api_server};
use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::helpers::{TestHub, batch_json, eventually};

async fn spawn_test_api(hub: &TestHub) -> SocketAddr {
    let state = ApiState::new(
        hub.store.clone(),
        hub.ledger.clone(),
        hub.dispatcher.clone(),
        hub.supervisor.clone(),
        hub.stats.clone(),
        chrono::Duration::minutes(5),
    );

    spawn_api_server("127.0.0.1:0".parse().unwrap(), state)
        .await
        .unwrap()
}

async fn hub_with_agent() -> (TestHub, SocketAddr) {
    let hub = TestHub::start().await;
    hub.report(batch_json("A1", Utc::now().timestamp(), 12.0)).await;
    hub.wait_acked(1).await;

    let addr = spawn_test_api(&hub).await;
    (hub, addr)
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, Value) {
    let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

async fn post(addr: SocketAddr, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let client = reqwest::Client::new();
    let mut request = client.post(format!("http://{addr}{path}"));
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_health() {
    let (hub, addr) = hub_with_agent().await;

    let (status, body) = get(addr, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["store"]["healthy"], true);
    assert_eq!(body["data"]["broker"], "connected");

    hub.shutdown().await;
}

#[tokio::test]
async fn test_agent_and_metric_reads() {
    let (hub, addr) = hub_with_agent().await;

    let (status, body) = get(addr, "/api/data/agents").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["agent_id"], "A1");
    assert_eq!(body["data"][0]["is_alive"], true);

    let (status, body) = get(addr, "/api/data/latest/A1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cpu_percent"], 12.0);
    assert_eq!(body["data"]["memory_percent"], 61.0);

    let (status, body) = get(addr, "/api/data/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = get(addr, "/api/data/history/A1/disk").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = get(addr, "/api/data/history/A1/disk?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_read_errors() {
    let (hub, addr) = hub_with_agent().await;

    let (status, body) = get(addr, "/api/data/latest/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");

    let (status, body) = get(addr, "/api/data/history/A1/gpu").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("gpu"));

    hub.shutdown().await;
}

#[tokio::test]
async fn test_update_asn_dispatch_and_history() {
    let (hub, addr) = hub_with_agent().await;

    let (status, body) = post(addr, "/api/commands/update-asn/A1", Some(json!({"force": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["state"], "sent");
    assert_eq!(body["data"]["command_data"], json!({"force": true}));
    let command_id = body["data"]["command_id"].as_str().unwrap().to_string();

    // no body means force = false
    let (status, body) = post(addr, "/api/commands/update-asn/A1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["command_data"], json!({"force": false}));

    let (status, body) = get(addr, "/api/commands/history/A1?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 1);

    let (_, body) = get(addr, "/api/commands/history/A1?status=sent").await;
    assert_eq!(body["data"]["count"], 2);
    assert_eq!(body["data"]["commands"][1]["command_id"], command_id);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_validation() {
    let (hub, addr) = hub_with_agent().await;

    let (status, _) = post(addr, "/api/commands/update-asn/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(addr, "/api/commands/update-asn/A1", Some(json!({"force": "yes"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post(
        addr,
        "/api/commands/A1",
        Some(json!({"command_type": "reboot", "command_data": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("reboot"));

    let (status, body) = post(
        addr,
        "/api/commands/A1",
        Some(json!({"command_type": "update_asn", "command_data": {"force": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["command_type"], "update_asn");

    // nothing was recorded for the rejected requests
    let (_, body) = get(addr, "/api/commands/history/A1").await;
    assert_eq!(body["data"]["count"], 1);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_broker_and_retry() {
    let (hub, addr) = hub_with_agent().await;

    hub.broker.set_online(false).await;
    let sessions = hub.supervisor.sessions();
    eventually(move || {
        let gone = sessions.borrow().is_none();
        async move { gone }
    })
    .await;

    let (status, body) = post(addr, "/api/commands/update-asn/A1", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "error");
    let command_id = body["command_id"].as_str().unwrap().to_string();

    let (_, body) = get(addr, "/api/commands/history/A1?status=pending").await;
    assert_eq!(body["data"]["count"], 1);

    let (status, _) = post(addr, &format!("/api/commands/retry/{command_id}"), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    hub.broker.set_online(true).await;
    hub.wait_connected().await;

    let (status, body) = post(addr, &format!("/api/commands/retry/{command_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "sent");
    assert_eq!(body["data"]["command_id"], command_id);

    let (status, _) = post(addr, &format!("/api/commands/retry/{command_id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post(addr, "/api/commands/retry/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_pipeline_counters() {
    let (hub, addr) = hub_with_agent().await;
    hub.report("garbage").await;

    let stats = hub.stats.clone();
    eventually(move || {
        let stats = stats.clone();
        async move { stats.snapshot().rejected == 1 }
    })
    .await;

    let (status, body) = get(addr, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["broker"]["state"], "connected");
    assert_eq!(body["data"]["ingest"]["acked"], 1);
    assert_eq!(body["data"]["ingest"]["rejected"], 1);
    assert!(body["data"]["stale_commands"].is_null());

    hub.shutdown().await;
}
