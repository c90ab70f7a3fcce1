//! End-to-end tests for the ingestion and dispatch paths
//!
//! These tests verify that:
//! - Agent batches flow from the inbound queue into the store
//! - Redelivered batches do not duplicate rows
//! - Agent rows only move forward in time
//! - Dispatched commands reach the outbound queue backed by a ledger row

use chrono::DateTime;
use fleet_monitor::{
    command::{CommandMessage, CommandOutcome, CommandState, CommandType},
    ledger::TransitionOutcome,
    storage::{MetricKind, MetricQuery},
};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::helpers::{COMMAND_QUEUE, ROWS_PER_BATCH, TestHub, batch_json};

#[tokio::test]
async fn test_batches_are_stored_and_acked() {
    let hub = TestHub::start().await;

    hub.report(batch_json("A1", 1_700_000_000, 12.0)).await;
    hub.report(batch_json("B2", 1_700_000_000, 34.0)).await;

    hub.wait_acked(2).await;

    let agents = hub.store.list_agents().await.unwrap();
    assert_eq!(
        agents.iter().map(|a| a.agent_id.as_str()).collect::<Vec<_>>(),
        vec!["A1", "B2"]
    );

    let disks = hub
        .store
        .query_metrics(MetricQuery::new("A1", MetricKind::Disk))
        .await
        .unwrap();
    assert_eq!(disks.len(), 2);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_batch_adds_nothing() {
    let hub = TestHub::start().await;
    let batch = batch_json("A1", 1_700_000_000, 12.0);

    hub.report(batch.clone()).await;
    hub.report(batch).await;
    hub.wait_acked(2).await;

    let mut total = 0;
    for kind in MetricKind::ALL {
        total += hub
            .store
            .query_metrics(MetricQuery::new("A1", kind))
            .await
            .unwrap()
            .len();
    }
    assert_eq!(total, ROWS_PER_BATCH);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_agent_row_only_moves_forward() {
    let hub = TestHub::start().await;

    hub.report(batch_json("A1", 1_700_000_100, 1.0)).await;
    hub.report(batch_json("A1", 1_700_000_300, 2.0)).await;
    // a late batch from before the first one
    hub.report(batch_json("A1", 1_700_000_050, 3.0)).await;
    hub.wait_acked(3).await;

    let agent = hub.store.get_agent("A1").await.unwrap().unwrap();
    assert_eq!(agent.first_seen, DateTime::from_timestamp(1_700_000_050, 0).unwrap());
    assert_eq!(agent.last_seen, DateTime::from_timestamp(1_700_000_300, 0).unwrap());

    let cpu = hub
        .store
        .query_metrics(MetricQuery::new("A1", MetricKind::Cpu))
        .await
        .unwrap();
    let times: Vec<i64> = cpu.iter().map(|r| r.timestamp().timestamp()).collect();
    assert_eq!(times, vec![1_700_000_300, 1_700_000_100, 1_700_000_050]);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_reaches_the_command_queue() {
    let hub = TestHub::start().await;
    hub.report(batch_json("A1", 1_700_000_000, 12.0)).await;
    hub.wait_agent("A1").await;

    let record = hub
        .dispatcher
        .dispatch("A1", CommandType::UpdateAsn, json!({"force": true}))
        .await
        .unwrap();
    assert_eq!(record.state, CommandState::Sent);

    let messages = hub.broker.drain(COMMAND_QUEUE).await;
    assert_eq!(messages.len(), 1);

    let message: CommandMessage = serde_json::from_slice(&messages[0]).unwrap();
    assert_eq!(message.agent_id, "A1");
    assert_eq!(message.command_type, CommandType::UpdateAsn);
    assert_eq!(message.command_data, json!({"force": true}));
    assert_eq!(message.command_id, record.command_id);

    // the wire format uses snake_case field names
    let raw: serde_json::Value = serde_json::from_slice(&messages[0]).unwrap();
    assert_eq!(raw["command_type"], "update_asn");
    assert!(raw["timestamp"].is_string());

    hub.shutdown().await;
}

#[tokio::test]
async fn test_agent_outcome_is_recorded_once() {
    let hub = TestHub::start().await;
    hub.report(batch_json("A1", 1_700_000_000, 12.0)).await;
    hub.wait_agent("A1").await;

    let record = hub
        .dispatcher
        .dispatch("A1", CommandType::UpdateAsn, json!({}))
        .await
        .unwrap();

    let first = hub
        .ledger
        .mark_terminal(
            record.command_id,
            CommandOutcome::Acknowledged,
            Some(json!({"asn": 64500})),
        )
        .await
        .unwrap();
    let second = hub
        .ledger
        .mark_terminal(record.command_id, CommandOutcome::Failed, None)
        .await
        .unwrap();
    assert_eq!(first, TransitionOutcome::Applied);
    assert_eq!(second, TransitionOutcome::Unchanged);

    let stored = hub.ledger.get(record.command_id).await.unwrap().unwrap();
    assert_eq!(stored.state, CommandState::Acknowledged);
    assert_eq!(stored.result, Some(json!({"asn": 64500})));

    hub.shutdown().await;
}
