//! Integration tests for failure scenarios
//!
//! These tests verify that:
//! - A store outage requeues batches until the store is back (no loss)
//! - Malformed messages are discarded without blocking the queue
//! - Broker loss is absorbed by the supervisor and ingestion resumes
//! - Dispatch while disconnected fails fast and leaves the row pending

use std::sync::Arc;

use assert_matches::assert_matches;
use fleet_monitor::{
    command::{CommandMessage, CommandState, CommandType},
    dispatch::DispatchError,
    storage::{MetricKind, MetricQuery, StorageBackend, memory::MemoryBackend},
    supervisor::ConnectionState,
    transport::memory::MemoryBroker,
};
use serde_json::json;

use crate::helpers::{COMMAND_QUEUE, DATA_QUEUE, TestHub, batch_json, eventually};

#[tokio::test]
async fn test_store_outage_requeues_until_recovery() {
    let store = Arc::new(MemoryBackend::new());
    store.set_available(false);
    let hub = TestHub::start_with(MemoryBroker::new(), store.clone()).await;

    hub.report(batch_json("A1", 1_700_000_000, 12.0)).await;

    let stats = hub.stats.clone();
    eventually(move || {
        let stats = stats.clone();
        async move { stats.snapshot().redelivered_failures >= 1 }
    })
    .await;
    assert!(!store.agent_exists("A1").await.is_ok_and(|exists| exists));

    store.set_available(true);
    hub.wait_agent("A1").await;
    hub.wait_acked(1).await;

    let snapshot = hub.stats.snapshot();
    assert!(snapshot.requeued >= 2);
    assert_eq!(snapshot.rejected, 0);
    assert!(hub.broker.discarded().await.is_empty());

    hub.shutdown().await;
}

#[tokio::test]
async fn test_malformed_messages_do_not_block_the_queue() {
    let hub = TestHub::start().await;

    hub.report("{not json").await;
    hub.report(r#"{"hostname": "h", "cpu_percent": 1.0}"#).await;
    hub.report(batch_json("A1", 1_700_000_000, 12.0)).await;

    hub.wait_acked(1).await;
    assert!(hub.store.agent_exists("A1").await.unwrap());

    let broker = hub.broker.clone();
    eventually(move || {
        let broker = broker.clone();
        async move { broker.discarded().await.len() == 2 }
    })
    .await;
    assert_eq!(hub.stats.snapshot().rejected, 2);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_ingestion_resumes_after_broker_loss() {
    let hub = TestHub::start().await;

    hub.report(batch_json("A1", 1_700_000_000, 12.0)).await;
    hub.wait_acked(1).await;

    hub.broker.sever().await;
    let supervisor = hub.supervisor.clone();
    eventually(move || {
        let supervisor = supervisor.clone();
        async move {
            supervisor.connections_established() >= 2
                && supervisor.state() == ConnectionState::Connected
        }
    })
    .await;

    // queues survive the lost session and are declared again
    assert!(hub.broker.queue_exists(DATA_QUEUE).await);
    assert!(hub.broker.queue_exists(COMMAND_QUEUE).await);

    hub.report(batch_json("A1", 1_700_000_060, 13.0)).await;
    hub.wait_acked(2).await;

    let cpu = hub
        .store
        .query_metrics(MetricQuery::new("A1", MetricKind::Cpu))
        .await
        .unwrap();
    assert_eq!(cpu.len(), 2);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_batches_published_while_offline_are_consumed_later() {
    let broker = MemoryBroker::new();
    broker.set_online(false).await;
    let hub = TestHub::start_with(broker, Arc::new(MemoryBackend::new())).await;

    hub.report(batch_json("A1", 1_700_000_000, 12.0)).await;
    hub.report(batch_json("B2", 1_700_000_000, 12.0)).await;

    let broker = hub.broker.clone();
    eventually(move || {
        let broker = broker.clone();
        async move { broker.connect_attempts() >= 2 }
    })
    .await;
    assert_ne!(hub.supervisor.state(), ConnectionState::Connected);

    hub.broker.set_online(true).await;
    hub.wait_connected().await;
    hub.wait_acked(2).await;

    assert_eq!(hub.store.list_agents().await.unwrap().len(), 2);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_while_disconnected_then_retry() {
    let hub = TestHub::start().await;
    hub.report(batch_json("A1", 1_700_000_000, 12.0)).await;
    hub.wait_agent("A1").await;

    hub.broker.set_online(false).await;
    let sessions = hub.supervisor.sessions();
    eventually(move || {
        let gone = sessions.borrow().is_none();
        async move { gone }
    })
    .await;

    let err = hub
        .dispatcher
        .dispatch("A1", CommandType::UpdateAsn, json!({"force": true}))
        .await
        .unwrap_err();
    let command_id = assert_matches!(
        err,
        DispatchError::TransportUnavailable { command_id, .. } => command_id
    );

    let pending = hub.ledger.get(command_id).await.unwrap().unwrap();
    assert_eq!(pending.state, CommandState::Pending);
    assert!(pending.sent_at.is_none());

    hub.broker.set_online(true).await;
    hub.wait_connected().await;

    let sent = hub.dispatcher.redispatch(command_id).await.unwrap();
    assert_eq!(sent.state, CommandState::Sent);
    assert_eq!(
        hub.ledger.list("A1", &Default::default()).await.unwrap().len(),
        1
    );

    let messages = hub.broker.drain(COMMAND_QUEUE).await;
    assert_eq!(messages.len(), 1);
    let message: CommandMessage = serde_json::from_slice(&messages[0]).unwrap();
    assert_eq!(message.command_id, command_id);

    hub.shutdown().await;
}
