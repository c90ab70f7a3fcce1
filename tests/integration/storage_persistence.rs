//! Integration tests for storage persistence
//!
//! These tests verify that:
//! - Agents, metric history and the command ledger survive a restart
//! - The full pipeline runs on the SQLite backend
//! - Replayed batches stay idempotent on disk

use std::sync::Arc;

use fleet_monitor::{
    AgentBatch,
    command::{CommandFilter, CommandState, CommandType},
    ledger::CommandLedger,
    storage::{MetricKind, MetricQuery, StorageBackend, sqlite::SqliteBackend},
    transport::memory::MemoryBroker,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;

use crate::helpers::{ROWS_PER_BATCH, TestHub, batch_json};

#[tokio::test]
async fn test_ledger_and_history_survive_restart() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("fleet.db");

    let (sent_id, pending_id) = {
        let backend = Arc::new(SqliteBackend::new(&db_path, 2).await.unwrap());
        let batch = AgentBatch::decode(batch_json("A1", 1_700_000_000, 12.0).as_bytes()).unwrap();
        backend.apply_agent_batch(&batch).await.unwrap();

        let ledger = CommandLedger::new(backend.clone());
        let sent = ledger
            .create("A1", CommandType::UpdateAsn, json!({"force": true}))
            .await
            .unwrap();
        ledger.mark_sent(sent.command_id).await.unwrap();
        let pending = ledger
            .create("A1", CommandType::UpdateAsn, json!({"force": false}))
            .await
            .unwrap();

        backend.close().await.unwrap();
        (sent.command_id, pending.command_id)
    };

    let backend = SqliteBackend::new(&db_path, 2).await.unwrap();

    let agent = backend.get_agent("A1").await.unwrap().unwrap();
    assert_eq!(agent.hostname.as_deref(), Some("A1.example"));
    assert_eq!(agent.agent_version.as_deref(), Some("1.4.0"));

    let disks = backend
        .query_metrics(MetricQuery::new("A1", MetricKind::Disk))
        .await
        .unwrap();
    assert_eq!(disks.len(), 2);

    let ledger = CommandLedger::new(Arc::new(backend));
    let sent = ledger.get(sent_id).await.unwrap().unwrap();
    assert_eq!(sent.state, CommandState::Sent);
    assert_eq!(sent.command_data, json!({"force": true}));
    assert!(sent.sent_at.is_some());

    let commands = ledger.list("A1", &CommandFilter::default()).await.unwrap();
    assert_eq!(
        commands.iter().map(|c| c.command_id).collect::<Vec<_>>(),
        vec![pending_id, sent_id]
    );
}

#[tokio::test]
async fn test_pipeline_on_sqlite() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("fleet.db"), 4)
        .await
        .unwrap();
    let hub = TestHub::start_with(MemoryBroker::new(), Arc::new(backend)).await;

    let batch = batch_json("A1", 1_700_000_000, 12.0);
    hub.report(batch.clone()).await;
    hub.report(batch).await;
    hub.report(batch_json("A1", 1_700_000_060, 14.0)).await;
    hub.wait_acked(3).await;

    let mut total = 0;
    for kind in MetricKind::ALL {
        total += hub
            .store
            .query_metrics(MetricQuery::new("A1", kind))
            .await
            .unwrap()
            .len();
    }
    assert_eq!(total, 2 * ROWS_PER_BATCH);

    let latest = hub.store.latest_metrics(Some("A1")).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].cpu_percent, Some(14.0));

    let record = hub
        .dispatcher
        .dispatch("A1", CommandType::UpdateAsn, json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, CommandState::Sent);
    assert_eq!(record.command_data, json!({"force": false}));

    hub.shutdown().await;
}
