//! Helper functions for integration tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleet_monitor::{
    dispatch::CommandDispatcher,
    ingest::{IngestStats, IngestionConsumer},
    ledger::CommandLedger,
    storage::{StorageBackend, memory::MemoryBackend},
    supervisor::{ConnectionState, SupervisorHandle, SupervisorSettings},
    transport::memory::MemoryBroker,
};

pub const DATA_QUEUE: &str = "agent_data";
pub const COMMAND_QUEUE: &str = "agent_commands";

const WAIT: Duration = Duration::from_secs(3);

/// A hub wired on the in-memory broker
pub struct TestHub {
    pub broker: MemoryBroker,
    pub store: Arc<dyn StorageBackend>,
    pub supervisor: SupervisorHandle,
    pub ledger: CommandLedger,
    pub dispatcher: CommandDispatcher,
    pub stats: Arc<IngestStats>,
}

impl TestHub {
    pub async fn start() -> Self {
        Self::start_with(MemoryBroker::new(), Arc::new(MemoryBackend::new())).await
    }

    /// Start on the given broker and store; waits for the first connection
    /// unless the broker is offline
    pub async fn start_with(broker: MemoryBroker, store: Arc<dyn StorageBackend>) -> Self {
        let consumer = IngestionConsumer::new(store.clone());
        let stats = consumer.stats();
        let supervisor = SupervisorHandle::spawn(
            Arc::new(broker.clone()),
            consumer,
            SupervisorSettings {
                data_queue: DATA_QUEUE.to_string(),
                command_queue: COMMAND_QUEUE.to_string(),
                reconnect_delay: Duration::from_millis(20),
                consumer_tag: "integration".to_string(),
            },
        );

        let ledger = CommandLedger::new(store.clone());
        let dispatcher = CommandDispatcher::new(
            store.clone(),
            ledger.clone(),
            supervisor.sessions(),
            COMMAND_QUEUE,
        );

        let hub = Self {
            broker,
            store,
            supervisor,
            ledger,
            dispatcher,
            stats,
        };

        if hub.broker.is_online() {
            hub.wait_connected().await;
        }
        hub
    }

    pub async fn wait_connected(&self) {
        tokio::time::timeout(WAIT, self.supervisor.wait_for(ConnectionState::Connected))
            .await
            .expect("supervisor did not connect in time")
            .unwrap();
    }

    /// Publish a batch as an agent would
    pub async fn report(&self, payload: impl Into<Vec<u8>>) {
        self.broker.inject(DATA_QUEUE, payload).await;
    }

    pub async fn wait_acked(&self, count: u64) {
        let stats = self.stats.clone();
        eventually(move || {
            let stats = stats.clone();
            async move { stats.snapshot().acked >= count }
        })
        .await;
    }

    pub async fn wait_agent(&self, agent_id: &str) {
        let store = self.store.clone();
        let agent_id = agent_id.to_string();
        eventually(move || {
            let store = store.clone();
            let agent_id = agent_id.clone();
            async move { store.agent_exists(&agent_id).await.unwrap_or(false) }
        })
        .await;
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await.unwrap();
    }
}

pub fn batch_json(agent_id: &str, timestamp_secs: i64, cpu_percent: f64) -> String {
    serde_json::json!({
        "agent_id": agent_id,
        "hostname": format!("{agent_id}.example"),
        "agent_version": "1.4.0",
        "timestamp": timestamp_secs,
        "cpu_percent": cpu_percent,
        "load_avg_1min": 0.5,
        "memory": {"percent": 61.0, "used_gb": 9.8, "total_gb": 16.0, "free_gb": 6.2},
        "disks": [
            {"device": "/dev/sda1", "mountpoint": "/", "percent": 40.0},
            {"device": "/dev/sdb1", "mountpoint": "/data", "percent": 75.0}
        ],
        "network": [{"interface_name": "eth0", "bytes_sent": 100, "bytes_recv": 200}],
        "temperatures": [{"sensor_name": "cpu", "temperature": 51.5}]
    })
    .to_string()
}

/// Metric rows one `batch_json` batch produces
pub const ROWS_PER_BATCH: usize = 6;

/// Poll `check` until it holds or the wait times out
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
