//! API shared state

use std::sync::Arc;

use crate::dispatch::CommandDispatcher;
use crate::ingest::IngestStats;
use crate::ledger::CommandLedger;
use crate::storage::StorageBackend;
use crate::supervisor::SupervisorHandle;
use crate::watchdog::WatchdogHandle;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn StorageBackend>,

    pub ledger: CommandLedger,

    pub dispatcher: CommandDispatcher,

    /// Broker connection state, reported by `/api/status`
    pub supervisor: SupervisorHandle,

    pub ingest: Arc<IngestStats>,

    pub watchdog: Option<WatchdogHandle>,

    /// Agents reporting within this window are listed as alive
    pub agent_liveness: chrono::Duration,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        ledger: CommandLedger,
        dispatcher: CommandDispatcher,
        supervisor: SupervisorHandle,
        ingest: Arc<IngestStats>,
        agent_liveness: chrono::Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            dispatcher,
            supervisor,
            ingest,
            watchdog: None,
            agent_liveness,
        }
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogHandle) -> Self {
        self.watchdog = Some(watchdog);
        self
    }
}
