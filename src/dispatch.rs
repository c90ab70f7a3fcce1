//! Command dispatcher
//!
//! A dispatch writes the ledger row first and publishes second, so every
//! message an agent can ever receive is backed by a durable `pending` row.
//! Only a confirmed publish moves the row to `sent`. A failed publish leaves
//! the row `pending` and reports the failure; retrying goes through
//! [`CommandDispatcher::redispatch`] with the same identifier instead of
//! creating another row.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::command::{CommandRecord, CommandState, CommandType, now_millis};
use crate::ledger::{CommandLedger, LedgerError};
use crate::storage::{StorageBackend, StorageError};
use crate::supervisor::SessionReceiver;
use crate::transport::TransportError;

#[derive(Debug)]
pub enum DispatchError {
    /// Bad request input, nothing was written
    Validation(String),

    /// Unknown agent or command
    NotFound(String),

    /// The broker is not reachable; the ledger row stays `pending`
    TransportUnavailable {
        command_id: Uuid,
        reason: TransportError,
    },

    /// Redispatch of a row that already left `pending`
    NotPending {
        command_id: Uuid,
        state: CommandState,
    },

    Store(StorageError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Validation(msg) => write!(f, "invalid command: {msg}"),
            DispatchError::NotFound(msg) => write!(f, "{msg}"),
            DispatchError::TransportUnavailable { command_id, reason } => write!(
                f,
                "command {command_id} recorded but not sent, broker unavailable: {reason}"
            ),
            DispatchError::NotPending { command_id, state } => {
                write!(f, "command {command_id} is {state}, only pending commands can be resent")
            }
            DispatchError::Store(err) => write!(f, "store error: {err}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::TransportUnavailable { reason, .. } => Some(reason),
            DispatchError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for DispatchError {
    fn from(err: StorageError) -> Self {
        DispatchError::Store(err)
    }
}

impl From<LedgerError> for DispatchError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownCommand(id) => DispatchError::NotFound(format!("no command with id {id}")),
            LedgerError::Store(err) => DispatchError::Store(err),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Clone)]
pub struct CommandDispatcher {
    store: Arc<dyn StorageBackend>,
    ledger: CommandLedger,
    sessions: SessionReceiver,
    command_queue: String,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        ledger: CommandLedger,
        sessions: SessionReceiver,
        command_queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ledger,
            sessions,
            command_queue: command_queue.into(),
        }
    }

    /// Record a command for `agent_id` and publish it.
    ///
    /// Returns the record in state `sent`. On `TransportUnavailable` the row
    /// exists in state `pending`.
    #[instrument(skip(self, payload))]
    pub async fn dispatch(
        &self,
        agent_id: &str,
        command_type: CommandType,
        payload: Value,
    ) -> DispatchResult<CommandRecord> {
        let command_data = command_type
            .normalize_payload(payload)
            .map_err(DispatchError::Validation)?;

        if agent_id.trim().is_empty() {
            return Err(DispatchError::Validation("agent id must not be empty".to_string()));
        }
        if !self.store.agent_exists(agent_id).await? {
            return Err(DispatchError::NotFound(format!("unknown agent: {agent_id}")));
        }

        let record = self
            .ledger
            .create(agent_id, command_type, command_data)
            .await?;

        self.publish_and_advance(record).await
    }

    /// Publish an existing `pending` row again, keeping its identifier
    #[instrument(skip(self))]
    pub async fn redispatch(&self, command_id: Uuid) -> DispatchResult<CommandRecord> {
        let record = self
            .ledger
            .get(command_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("no command with id {command_id}")))?;

        if record.state != CommandState::Pending {
            return Err(DispatchError::NotPending {
                command_id,
                state: record.state,
            });
        }

        self.publish_and_advance(record).await
    }

    async fn publish_and_advance(&self, record: CommandRecord) -> DispatchResult<CommandRecord> {
        let command_id = record.command_id;

        if let Err(reason) = self.publish(&record).await {
            warn!(
                "command {command_id} for {} left pending: {reason}",
                record.agent_id
            );
            return Err(DispatchError::TransportUnavailable { command_id, reason });
        }

        self.ledger.mark_sent(command_id).await?;
        info!(
            "sent {} command {command_id} to {}",
            record.command_type, record.agent_id
        );

        self.ledger
            .get(command_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("no command with id {command_id}")))
    }

    async fn publish(&self, record: &CommandRecord) -> Result<(), TransportError> {
        // no buffering while disconnected; the ledger row is the durable copy
        let session = self
            .sessions
            .borrow()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;

        let message = serde_json::to_vec(&record.to_message(now_millis()))
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        session.publish(&self.command_queue, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentBatch;
    use crate::command::CommandMessage;
    use crate::storage::memory::MemoryBackend;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::{Broker, BrokerSession};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::sync::watch;

    const QUEUE: &str = "agent_commands";

    struct Fixture {
        dispatcher: CommandDispatcher,
        ledger: CommandLedger,
        broker: MemoryBroker,
        slot: watch::Sender<Option<Arc<dyn BrokerSession>>>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryBackend::new());
        let batch = AgentBatch::decode(br#"{"agent_id": "A1", "timestamp": 1700000000}"#).unwrap();
        store.apply_agent_batch(&batch).await.unwrap();

        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session.declare_queue(QUEUE).await.unwrap();

        let (slot, sessions) = watch::channel(Some(session));
        let ledger = CommandLedger::new(store.clone());
        let dispatcher = CommandDispatcher::new(store, ledger.clone(), sessions, QUEUE);

        Fixture {
            dispatcher,
            ledger,
            broker,
            slot,
        }
    }

    #[tokio::test]
    async fn test_dispatch_publishes_and_marks_sent() {
        let fx = fixture().await;

        let record = fx
            .dispatcher
            .dispatch("A1", CommandType::UpdateAsn, json!({"force": true}))
            .await
            .unwrap();
        assert_eq!(record.state, CommandState::Sent);
        assert!(record.sent_at.is_some());

        let published = fx.broker.queue_snapshot(QUEUE).await;
        assert_eq!(published.len(), 1);
        let message: CommandMessage = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(message.agent_id, "A1");
        assert_eq!(message.command_type, CommandType::UpdateAsn);
        assert_eq!(message.command_data, json!({"force": true}));
        assert_eq!(message.command_id, record.command_id);
    }

    #[tokio::test]
    async fn test_missing_force_defaults_to_false() {
        let fx = fixture().await;

        let record = fx
            .dispatcher
            .dispatch("A1", CommandType::UpdateAsn, json!({}))
            .await
            .unwrap();
        assert_eq!(record.command_data, json!({"force": false}));
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_write() {
        let fx = fixture().await;

        assert_matches!(
            fx.dispatcher
                .dispatch("A1", CommandType::UpdateAsn, json!({"force": "yes"}))
                .await,
            Err(DispatchError::Validation(_))
        );
        assert_matches!(
            fx.dispatcher
                .dispatch("nobody", CommandType::UpdateAsn, json!({}))
                .await,
            Err(DispatchError::NotFound(_))
        );

        assert!(fx.ledger.list("A1", &Default::default()).await.unwrap().is_empty());
        assert!(fx.ledger.list("nobody", &Default::default()).await.unwrap().is_empty());
        assert!(fx.broker.queue_snapshot(QUEUE).await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_leaves_row_pending() {
        let fx = fixture().await;
        fx.slot.send_replace(None);

        let err = fx
            .dispatcher
            .dispatch("A1", CommandType::UpdateAsn, json!({"force": true}))
            .await
            .unwrap_err();
        let command_id = assert_matches!(
            err,
            DispatchError::TransportUnavailable { command_id, .. } => command_id
        );

        let stored = fx.ledger.get(command_id).await.unwrap().unwrap();
        assert_eq!(stored.state, CommandState::Pending);
        assert!(stored.sent_at.is_none());
        assert!(fx.broker.queue_snapshot(QUEUE).await.is_empty());
    }

    #[tokio::test]
    async fn test_nacked_publish_leaves_row_pending() {
        let fx = fixture().await;
        fx.broker.set_nack_publishes(true);

        let err = fx
            .dispatcher
            .dispatch("A1", CommandType::UpdateAsn, json!({}))
            .await
            .unwrap_err();
        let command_id = assert_matches!(
            err,
            DispatchError::TransportUnavailable { command_id, reason: TransportError::Nacked } => command_id
        );

        assert_eq!(
            fx.ledger.get(command_id).await.unwrap().unwrap().state,
            CommandState::Pending
        );
    }

    #[tokio::test]
    async fn test_redispatch_reuses_pending_row() {
        let fx = fixture().await;
        fx.slot.send_replace(None);

        let err = fx
            .dispatcher
            .dispatch("A1", CommandType::UpdateAsn, json!({"force": true}))
            .await
            .unwrap_err();
        let command_id = assert_matches!(
            err,
            DispatchError::TransportUnavailable { command_id, .. } => command_id
        );

        let session = fx.broker.connect().await.unwrap();
        fx.slot.send_replace(Some(session));

        let record = fx.dispatcher.redispatch(command_id).await.unwrap();
        assert_eq!(record.command_id, command_id);
        assert_eq!(record.state, CommandState::Sent);
        assert_eq!(fx.ledger.list("A1", &Default::default()).await.unwrap().len(), 1);

        assert_matches!(
            fx.dispatcher.redispatch(command_id).await,
            Err(DispatchError::NotPending {
                state: CommandState::Sent,
                ..
            })
        );
        assert_matches!(
            fx.dispatcher.redispatch(Uuid::new_v4()).await,
            Err(DispatchError::NotFound(_))
        );
    }
}
