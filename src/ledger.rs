//! Command ledger
//!
//! The durable record of every command ever dispatched. The ledger owns the
//! lifecycle rules: rows start `pending`, move to `sent` once the broker
//! confirmed the publish, and may end `acknowledged` or `failed`. Every
//! transition is a conditional update in the store, so a late or duplicate
//! request can never move a row backwards.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::command::{
    CommandFilter, CommandOutcome, CommandRecord, CommandType, StateTransition, now_millis,
};
use crate::storage::{StorageBackend, StorageError};

#[derive(Debug)]
pub enum LedgerError {
    UnknownCommand(Uuid),
    Store(StorageError),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::UnknownCommand(id) => write!(f, "no command with id {id}"),
            LedgerError::Store(err) => write!(f, "ledger store error: {err}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Store(err) => Some(err),
            LedgerError::UnknownCommand(_) => None,
        }
    }
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        LedgerError::Store(err)
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result of a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,

    /// The row was already at or past the requested state; nothing changed
    Unchanged,
}

#[derive(Clone)]
pub struct CommandLedger {
    store: Arc<dyn StorageBackend>,
}

impl CommandLedger {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self { store }
    }

    /// Persist a new `pending` command with a freshly assigned id
    #[instrument(skip(self, command_data))]
    pub async fn create(
        &self,
        agent_id: &str,
        command_type: CommandType,
        command_data: Value,
    ) -> LedgerResult<CommandRecord> {
        let record = CommandRecord::new_pending(agent_id.to_string(), command_type, command_data);
        self.store.insert_command(&record).await?;

        debug!("created command {} ({})", record.command_id, command_type);
        Ok(record)
    }

    pub async fn mark_sent(&self, command_id: Uuid) -> LedgerResult<TransitionOutcome> {
        self.transition(command_id, StateTransition::sent(now_millis()))
            .await
    }

    /// Record the agent-reported outcome. A row that is already terminal
    /// keeps its first outcome.
    pub async fn mark_terminal(
        &self,
        command_id: Uuid,
        outcome: CommandOutcome,
        result: Option<Value>,
    ) -> LedgerResult<TransitionOutcome> {
        self.transition(
            command_id,
            StateTransition::terminal(outcome, now_millis(), result),
        )
        .await
    }

    async fn transition(
        &self,
        command_id: Uuid,
        transition: StateTransition,
    ) -> LedgerResult<TransitionOutcome> {
        if self.store.transition_command(command_id, &transition).await? {
            trace!("command {command_id} is now {}", transition.target);
            return Ok(TransitionOutcome::Applied);
        }

        // nothing changed: either the row is unknown or already past the target
        match self.store.get_command(command_id).await? {
            Some(record) => {
                debug!(
                    "command {command_id} stays {} (requested {})",
                    record.state, transition.target
                );
                Ok(TransitionOutcome::Unchanged)
            }
            None => Err(LedgerError::UnknownCommand(command_id)),
        }
    }

    pub async fn get(&self, command_id: Uuid) -> LedgerResult<Option<CommandRecord>> {
        Ok(self.store.get_command(command_id).await?)
    }

    /// Commands for one agent, newest first
    pub async fn list(
        &self,
        agent_id: &str,
        filter: &CommandFilter,
    ) -> LedgerResult<Vec<CommandRecord>> {
        Ok(self.store.list_commands(agent_id, filter).await?)
    }

    /// Commands that have sat in `sent` since before `older_than`
    pub async fn find_stale(&self, older_than: DateTime<Utc>) -> LedgerResult<Vec<CommandRecord>> {
        Ok(self.store.list_sent_before(older_than).await?)
    }
}
