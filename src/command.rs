//! Command model and lifecycle rules
//!
//! A command moves through `pending → sent → {acknowledged | failed}`.
//! Transitions never regress: once a command reaches a terminal state it
//! stays there, and `sent` is never re-entered from `pending` twice.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Command types understood by the agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Refresh the agent's public network identity (IP / ASN lookup)
    UpdateAsn,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::UpdateAsn => "update_asn",
        }
    }

    /// Validate and normalize a type-specific payload.
    ///
    /// `update_asn` takes `{force: bool}`; a missing or null `force` means
    /// `false`. Anything else is rejected before a ledger row exists.
    pub fn normalize_payload(&self, payload: Value) -> Result<Value, String> {
        match self {
            CommandType::UpdateAsn => {
                let fields = match payload {
                    Value::Null => serde_json::Map::new(),
                    Value::Object(fields) => fields,
                    other => {
                        return Err(format!("update_asn payload must be an object, got {other}"));
                    }
                };

                let force = match fields.get("force") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(force)) => *force,
                    Some(other) => {
                        return Err(format!("update_asn force must be a boolean, got {other}"));
                    }
                };

                Ok(json!({ "force": force }))
            }
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update_asn" => Ok(CommandType::UpdateAsn),
            other => Err(format!("unknown command type: {other}")),
        }
    }
}

/// Lifecycle state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Sent => "sent",
            CommandState::Acknowledged => "acknowledged",
            CommandState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Acknowledged | CommandState::Failed)
    }

    /// Position along the lifecycle; terminal states share the last rank
    pub fn rank(&self) -> u8 {
        match self {
            CommandState::Pending => 0,
            CommandState::Sent => 1,
            CommandState::Acknowledged | CommandState::Failed => 2,
        }
    }

    /// States from which `target` may be entered.
    ///
    /// The store applies transitions as conditional updates against this set,
    /// which keeps the rule atomic even with concurrent writers.
    pub fn sources_of(target: CommandState) -> &'static [CommandState] {
        match target {
            CommandState::Pending => &[],
            CommandState::Sent => &[CommandState::Pending],
            CommandState::Acknowledged | CommandState::Failed => {
                &[CommandState::Pending, CommandState::Sent]
            }
        }
    }

    pub fn can_transition_to(&self, target: CommandState) -> bool {
        CommandState::sources_of(target).contains(self)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandState::Pending),
            "sent" => Ok(CommandState::Sent),
            "acknowledged" => Ok(CommandState::Acknowledged),
            "failed" => Ok(CommandState::Failed),
            other => Err(format!("unknown command state: {other}")),
        }
    }
}

/// Terminal outcome reported for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Acknowledged,
    Failed,
}

impl From<CommandOutcome> for CommandState {
    fn from(outcome: CommandOutcome) -> Self {
        match outcome {
            CommandOutcome::Acknowledged => CommandState::Acknowledged,
            CommandOutcome::Failed => CommandState::Failed,
        }
    }
}

/// One row of the command ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: Uuid,
    pub agent_id: String,
    pub command_type: CommandType,
    pub command_data: Value,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Opaque agent-reported result, set only with a terminal state
    pub result: Option<Value>,
}

impl CommandRecord {
    /// A fresh `pending` record with a newly assigned identifier
    pub fn new_pending(agent_id: String, command_type: CommandType, command_data: Value) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            agent_id,
            command_type,
            command_data,
            state: CommandState::Pending,
            created_at: now_millis(),
            sent_at: None,
            acknowledged_at: None,
            result: None,
        }
    }

    /// Build the outbound queue message for this record
    pub fn to_message(&self, timestamp: DateTime<Utc>) -> CommandMessage {
        CommandMessage {
            agent_id: self.agent_id.clone(),
            command_type: self.command_type,
            command_data: self.command_data.clone(),
            command_id: self.command_id,
            timestamp,
        }
    }
}

/// Message published to the outbound command queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub agent_id: String,
    pub command_type: CommandType,
    pub command_data: Value,
    pub command_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Requested state change, applied atomically by the store
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub target: CommandState,
    pub at: DateTime<Utc>,
    pub result: Option<Value>,
}

impl StateTransition {
    pub fn sent(at: DateTime<Utc>) -> Self {
        Self {
            target: CommandState::Sent,
            at,
            result: None,
        }
    }

    pub fn terminal(outcome: CommandOutcome, at: DateTime<Utc>, result: Option<Value>) -> Self {
        Self {
            target: outcome.into(),
            at,
            result,
        }
    }

    pub fn allowed_sources(&self) -> &'static [CommandState] {
        CommandState::sources_of(self.target)
    }

    /// Apply to an in-memory record; returns false (record untouched) when
    /// the record's state is not a valid source.
    pub fn apply_to(&self, record: &mut CommandRecord) -> bool {
        if !record.state.can_transition_to(self.target) {
            return false;
        }

        record.state = self.target;
        match self.target {
            CommandState::Sent => record.sent_at = Some(self.at),
            CommandState::Acknowledged | CommandState::Failed => {
                record.acknowledged_at = Some(self.at);
                record.result = self.result.clone();
            }
            CommandState::Pending => {}
        }
        true
    }
}

/// Filter for ledger listings
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct CommandFilter {
    pub status: Option<CommandState>,
    pub limit: Option<usize>,
}

pub const DEFAULT_COMMAND_LIMIT: usize = 100;

/// Largest listing a caller can ask for
pub const MAX_COMMAND_LIMIT: usize = 1_000;

impl CommandFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_COMMAND_LIMIT)
            .min(MAX_COMMAND_LIMIT)
    }
}

/// Current time truncated to milliseconds, the precision every backend keeps
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
