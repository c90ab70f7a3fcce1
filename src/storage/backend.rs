//! Storage backend trait definition
//!
//! This module defines the core `StorageBackend` trait that all
//! storage implementations must implement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::StorageResult;
use super::schema::{AgentRecord, BatchOutcome, LatestMetrics, MetricQuery, MetricRecord};
use crate::AgentBatch;
use crate::command::{CommandFilter, CommandRecord, StateTransition};

/// Health status of the storage backend
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// The store is a passive collaborator: it owns no workflow, it only
/// guarantees that each write is atomic. Implementations must be
/// `Send + Sync`; a single instance is shared process-wide behind an `Arc`.
///
/// ## Error Handling
///
/// Methods return `StorageResult<T>` which wraps `StorageError`.
/// Implementations should convert backend-specific errors to
/// `StorageError` variants.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Agents and telemetry
    // ========================================================================

    async fn agent_exists(&self, agent_id: &str) -> StorageResult<bool>;

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>>;

    /// All known agents, ordered by hostname
    async fn list_agents(&self) -> StorageResult<Vec<AgentRecord>>;

    /// Apply one decoded batch in a single transaction
    ///
    /// Upserts the agent row (see `AgentRecord::merge_batch` for the merge
    /// rules) and appends one row per reading. Either everything is written
    /// or nothing is. Replaying the same batch appends no new rows.
    async fn apply_agent_batch(&self, batch: &AgentBatch) -> StorageResult<BatchOutcome>;

    /// Metric history for one agent and family, newest first
    async fn query_metrics(&self, query: MetricQuery) -> StorageResult<Vec<MetricRecord>>;

    /// Latest cpu / memory readings, for one agent or all of them
    async fn latest_metrics(&self, agent_id: Option<&str>) -> StorageResult<Vec<LatestMetrics>>;

    // ========================================================================
    // Command ledger
    // ========================================================================

    async fn insert_command(&self, record: &CommandRecord) -> StorageResult<()>;

    async fn get_command(&self, command_id: Uuid) -> StorageResult<Option<CommandRecord>>;

    /// Conditionally move a command to `transition.target`
    ///
    /// The update only applies while the stored state is one of
    /// `transition.allowed_sources()`. Returns whether a row changed.
    async fn transition_command(
        &self,
        command_id: Uuid,
        transition: &StateTransition,
    ) -> StorageResult<bool>;

    /// Commands for one agent, newest first, filtered and truncated
    async fn list_commands(
        &self,
        agent_id: &str,
        filter: &CommandFilter,
    ) -> StorageResult<Vec<CommandRecord>>;

    /// Commands still in `sent` whose `sent_at` is older than `before`
    async fn list_sent_before(&self, before: DateTime<Utc>) -> StorageResult<Vec<CommandRecord>>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend
    /// is operational (e.g., ping database, check file access).
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
