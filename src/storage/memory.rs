//! In-memory storage backend (no persistence)
//!
//! Useful for:
//! - Testing without database dependencies
//! - Local runs with `STORE_BACKEND=memory`
//!
//! The backend honours the same atomicity and replay rules as the SQL
//! backends: a batch is applied under one write lock, metric rows are
//! deduplicated on their table key, and command transitions are conditional.
//! `set_available(false)` simulates an outage; every call then fails with
//! `StorageError::Unavailable` and nothing is written. `set_write_delay`
//! stretches every batch write, to observe a handler while it is in flight.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    AgentRecord, BatchOutcome, LatestMetrics, MetricKind, MetricQuery, MetricRecord,
};
use crate::AgentBatch;
use crate::command::{CommandFilter, CommandRecord, CommandState, StateTransition};

type MetricKey = (MetricKind, String, i64, String);

#[derive(Default)]
struct MemoryState {
    agents: HashMap<String, AgentRecord>,
    metrics: Vec<MetricRecord>,
    metric_keys: HashSet<MetricKey>,
    /// Insertion order doubles as the tie-breaker for equal `created_at`
    commands: Vec<CommandRecord>,
}

/// In-memory storage backend
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    available: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            available: AtomicBool::new(true),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// Toggle simulated availability
    pub fn set_available(&self, available: bool) {
        debug!("in-memory backend availability set to {available}");
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay applied before each batch write
    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Total metric rows stored, across all agents and families
    pub async fn metric_row_count(&self) -> usize {
        self.state.read().await.metrics.len()
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(
                "in-memory backend marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn latest_of<'a>(
    metrics: &'a [MetricRecord],
    agent_id: &str,
    kind: MetricKind,
) -> Option<&'a MetricRecord> {
    metrics
        .iter()
        .filter(|m| m.kind() == kind && m.agent_id() == agent_id)
        .max_by_key(|m| m.timestamp())
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn agent_exists(&self, agent_id: &str) -> StorageResult<bool> {
        self.ensure_available()?;
        Ok(self.state.read().await.agents.contains_key(agent_id))
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        self.ensure_available()?;
        Ok(self.state.read().await.agents.get(agent_id).cloned())
    }

    async fn list_agents(&self) -> StorageResult<Vec<AgentRecord>> {
        self.ensure_available()?;
        let mut agents: Vec<AgentRecord> =
            self.state.read().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| {
            a.hostname
                .cmp(&b.hostname)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        Ok(agents)
    }

    async fn apply_agent_batch(&self, batch: &AgentBatch) -> StorageResult<BatchOutcome> {
        self.ensure_available()?;

        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut state = self.state.write().await;
        let merged = AgentRecord::merge_batch(state.agents.get(&batch.agent_id), batch);
        state.agents.insert(batch.agent_id.clone(), merged);

        let mut appended = 0;
        for row in MetricRecord::rows_from_batch(batch) {
            if state.metric_keys.insert(row.key()) {
                state.metrics.push(row);
                appended += 1;
            }
        }

        debug!(
            "in-memory backend: applied batch for {} ({} rows appended)",
            batch.agent_id, appended
        );

        Ok(BatchOutcome {
            metric_rows_appended: appended,
        })
    }

    async fn query_metrics(&self, query: MetricQuery) -> StorageResult<Vec<MetricRecord>> {
        self.ensure_available()?;
        let state = self.state.read().await;

        let mut rows: Vec<MetricRecord> = state
            .metrics
            .iter()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        rows.sort_by_key(|m| std::cmp::Reverse(m.timestamp()));
        rows.truncate(query.effective_limit());

        Ok(rows)
    }

    async fn latest_metrics(&self, agent_id: Option<&str>) -> StorageResult<Vec<LatestMetrics>> {
        self.ensure_available()?;
        let state = self.state.read().await;

        let mut latest: Vec<LatestMetrics> = state
            .agents
            .values()
            .filter(|agent| agent_id.is_none_or(|id| id == agent.agent_id))
            .map(|agent| LatestMetrics {
                agent_id: agent.agent_id.clone(),
                hostname: agent.hostname.clone(),
                last_seen: agent.last_seen,
                cpu_percent: match latest_of(&state.metrics, &agent.agent_id, MetricKind::Cpu) {
                    Some(MetricRecord::Cpu { sample, .. }) => Some(sample.cpu_percent),
                    _ => None,
                },
                memory_percent: match latest_of(
                    &state.metrics,
                    &agent.agent_id,
                    MetricKind::Memory,
                ) {
                    Some(MetricRecord::Memory { sample, .. }) => Some(sample.percent),
                    _ => None,
                },
            })
            .collect();
        latest.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        Ok(latest)
    }

    async fn insert_command(&self, record: &CommandRecord) -> StorageResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;

        if state
            .commands
            .iter()
            .any(|c| c.command_id == record.command_id)
        {
            return Err(StorageError::QueryFailed(format!(
                "duplicate command id {}",
                record.command_id
            )));
        }

        state.commands.push(record.clone());
        Ok(())
    }

    async fn get_command(&self, command_id: Uuid) -> StorageResult<Option<CommandRecord>> {
        self.ensure_available()?;
        Ok(self
            .state
            .read()
            .await
            .commands
            .iter()
            .find(|c| c.command_id == command_id)
            .cloned())
    }

    async fn transition_command(
        &self,
        command_id: Uuid,
        transition: &StateTransition,
    ) -> StorageResult<bool> {
        self.ensure_available()?;
        let mut state = self.state.write().await;

        Ok(state
            .commands
            .iter_mut()
            .find(|c| c.command_id == command_id)
            .is_some_and(|record| transition.apply_to(record)))
    }

    async fn list_commands(
        &self,
        agent_id: &str,
        filter: &CommandFilter,
    ) -> StorageResult<Vec<CommandRecord>> {
        self.ensure_available()?;
        let state = self.state.read().await;

        // iterate newest insertion first so equal timestamps keep that order
        let mut rows: Vec<CommandRecord> = state
            .commands
            .iter()
            .rev()
            .filter(|c| c.agent_id == agent_id)
            .filter(|c| filter.status.is_none_or(|status| c.state == status))
            .cloned()
            .collect();
        rows.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        rows.truncate(filter.effective_limit());

        Ok(rows)
    }

    async fn list_sent_before(&self, before: DateTime<Utc>) -> StorageResult<Vec<CommandRecord>> {
        self.ensure_available()?;
        let state = self.state.read().await;

        Ok(state
            .commands
            .iter()
            .filter(|c| c.state == CommandState::Sent)
            .filter(|c| c.sent_at.is_some_and(|sent_at| sent_at < before))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let healthy = self.available.load(Ordering::SeqCst);
        let state = self.state.read().await;

        Ok(HealthStatus {
            healthy,
            message: if healthy {
                "In-memory storage operational".to_string()
            } else {
                "In-memory storage unavailable".to_string()
            },
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("agents".to_string(), state.agents.len().to_string()),
                ("metrics".to_string(), state.metrics.len().to_string()),
                ("commands".to_string(), state.commands.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
