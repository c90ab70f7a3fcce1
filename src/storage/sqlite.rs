//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `StorageBackend` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Migrations**: Automatic schema versioning with sqlx (`migrations/sqlite`)
//!
//! Timestamps are stored as UNIX milliseconds and JSON values as text.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    AgentRecord, BatchOutcome, LatestMetrics, MetricKind, MetricQuery, MetricRecord,
};
use crate::command::{CommandFilter, CommandRecord, CommandState, StateTransition};
use crate::{AgentBatch, CpuSample, DiskSample, MemorySample, NetworkSample, TemperatureSample};

/// SQLite storage backend
///
/// Suited to single-node deployments and tests; production fleets run on
/// PostgreSQL.
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for WAL journaling
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use fleet_monitor::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./fleet.db", 5).await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>, max_connections: u32) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            StorageError::SerializationError(format!("timestamp out of range: {millis}"))
        })
    }

    fn optional_timestamp(millis: Option<i64>) -> StorageResult<Option<DateTime<Utc>>> {
        millis.map(Self::millis_to_timestamp).transpose()
    }

    fn optional_json(text: Option<String>) -> StorageResult<Option<serde_json::Value>> {
        Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
    }

    fn agent_from_row(row: &SqliteRow) -> StorageResult<AgentRecord> {
        Ok(AgentRecord {
            agent_id: row.try_get("agent_id")?,
            hostname: row.try_get("hostname")?,
            agent_version: row.try_get("agent_version")?,
            os_info: row.try_get("os_info")?,
            first_seen: Self::millis_to_timestamp(row.try_get("first_seen")?)?,
            last_seen: Self::millis_to_timestamp(row.try_get("last_seen")?)?,
            services: Self::optional_json(row.try_get("services")?)?,
            network_info: Self::optional_json(row.try_get("network_info")?)?,
        })
    }

    fn command_from_row(row: &SqliteRow) -> StorageResult<CommandRecord> {
        let command_id: String = row.try_get("command_id")?;
        let command_type: String = row.try_get("command_type")?;
        let status: String = row.try_get("status")?;
        let command_data: String = row.try_get("command_data")?;

        Ok(CommandRecord {
            command_id: Uuid::parse_str(&command_id)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?,
            agent_id: row.try_get("agent_id")?,
            command_type: command_type
                .parse()
                .map_err(StorageError::SerializationError)?,
            command_data: serde_json::from_str(&command_data)?,
            state: status.parse().map_err(StorageError::SerializationError)?,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?)?,
            sent_at: Self::optional_timestamp(row.try_get("sent_at")?)?,
            acknowledged_at: Self::optional_timestamp(row.try_get("acknowledged_at")?)?,
            result: Self::optional_json(row.try_get("result")?)?,
        })
    }

    fn metric_from_row(kind: MetricKind, row: &SqliteRow) -> StorageResult<MetricRecord> {
        let agent_id: String = row.try_get("agent_id")?;
        let timestamp = Self::millis_to_timestamp(row.try_get("timestamp")?)?;

        let record = match kind {
            MetricKind::Cpu => MetricRecord::Cpu {
                agent_id,
                timestamp,
                sample: CpuSample {
                    cpu_percent: row.try_get("cpu_percent")?,
                    load_avg_1min: row.try_get("load_avg_1min")?,
                    load_avg_5min: row.try_get("load_avg_5min")?,
                    load_avg_15min: row.try_get("load_avg_15min")?,
                },
            },
            MetricKind::Memory => MetricRecord::Memory {
                agent_id,
                timestamp,
                sample: MemorySample {
                    percent: row.try_get("percent")?,
                    used_gb: row.try_get("used_gb")?,
                    total_gb: row.try_get("total_gb")?,
                    free_gb: row.try_get("free_gb")?,
                },
            },
            MetricKind::Disk => MetricRecord::Disk {
                agent_id,
                timestamp,
                sample: DiskSample {
                    device: row.try_get("device")?,
                    mountpoint: Some(row.try_get::<String, _>("mountpoint")?)
                        .filter(|m| !m.is_empty()),
                    percent: row.try_get("percent")?,
                    used_gb: row.try_get("used_gb")?,
                    total_gb: row.try_get("total_gb")?,
                    free_gb: row.try_get("free_gb")?,
                },
            },
            MetricKind::Network => MetricRecord::Network {
                agent_id,
                timestamp,
                sample: NetworkSample {
                    interface_name: row.try_get("interface_name")?,
                    bytes_sent: counter(row.try_get("bytes_sent")?),
                    bytes_recv: counter(row.try_get("bytes_recv")?),
                    packets_sent: counter(row.try_get("packets_sent")?),
                    packets_recv: counter(row.try_get("packets_recv")?),
                },
            },
            MetricKind::Temperature => MetricRecord::Temperature {
                agent_id,
                timestamp,
                sample: TemperatureSample {
                    sensor_name: row.try_get("sensor_name")?,
                    temperature: row.try_get("temperature")?,
                },
            },
        };

        Ok(record)
    }

    /// Insert one metric row, skipping it if the key already exists
    async fn insert_metric(conn: &mut SqliteConnection, row: &MetricRecord) -> StorageResult<u64> {
        let agent_id = row.agent_id();
        let ts = row.timestamp().timestamp_millis();

        let query = match row {
            MetricRecord::Cpu { sample, .. } => sqlx::query(
                "INSERT INTO cpu_metrics (agent_id, timestamp, cpu_percent, load_avg_1min, load_avg_5min, load_avg_15min)
                 VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(agent_id)
            .bind(ts)
            .bind(sample.cpu_percent)
            .bind(sample.load_avg_1min)
            .bind(sample.load_avg_5min)
            .bind(sample.load_avg_15min),
            MetricRecord::Memory { sample, .. } => sqlx::query(
                "INSERT INTO memory_metrics (agent_id, timestamp, percent, used_gb, total_gb, free_gb)
                 VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(agent_id)
            .bind(ts)
            .bind(sample.percent)
            .bind(sample.used_gb)
            .bind(sample.total_gb)
            .bind(sample.free_gb),
            MetricRecord::Disk { sample, .. } => sqlx::query(
                "INSERT INTO disk_metrics (agent_id, timestamp, device, mountpoint, percent, used_gb, total_gb, free_gb)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(agent_id)
            .bind(ts)
            .bind(&sample.device)
            .bind(sample.mountpoint.as_deref().unwrap_or(""))
            .bind(sample.percent)
            .bind(sample.used_gb)
            .bind(sample.total_gb)
            .bind(sample.free_gb),
            MetricRecord::Network { sample, .. } => sqlx::query(
                "INSERT INTO network_metrics (agent_id, timestamp, interface_name, bytes_sent, bytes_recv, packets_sent, packets_recv)
                 VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(agent_id)
            .bind(ts)
            .bind(&sample.interface_name)
            .bind(to_i64(sample.bytes_sent))
            .bind(to_i64(sample.bytes_recv))
            .bind(to_i64(sample.packets_sent))
            .bind(to_i64(sample.packets_recv)),
            MetricRecord::Temperature { sample, .. } => sqlx::query(
                "INSERT INTO temperature_metrics (agent_id, timestamp, sensor_name, temperature)
                 VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(agent_id)
            .bind(ts)
            .bind(&sample.sensor_name)
            .bind(sample.temperature),
        };

        Ok(query.execute(&mut *conn).await?.rows_affected())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn counter(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn agent_exists(&self, agent_id: &str) -> StorageResult<bool> {
        let row = sqlx::query("SELECT 1 FROM agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        sqlx::query("SELECT * FROM agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::agent_from_row)
            .transpose()
    }

    async fn list_agents(&self) -> StorageResult<Vec<AgentRecord>> {
        sqlx::query("SELECT * FROM agents ORDER BY hostname NULLS FIRST, agent_id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::agent_from_row)
            .collect()
    }

    #[instrument(skip(self, batch), fields(agent_id = %batch.agent_id, rows = batch.metric_row_count()))]
    async fn apply_agent_batch(&self, batch: &AgentBatch) -> StorageResult<BatchOutcome> {
        let ts = batch.timestamp.timestamp_millis();
        let services = batch
            .services
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let network_info = batch
            .network_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO agents (agent_id, hostname, agent_version, os_info, first_seen, last_seen, services, network_info)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (agent_id) DO UPDATE SET
                hostname = CASE WHEN excluded.last_seen >= agents.last_seen
                    THEN COALESCE(excluded.hostname, agents.hostname) ELSE agents.hostname END,
                agent_version = CASE WHEN excluded.last_seen >= agents.last_seen
                    THEN COALESCE(excluded.agent_version, agents.agent_version) ELSE agents.agent_version END,
                os_info = CASE WHEN excluded.last_seen >= agents.last_seen
                    THEN COALESCE(excluded.os_info, agents.os_info) ELSE agents.os_info END,
                services = CASE WHEN excluded.last_seen >= agents.last_seen
                    THEN COALESCE(excluded.services, agents.services) ELSE agents.services END,
                network_info = CASE WHEN excluded.last_seen >= agents.last_seen
                    THEN COALESCE(excluded.network_info, agents.network_info) ELSE agents.network_info END,
                first_seen = MIN(agents.first_seen, excluded.first_seen),
                last_seen = MAX(agents.last_seen, excluded.last_seen)
            "#,
        )
        .bind(&batch.agent_id)
        .bind(&batch.hostname)
        .bind(&batch.agent_version)
        .bind(&batch.os_info)
        .bind(ts)
        .bind(ts)
        .bind(services)
        .bind(network_info)
        .execute(&mut *tx)
        .await?;

        let mut appended = 0;
        for row in MetricRecord::rows_from_batch(batch) {
            appended += Self::insert_metric(&mut *tx, &row).await?;
        }

        tx.commit().await?;

        debug!("batch committed ({} metric rows appended)", appended);
        Ok(BatchOutcome {
            metric_rows_appended: appended as usize,
        })
    }

    #[instrument(skip(self), fields(agent_id = %query.agent_id, kind = %query.kind))]
    async fn query_metrics(&self, query: MetricQuery) -> StorageResult<Vec<MetricRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE agent_id = ? AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp DESC LIMIT ?",
            query.kind.table_name()
        );

        let rows = sqlx::query(&sql)
            .bind(&query.agent_id)
            .bind(query.start.map_or(i64::MIN, |t| t.timestamp_millis()))
            .bind(query.end.map_or(i64::MAX, |t| t.timestamp_millis()))
            .bind(to_i64(query.effective_limit() as u64))
            .fetch_all(&self.pool)
            .await?;

        let results = rows
            .iter()
            .map(|row| Self::metric_from_row(query.kind, row))
            .collect::<StorageResult<Vec<_>>>()?;

        debug!("query returned {} rows", results.len());
        Ok(results)
    }

    async fn latest_metrics(&self, agent_id: Option<&str>) -> StorageResult<Vec<LatestMetrics>> {
        let rows = sqlx::query(
            r#"
            SELECT a.agent_id, a.hostname, a.last_seen,
                (SELECT c.cpu_percent FROM cpu_metrics c
                    WHERE c.agent_id = a.agent_id ORDER BY c.timestamp DESC LIMIT 1) AS cpu_percent,
                (SELECT m.percent FROM memory_metrics m
                    WHERE m.agent_id = a.agent_id ORDER BY m.timestamp DESC LIMIT 1) AS memory_percent
            FROM agents a
            WHERE ?1 IS NULL OR a.agent_id = ?1
            ORDER BY a.hostname NULLS FIRST, a.agent_id
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<LatestMetrics> {
                Ok(LatestMetrics {
                    agent_id: row.try_get("agent_id")?,
                    hostname: row.try_get("hostname")?,
                    last_seen: Self::millis_to_timestamp(row.try_get("last_seen")?)?,
                    cpu_percent: row.try_get("cpu_percent")?,
                    memory_percent: row.try_get("memory_percent")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, record), fields(command_id = %record.command_id))]
    async fn insert_command(&self, record: &CommandRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_commands (
                command_id, agent_id, command_type, command_data, status,
                created_at, sent_at, acknowledged_at, result
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.command_id.to_string())
        .bind(&record.agent_id)
        .bind(record.command_type.as_str())
        .bind(serde_json::to_string(&record.command_data)?)
        .bind(record.state.as_str())
        .bind(record.created_at.timestamp_millis())
        .bind(record.sent_at.map(|t| t.timestamp_millis()))
        .bind(record.acknowledged_at.map(|t| t.timestamp_millis()))
        .bind(record.result.as_ref().map(serde_json::to_string).transpose()?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_command(&self, command_id: Uuid) -> StorageResult<Option<CommandRecord>> {
        sqlx::query("SELECT * FROM agent_commands WHERE command_id = ?")
            .bind(command_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::command_from_row)
            .transpose()
    }

    #[instrument(skip(self, transition), fields(target = %transition.target))]
    async fn transition_command(
        &self,
        command_id: Uuid,
        transition: &StateTransition,
    ) -> StorageResult<bool> {
        let sources = transition.allowed_sources();
        if sources.is_empty() {
            return Ok(false);
        }

        let at = transition.at.timestamp_millis();
        let (sent_at, acknowledged_at) = match transition.target {
            CommandState::Sent => (Some(at), None),
            _ => (None, Some(at)),
        };
        let result = transition
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let placeholders = vec!["?"; sources.len()].join(", ");
        let sql = format!(
            "UPDATE agent_commands SET
                status = ?,
                sent_at = COALESCE(?, sent_at),
                acknowledged_at = COALESCE(?, acknowledged_at),
                result = COALESCE(?, result)
             WHERE command_id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(transition.target.as_str())
            .bind(sent_at)
            .bind(acknowledged_at)
            .bind(result)
            .bind(command_id.to_string());
        for source in sources {
            query = query.bind(source.as_str());
        }

        let changed = query.execute(&self.pool).await?.rows_affected() > 0;
        debug!("transition applied: {}", changed);
        Ok(changed)
    }

    async fn list_commands(
        &self,
        agent_id: &str,
        filter: &CommandFilter,
    ) -> StorageResult<Vec<CommandRecord>> {
        sqlx::query(
            r#"
            SELECT * FROM agent_commands
            WHERE agent_id = ?1 AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, seq DESC
            LIMIT ?3
            "#,
        )
        .bind(agent_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(to_i64(filter.effective_limit() as u64))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::command_from_row)
        .collect()
    }

    async fn list_sent_before(&self, before: DateTime<Utc>) -> StorageResult<Vec<CommandRecord>> {
        sqlx::query(
            "SELECT * FROM agent_commands WHERE status = ? AND sent_at < ? ORDER BY sent_at ASC",
        )
        .bind(CommandState::Sent.as_str())
        .bind(before.timestamp_millis())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::command_from_row)
        .collect()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
