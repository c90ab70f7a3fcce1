//! PostgreSQL storage backend implementation
//!
//! The production backend. Timestamps are `TIMESTAMPTZ`, JSON values are
//! `JSONB`, command ids are native `UUID`. Schema lives in
//! `migrations/postgres` and is applied on connect.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    AgentRecord, BatchOutcome, LatestMetrics, MetricKind, MetricQuery, MetricRecord,
};
use crate::command::{CommandFilter, CommandRecord, CommandState, StateTransition};
use crate::config::{PoolConfig, PostgresSettings};
use crate::{AgentBatch, CpuSample, DiskSample, MemorySample, NetworkSample, TemperatureSample};

/// PostgreSQL storage backend
pub struct PostgresBackend {
    pool: PgPool,
    target: String,
}

impl PostgresBackend {
    /// Connect, size the pool and run migrations
    #[instrument(skip_all, fields(host = %settings.host, database = %settings.database))]
    pub async fn connect(settings: &PostgresSettings, pool: &PoolConfig) -> StorageResult<Self> {
        let target = format!("{}:{}/{}", settings.host, settings.port, settings.database);
        info!("connecting to PostgreSQL at {}", target);

        let pool = PgPoolOptions::new()
            .max_connections(pool.max_connections)
            .idle_timeout(Some(Duration::from_millis(pool.idle_timeout_ms)))
            .acquire_timeout(Duration::from_millis(pool.connect_timeout_ms))
            .connect_with(Self::connect_options(settings))
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations/postgres").run(&pool).await?;
        info!("postgres pool connected");

        Ok(Self { pool, target })
    }

    pub fn connect_options(settings: &PostgresSettings) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.database)
    }

    fn agent_from_row(row: &PgRow) -> StorageResult<AgentRecord> {
        Ok(AgentRecord {
            agent_id: row.try_get("agent_id")?,
            hostname: row.try_get("hostname")?,
            agent_version: row.try_get("agent_version")?,
            os_info: row.try_get("os_info")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
            services: row.try_get("services")?,
            network_info: row.try_get("network_info")?,
        })
    }

    fn command_from_row(row: &PgRow) -> StorageResult<CommandRecord> {
        let command_type: String = row.try_get("command_type")?;
        let status: String = row.try_get("status")?;

        Ok(CommandRecord {
            command_id: row.try_get("command_id")?,
            agent_id: row.try_get("agent_id")?,
            command_type: command_type
                .parse()
                .map_err(StorageError::SerializationError)?,
            command_data: row.try_get("command_data")?,
            state: status.parse().map_err(StorageError::SerializationError)?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
            acknowledged_at: row.try_get("acknowledged_at")?,
            result: row.try_get("result")?,
        })
    }

    fn metric_from_row(kind: MetricKind, row: &PgRow) -> StorageResult<MetricRecord> {
        let agent_id: String = row.try_get("agent_id")?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp")?;

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

    async fn insert_metric(conn: &mut PgConnection, row: &MetricRecord) -> StorageResult<u64> {
        let agent_id = row.agent_id();
        let ts = row.timestamp();

        let query = match row {
            MetricRecord::Cpu { sample, .. } => sqlx::query(
                "INSERT INTO cpu_metrics (agent_id, timestamp, cpu_percent, load_avg_1min, load_avg_5min, load_avg_15min)
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
            )
            .bind(agent_id)
            .bind(ts)
            .bind(sample.cpu_percent)
            .bind(sample.load_avg_1min)
            .bind(sample.load_avg_5min)
            .bind(sample.load_avg_15min),
            MetricRecord::Memory { sample, .. } => sqlx::query(
                "INSERT INTO memory_metrics (agent_id, timestamp, percent, used_gb, total_gb, free_gb)
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
            )
            .bind(agent_id)
            .bind(ts)
            .bind(sample.percent)
            .bind(sample.used_gb)
            .bind(sample.total_gb)
            .bind(sample.free_gb),
            MetricRecord::Disk { sample, .. } => sqlx::query(
                "INSERT INTO disk_metrics (agent_id, timestamp, device, mountpoint, percent, used_gb, total_gb, free_gb)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT DO NOTHING",
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
                 VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT DO NOTHING",
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
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
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
impl StorageBackend for PostgresBackend {
    async fn agent_exists(&self, agent_id: &str) -> StorageResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM agents WHERE agent_id = $1)")
                .bind(agent_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        sqlx::query("SELECT * FROM agents WHERE agent_id = $1")
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
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO agents (agent_id, hostname, agent_version, os_info, first_seen, last_seen, services, network_info)
            VALUES ($1, $2, $3, $4, $5, $5, $6, $7)
            ON CONFLICT (agent_id) DO UPDATE SET
                hostname = CASE WHEN EXCLUDED.last_seen >= agents.last_seen
                    THEN COALESCE(EXCLUDED.hostname, agents.hostname) ELSE agents.hostname END,
                agent_version = CASE WHEN EXCLUDED.last_seen >= agents.last_seen
                    THEN COALESCE(EXCLUDED.agent_version, agents.agent_version) ELSE agents.agent_version END,
                os_info = CASE WHEN EXCLUDED.last_seen >= agents.last_seen
                    THEN COALESCE(EXCLUDED.os_info, agents.os_info) ELSE agents.os_info END,
                services = CASE WHEN EXCLUDED.last_seen >= agents.last_seen
                    THEN COALESCE(EXCLUDED.services, agents.services) ELSE agents.services END,
                network_info = CASE WHEN EXCLUDED.last_seen >= agents.last_seen
                    THEN COALESCE(EXCLUDED.network_info, agents.network_info) ELSE agents.network_info END,
                first_seen = LEAST(agents.first_seen, EXCLUDED.first_seen),
                last_seen = GREATEST(agents.last_seen, EXCLUDED.last_seen)
            "#,
        )
        .bind(&batch.agent_id)
        .bind(&batch.hostname)
        .bind(&batch.agent_version)
        .bind(&batch.os_info)
        .bind(batch.timestamp)
        .bind(&batch.services)
        .bind(&batch.network_info)
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
            "SELECT * FROM {} WHERE agent_id = $1
                AND ($2::timestamptz IS NULL OR timestamp >= $2)
                AND ($3::timestamptz IS NULL OR timestamp <= $3)
             ORDER BY timestamp DESC LIMIT $4",
            query.kind.table_name()
        );

        let rows = sqlx::query(&sql)
            .bind(&query.agent_id)
            .bind(query.start)
            .bind(query.end)
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
            WHERE $1::text IS NULL OR a.agent_id = $1
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
                    last_seen: row.try_get("last_seen")?,
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.command_id)
        .bind(&record.agent_id)
        .bind(record.command_type.as_str())
        .bind(&record.command_data)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.sent_at)
        .bind(record.acknowledged_at)
        .bind(&record.result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_command(&self, command_id: Uuid) -> StorageResult<Option<CommandRecord>> {
        sqlx::query("SELECT * FROM agent_commands WHERE command_id = $1")
            .bind(command_id)
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
        let sources: Vec<String> = transition
            .allowed_sources()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        if sources.is_empty() {
            return Ok(false);
        }

        let (sent_at, acknowledged_at) = match transition.target {
            CommandState::Sent => (Some(transition.at), None),
            _ => (None, Some(transition.at)),
        };

        let result = sqlx::query(
            r#"
            UPDATE agent_commands SET
                status = $1,
                sent_at = COALESCE($2, sent_at),
                acknowledged_at = COALESCE($3, acknowledged_at),
                result = COALESCE($4, result)
            WHERE command_id = $5 AND status = ANY($6)
            "#,
        )
        .bind(transition.target.as_str())
        .bind(sent_at)
        .bind(acknowledged_at)
        .bind(&transition.result)
        .bind(command_id)
        .bind(&sources)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
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
            WHERE agent_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, seq DESC
            LIMIT $3
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
            "SELECT * FROM agent_commands WHERE status = $1 AND sent_at < $2 ORDER BY sent_at ASC",
        )
        .bind(CommandState::Sent.as_str())
        .bind(before)
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
                message: "PostgreSQL backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "postgres".to_string()),
                    ("target".to_string(), self.target.clone()),
                    ("pool_size".to_string(), self.pool.size().to_string()),
                    ("pool_idle".to_string(), self.pool.num_idle().to_string()),
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
        info!("closing PostgreSQL pool");
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_from_settings() {
        let settings = PostgresSettings {
            host: "db.internal".to_string(),
            port: 5433,
            user: "fleet".to_string(),
            password: "secret".to_string(),
            database: "fleet".to_string(),
        };

        let options = PostgresBackend::connect_options(&settings);

        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "fleet");
        assert_eq!(options.get_database(), Some("fleet"));
    }
}
