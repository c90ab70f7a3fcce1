//! Row definitions for agents and metric history
//!
//! ## Layout
//!
//! - `agents`: one row per agent, upserted by every batch. `last_seen` only
//!   moves forward, so replaying an old batch never makes an agent look older.
//! - `cpu_metrics`, `memory_metrics`, `disk_metrics`, `network_metrics`,
//!   `temperature_metrics`: append-only history. Each table is keyed on
//!   `(agent_id, timestamp)` plus the device and mountpoint, interface or
//!   sensor where one batch carries several readings, which makes a replayed
//!   batch a no-op.
//! - `agent_commands`: the command ledger (see `crate::ledger`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentBatch, CpuSample, DiskSample, MemorySample, NetworkSample, TemperatureSample};

/// Default row cap for metric history queries
pub const DEFAULT_METRIC_LIMIT: usize = 1000;

/// Stored state of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub hostname: Option<String>,
    pub agent_version: Option<String>,
    pub os_info: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Last reported auxiliary service status
    pub services: Option<serde_json::Value>,
    /// Last reported addresses and ASN details
    pub network_info: Option<serde_json::Value>,
}

impl AgentRecord {
    /// Liveness is derived, never stored: an agent is alive while its last
    /// report is younger than `threshold`.
    pub fn is_alive(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_seen < threshold
    }

    /// Merge a batch into the existing row (or create it).
    ///
    /// Descriptive fields follow the newest batch; a batch older than the
    /// stored `last_seen` only widens `first_seen`.
    pub fn merge_batch(existing: Option<&AgentRecord>, batch: &AgentBatch) -> AgentRecord {
        let Some(existing) = existing else {
            return AgentRecord {
                agent_id: batch.agent_id.clone(),
                hostname: batch.hostname.clone(),
                agent_version: batch.agent_version.clone(),
                os_info: batch.os_info.clone(),
                first_seen: batch.timestamp,
                last_seen: batch.timestamp,
                services: batch.services.clone(),
                network_info: batch.network_info.clone(),
            };
        };

        let mut merged = existing.clone();
        merged.first_seen = existing.first_seen.min(batch.timestamp);

        if batch.timestamp >= existing.last_seen {
            merged.last_seen = batch.timestamp;
            if batch.hostname.is_some() {
                merged.hostname = batch.hostname.clone();
            }
            if batch.agent_version.is_some() {
                merged.agent_version = batch.agent_version.clone();
            }
            if batch.os_info.is_some() {
                merged.os_info = batch.os_info.clone();
            }
            if batch.services.is_some() {
                merged.services = batch.services.clone();
            }
            if batch.network_info.is_some() {
                merged.network_info = batch.network_info.clone();
            }
        }

        merged
    }
}

/// Metric families with their own history table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Temperature,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Disk,
        MetricKind::Network,
        MetricKind::Temperature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Disk => "disk",
            MetricKind::Network => "network",
            MetricKind::Temperature => "temperature",
        }
    }

    /// History table holding this family
    pub fn table_name(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu_metrics",
            MetricKind::Memory => "memory_metrics",
            MetricKind::Disk => "disk_metrics",
            MetricKind::Network => "network_metrics",
            MetricKind::Temperature => "temperature_metrics",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = MetricKind::ALL.iter().map(|k| k.as_str()).collect();
                format!(
                    "invalid metric type '{s}', valid values: {}",
                    valid.join(", ")
                )
            })
    }
}

/// One stored metric reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricRecord {
    Cpu {
        agent_id: String,
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        sample: CpuSample,
    },
    Memory {
        agent_id: String,
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        sample: MemorySample,
    },
    Disk {
        agent_id: String,
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        sample: DiskSample,
    },
    Network {
        agent_id: String,
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        sample: NetworkSample,
    },
    Temperature {
        agent_id: String,
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        sample: TemperatureSample,
    },
}

impl MetricRecord {
    /// Split a batch into the rows it appends, in table order
    pub fn rows_from_batch(batch: &AgentBatch) -> Vec<MetricRecord> {
        let agent_id = &batch.agent_id;
        let timestamp = batch.timestamp;
        let mut rows = Vec::with_capacity(batch.metric_row_count());

        if let Some(sample) = &batch.cpu {
            rows.push(MetricRecord::Cpu {
                agent_id: agent_id.clone(),
                timestamp,
                sample: sample.clone(),
            });
        }
        if let Some(sample) = &batch.memory {
            rows.push(MetricRecord::Memory {
                agent_id: agent_id.clone(),
                timestamp,
                sample: sample.clone(),
            });
        }
        rows.extend(batch.disks.iter().map(|sample| MetricRecord::Disk {
            agent_id: agent_id.clone(),
            timestamp,
            sample: sample.clone(),
        }));
        rows.extend(batch.network.iter().map(|sample| MetricRecord::Network {
            agent_id: agent_id.clone(),
            timestamp,
            sample: sample.clone(),
        }));
        rows.extend(
            batch
                .temperatures
                .iter()
                .map(|sample| MetricRecord::Temperature {
                    agent_id: agent_id.clone(),
                    timestamp,
                    sample: sample.clone(),
                }),
        );

        rows
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricRecord::Cpu { .. } => MetricKind::Cpu,
            MetricRecord::Memory { .. } => MetricKind::Memory,
            MetricRecord::Disk { .. } => MetricKind::Disk,
            MetricRecord::Network { .. } => MetricKind::Network,
            MetricRecord::Temperature { .. } => MetricKind::Temperature,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            MetricRecord::Cpu { agent_id, .. }
            | MetricRecord::Memory { agent_id, .. }
            | MetricRecord::Disk { agent_id, .. }
            | MetricRecord::Network { agent_id, .. }
            | MetricRecord::Temperature { agent_id, .. } => agent_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MetricRecord::Cpu { timestamp, .. }
            | MetricRecord::Memory { timestamp, .. }
            | MetricRecord::Disk { timestamp, .. }
            | MetricRecord::Network { timestamp, .. }
            | MetricRecord::Temperature { timestamp, .. } => *timestamp,
        }
    }

    /// The unique key the history tables enforce
    pub fn key(&self) -> (MetricKind, String, i64, String) {
        let discriminator = match self {
            MetricRecord::Cpu { .. } | MetricRecord::Memory { .. } => String::new(),
            MetricRecord::Disk { sample, .. } => format!(
                "{}@{}",
                sample.device,
                sample.mountpoint.as_deref().unwrap_or_default()
            ),
            MetricRecord::Network { sample, .. } => sample.interface_name.clone(),
            MetricRecord::Temperature { sample, .. } => sample.sensor_name.clone(),
        };

        (
            self.kind(),
            self.agent_id().to_string(),
            self.timestamp().timestamp_millis(),
            discriminator,
        )
    }
}

/// Parameters for a metric history query
#[derive(Debug, Clone)]
pub struct MetricQuery {
    pub agent_id: String,
    pub kind: MetricKind,

    /// Inclusive lower bound
    pub start: Option<DateTime<Utc>>,

    /// Inclusive upper bound
    pub end: Option<DateTime<Utc>>,

    pub limit: Option<usize>,
}

impl MetricQuery {
    pub fn new(agent_id: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            start: None,
            end: None,
            limit: None,
        }
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_METRIC_LIMIT)
    }

    pub fn matches(&self, record: &MetricRecord) -> bool {
        let ts = record.timestamp();
        record.kind() == self.kind
            && record.agent_id() == self.agent_id
            && self.start.is_none_or(|start| ts >= start)
            && self.end.is_none_or(|end| ts <= end)
    }
}

/// Most recent headline readings for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestMetrics {
    pub agent_id: String,
    pub hostname: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

/// Result of applying one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    /// Metric rows actually appended (replayed rows are skipped)
    pub metric_rows_appended: usize,
}
