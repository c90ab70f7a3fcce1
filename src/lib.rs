#[cfg(feature = "api")]
pub mod api;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod ingest;
pub mod ledger;
pub mod storage;
pub mod supervisor;
pub mod transport;
pub mod util;
pub mod watchdog;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One telemetry report from an agent, as decoded from the inbound queue.
///
/// Every section is optional; an agent only reports what it collects. The
/// batch is immutable once decoded and is written to the store as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBatch {
    pub agent_id: String,
    pub hostname: Option<String>,
    pub agent_version: Option<String>,
    pub os_info: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub cpu: Option<CpuSample>,
    pub memory: Option<MemorySample>,
    pub disks: Vec<DiskSample>,
    pub network: Vec<NetworkSample>,
    pub temperatures: Vec<TemperatureSample>,
    /// Free-form auxiliary service status (e.g. dynamic DNS client, port checks)
    pub services: Option<serde_json::Value>,
    /// Public / private address and ASN details, kept on the agent row
    pub network_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    pub cpu_percent: f64,
    pub load_avg_1min: Option<f64>,
    pub load_avg_5min: Option<f64>,
    pub load_avg_15min: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub percent: f64,
    pub used_gb: Option<f64>,
    pub total_gb: Option<f64>,
    pub free_gb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSample {
    pub device: String,
    pub mountpoint: Option<String>,
    pub percent: f64,
    pub used_gb: Option<f64>,
    pub total_gb: Option<f64>,
    pub free_gb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    pub interface_name: String,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_recv: u64,
    #[serde(default)]
    pub packets_sent: u64,
    #[serde(default)]
    pub packets_recv: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    pub sensor_name: String,
    pub temperature: f64,
}

/// Errors produced while decoding an inbound message. A message that fails
/// to decode can never succeed, so it is rejected without requeue.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload is not JSON or does not have the batch shape
    InvalidJson(String),

    /// Neither `agent_id` nor `hostname` was present
    MissingAgentId,

    MissingTimestamp,

    InvalidTimestamp(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidJson(msg) => write!(f, "invalid batch payload: {msg}"),
            DecodeError::MissingAgentId => write!(f, "batch carries no agent_id or hostname"),
            DecodeError::MissingTimestamp => write!(f, "batch carries no timestamp"),
            DecodeError::InvalidTimestamp(raw) => write!(f, "invalid batch timestamp: {raw}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Wire shape of a batch. Agents send either RFC 3339 strings or UNIX
/// seconds for the timestamp, and identify themselves by id or hostname.
///
/// Three layouts are accepted: flat sections (`cpu_percent`, `disks`, ...),
/// the Linux agent's `cpu_usage` / `memory_usage` with `network` carrying
/// address details, and the Windows agent's nested `metrics` object with
/// `network_info`. Flat fields win when more than one is present.
#[derive(Debug, Deserialize)]
struct RawBatch {
    agent_id: Option<String>,
    hostname: Option<String>,
    agent_version: Option<String>,
    os_info: Option<String>,
    timestamp: Option<RawTimestamp>,
    cpu_percent: Option<f64>,
    cpu_usage: Option<f64>,
    load_avg_1min: Option<f64>,
    load_avg_5min: Option<f64>,
    load_avg_15min: Option<f64>,
    memory: Option<MemorySample>,
    memory_usage: Option<MemorySample>,
    #[serde(default)]
    disks: Vec<DiskSample>,
    network: Option<RawNetwork>,
    network_info: Option<Map<String, Value>>,
    #[serde(default)]
    temperatures: Vec<TemperatureSample>,
    services: Option<Value>,
    metrics: Option<RawMetrics>,
}

/// `network` is a list of interface counters, or an object of address details
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNetwork {
    Interfaces(Vec<NetworkSample>),
    Info(Map<String, Value>),
}

#[derive(Debug, Default, Deserialize)]
struct RawMetrics {
    cpu: Option<RawCpu>,
    memory: Option<MemorySample>,
    disk: Option<RawDisk>,
    network: Option<RawNetworkUsage>,
    temperature: Option<RawTemperature>,
    processes: Option<Value>,
    noip_duc: Option<Value>,
    port_check: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawCpu {
    percent: f64,
    load_avg: Option<RawLoadAvg>,
}

#[derive(Debug, Deserialize)]
struct RawLoadAvg {
    #[serde(rename = "1min")]
    one: Option<f64>,
    #[serde(rename = "5min")]
    five: Option<f64>,
    #[serde(rename = "15min")]
    fifteen: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawDisk {
    #[serde(default)]
    partitions: Vec<DiskSample>,
}

#[derive(Debug, Deserialize)]
struct RawNetworkUsage {
    #[serde(default)]
    io_counters: BTreeMap<String, RawCounters>,
}

#[derive(Debug, Deserialize)]
struct RawCounters {
    #[serde(default)]
    bytes_sent: u64,
    #[serde(default)]
    bytes_recv: u64,
    #[serde(default)]
    packets_sent: u64,
    #[serde(default)]
    packets_recv: u64,
}

#[derive(Debug, Deserialize)]
struct RawTemperature {
    #[serde(default)]
    sensors: BTreeMap<String, Vec<RawSensor>>,
}

#[derive(Debug, Deserialize)]
struct RawSensor {
    label: Option<String>,
    current: f64,
}

impl RawMetrics {
    fn interfaces(network: Option<RawNetworkUsage>) -> Vec<NetworkSample> {
        network
            .map(|usage| {
                usage
                    .io_counters
                    .into_iter()
                    .map(|(interface_name, c)| NetworkSample {
                        interface_name,
                        bytes_sent: c.bytes_sent,
                        bytes_recv: c.bytes_recv,
                        packets_sent: c.packets_sent,
                        packets_recv: c.packets_recv,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One reading per sensor, named `chip` or `chip:label`
    fn temperatures(temperature: Option<RawTemperature>) -> Vec<TemperatureSample> {
        let Some(temperature) = temperature else {
            return Vec::new();
        };

        let mut readings = Vec::new();
        for (chip, sensors) in temperature.sensors {
            for sensor in sensors {
                let sensor_name = match non_empty(sensor.label) {
                    Some(label) if label != chip => format!("{chip}:{label}"),
                    _ => chip.clone(),
                };
                readings.push(TemperatureSample {
                    sensor_name,
                    temperature: sensor.current,
                });
            }
        }
        readings
    }
}

/// Fold the Windows agent's auxiliary sections into the services object
fn merge_services(services: Option<Value>, extras: [(&str, Option<Value>); 3]) -> Option<Value> {
    let extras: Vec<(&str, Value)> = extras
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect();
    if extras.is_empty() {
        return services;
    }

    let mut merged = match services {
        Some(Value::Object(map)) => map,
        Some(other) => Map::from_iter([("services".to_string(), other)]),
        None => Map::new(),
    };
    for (key, value) in extras {
        merged.entry(key).or_insert(value);
    }
    Some(Value::Object(merged))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Seconds(f64),
}

impl RawTimestamp {
    /// Resolve to UTC, truncated to millisecond precision so that a replayed
    /// batch maps onto the same stored rows in every backend.
    fn resolve(self) -> Result<DateTime<Utc>, DecodeError> {
        let millis = match self {
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map_err(|_| DecodeError::InvalidTimestamp(text.clone()))?
                .timestamp_millis(),
            RawTimestamp::Seconds(secs) => {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(DecodeError::InvalidTimestamp(secs.to_string()));
                }
                (secs * 1000.0).round() as i64
            }
        };

        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| DecodeError::InvalidTimestamp(millis.to_string()))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl AgentBatch {
    /// Decode a raw inbound message into a batch.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawBatch = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

        let hostname = non_empty(raw.hostname);
        let agent_id = non_empty(raw.agent_id)
            .or_else(|| hostname.clone())
            .ok_or(DecodeError::MissingAgentId)?;

        let timestamp = raw
            .timestamp
            .ok_or(DecodeError::MissingTimestamp)?
            .resolve()?;

        let metrics = raw.metrics.unwrap_or_default();

        let cpu = match raw.cpu_percent.or(raw.cpu_usage) {
            Some(cpu_percent) => Some(CpuSample {
                cpu_percent,
                load_avg_1min: raw.load_avg_1min,
                load_avg_5min: raw.load_avg_5min,
                load_avg_15min: raw.load_avg_15min,
            }),
            None => metrics.cpu.map(|cpu| {
                let load = cpu.load_avg;
                CpuSample {
                    cpu_percent: cpu.percent,
                    load_avg_1min: load.as_ref().and_then(|l| l.one),
                    load_avg_5min: load.as_ref().and_then(|l| l.five),
                    load_avg_15min: load.as_ref().and_then(|l| l.fifteen),
                }
            }),
        };

        let (network, network_info) = match raw.network {
            Some(RawNetwork::Interfaces(interfaces)) => (interfaces, raw.network_info),
            Some(RawNetwork::Info(info)) => (Vec::new(), raw.network_info.or(Some(info))),
            None => (Vec::new(), raw.network_info),
        };
        let network = if network.is_empty() {
            RawMetrics::interfaces(metrics.network)
        } else {
            network
        };

        let disks = if raw.disks.is_empty() {
            metrics.disk.map(|d| d.partitions).unwrap_or_default()
        } else {
            raw.disks
        };

        let temperatures = if raw.temperatures.is_empty() {
            RawMetrics::temperatures(metrics.temperature)
        } else {
            raw.temperatures
        };

        let services = merge_services(
            raw.services,
            [
                ("noip_duc", metrics.noip_duc),
                ("port_check", metrics.port_check),
                ("processes", metrics.processes),
            ],
        );

        Ok(Self {
            agent_id,
            hostname,
            agent_version: raw.agent_version,
            os_info: raw.os_info,
            timestamp,
            cpu,
            memory: raw.memory.or(raw.memory_usage).or(metrics.memory),
            disks,
            network,
            temperatures,
            services,
            network_info: network_info.map(Value::Object),
        })
    }

    /// Number of metric rows this batch appends when applied
    pub fn metric_row_count(&self) -> usize {
        usize::from(self.cpu.is_some())
            + usize::from(self.memory.is_some())
            + self.disks.len()
            + self.network.len()
            + self.temperatures.len()
    }
}
