use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::trace;

use crate::util::{env_opt, env_parse, env_string};

/// Message broker connection parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BrokerBackend {
    /// RabbitMQ (or any AMQP 0.9.1 broker)
    Amqp(AmqpSettings),

    /// In-process broker, for local runs and tests
    Memory,
}

impl Default for BrokerBackend {
    fn default() -> Self {
        BrokerBackend::Amqp(AmqpSettings::default())
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            user: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl fmt::Debug for AmqpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AmqpSettings {
    /// Connection target for log output; the password is never included
    pub fn display_url(&self) -> String {
        format!(
            "amqp://{}@{}:{}/{}",
            self.user, self.host, self.port, self.vhost
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub transport: BrokerBackend,

    /// Inbound telemetry queue
    pub data_queue: String,

    /// Outbound command queue
    pub command_queue: String,

    /// Fixed delay between reconnection attempts
    pub reconnect_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            transport: BrokerBackend::default(),
            data_queue: "agent_data".to_string(),
            command_queue: "agent_commands".to_string(),
            reconnect_delay_ms: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Postgres(PostgresSettings),

    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },

    /// In-memory storage (no persistence)
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Postgres(PostgresSettings::default())
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./fleet.db")
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for PostgresSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "monitoring".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            idle_timeout_ms: 30_000,
            connect_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// HTTP port
    pub port: u16,

    /// An agent counts as alive while its last report is younger than this
    pub agent_liveness_secs: u64,

    /// Commands left in `sent` longer than this are reported as stale
    pub stale_command_secs: u64,

    pub stale_scan_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            agent_liveness_secs: 300,
            stale_command_secs: 600,
            stale_scan_interval_secs: 60,
        }
    }
}

impl HubConfig {
    pub fn agent_liveness(&self) -> anyhow::Result<chrono::Duration> {
        i64::try_from(self.agent_liveness_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .with_context(|| {
                format!(
                    "AGENT_LIVENESS_SECS out of range: {}",
                    self.agent_liveness_secs
                )
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub pool: PoolConfig,
    pub hub: HubConfig,
}

impl Config {
    /// Build the configuration from the process environment (after `.env`
    /// has been loaded). Unset options take their defaults.
    pub fn from_env() -> anyhow::Result<Config> {
        let broker_defaults = BrokerConfig::default();
        let amqp_defaults = AmqpSettings::default();
        let pg_defaults = PostgresSettings::default();
        let pool_defaults = PoolConfig::default();
        let hub_defaults = HubConfig::default();

        let transport = match env_string("BROKER_BACKEND", "amqp").as_str() {
            "amqp" | "rabbitmq" => BrokerBackend::Amqp(AmqpSettings {
                host: env_string("RABBITMQ_HOST", &amqp_defaults.host),
                port: env_parse("RABBITMQ_PORT", amqp_defaults.port),
                vhost: env_string("RABBITMQ_VHOST", &amqp_defaults.vhost),
                user: env_string("RABBITMQ_USER", &amqp_defaults.user),
                password: env_string("RABBITMQ_PASSWORD", &amqp_defaults.password),
            }),
            "memory" => BrokerBackend::Memory,
            other => bail!("unknown BROKER_BACKEND '{other}' (expected amqp or memory)"),
        };

        let store = match env_string("STORE_BACKEND", "postgres").as_str() {
            "postgres" | "postgresql" => StoreConfig::Postgres(PostgresSettings {
                host: env_string("POSTGRES_HOST", &pg_defaults.host),
                port: env_parse("POSTGRES_PORT", pg_defaults.port),
                user: env_string("POSTGRES_USER", &pg_defaults.user),
                password: env_opt("POSTGRES_PASSWORD").unwrap_or_default(),
                database: env_string("POSTGRES_DB", &pg_defaults.database),
            }),
            "sqlite" => StoreConfig::Sqlite {
                path: env_opt("SQLITE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_sqlite_path),
            },
            "memory" => StoreConfig::Memory,
            other => bail!("unknown STORE_BACKEND '{other}' (expected postgres, sqlite or memory)"),
        };

        let config = Config {
            broker: BrokerConfig {
                transport,
                data_queue: env_string("RABBITMQ_QUEUE_DATA", &broker_defaults.data_queue),
                command_queue: env_string(
                    "RABBITMQ_QUEUE_COMMANDS",
                    &broker_defaults.command_queue,
                ),
                reconnect_delay_ms: env_parse(
                    "RECONNECT_DELAY_MS",
                    broker_defaults.reconnect_delay_ms,
                ),
            },
            store,
            pool: PoolConfig {
                max_connections: env_parse("POOL_SIZE", pool_defaults.max_connections),
                idle_timeout_ms: env_parse("POOL_IDLE_TIMEOUT_MS", pool_defaults.idle_timeout_ms),
                connect_timeout_ms: env_parse(
                    "POOL_CONNECT_TIMEOUT_MS",
                    pool_defaults.connect_timeout_ms,
                ),
            },
            hub: HubConfig {
                port: env_parse("PORT", hub_defaults.port),
                agent_liveness_secs: env_parse(
                    "AGENT_LIVENESS_SECS",
                    hub_defaults.agent_liveness_secs,
                ),
                stale_command_secs: env_parse(
                    "STALE_COMMAND_SECS",
                    hub_defaults.stale_command_secs,
                ),
                stale_scan_interval_secs: env_parse(
                    "STALE_SCAN_INTERVAL_SECS",
                    hub_defaults.stale_scan_interval_secs,
                ),
            },
        };

        trace!("loaded config from environment: {config:?}");
        Ok(config)
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.broker.data_queue, "agent_data");
        assert_eq!(config.broker.command_queue, "agent_commands");
        assert_eq!(config.broker.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.pool.max_connections, 20);
        assert_eq!(config.pool.idle_timeout_ms, 30_000);
        assert_eq!(config.pool.connect_timeout_ms, 2_000);
        assert_eq!(config.hub.port, 3000);
        assert_matches!(config.store, StoreConfig::Postgres(_));
    }

    #[test]
    fn test_agent_liveness_rejects_out_of_range_values() {
        let mut hub = HubConfig::default();
        assert_eq!(hub.agent_liveness().unwrap(), chrono::Duration::seconds(300));

        hub.agent_liveness_secs = u64::MAX;
        assert!(hub.agent_liveness().is_err());

        hub.agent_liveness_secs = i64::MAX as u64;
        assert!(hub.agent_liveness().is_err());
    }

    #[test]
    fn test_parse_partial_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "broker": {
                    "transport": {"backend": "amqp", "host": "rabbit", "vhost": "fleet"},
                    "reconnect_delay_ms": 250
                },
                "store": {"backend": "sqlite", "path": "/tmp/fleet.db"}
            }"#,
        )
        .unwrap();

        assert_matches!(
            &config.broker.transport,
            BrokerBackend::Amqp(settings) if settings.host == "rabbit" && settings.port == 5672
        );
        assert_eq!(config.broker.reconnect_delay_ms, 250);
        assert_eq!(config.broker.data_queue, "agent_data");
        assert_matches!(config.store, StoreConfig::Sqlite { ref path } if path == &PathBuf::from("/tmp/fleet.db"));
    }

    #[test]
    fn test_memory_backends_from_json() {
        let config: Config = serde_json::from_str(
            r#"{"broker": {"transport": {"backend": "memory"}}, "store": {"backend": "memory"}}"#,
        )
        .unwrap();

        assert_matches!(config.broker.transport, BrokerBackend::Memory);
        assert_matches!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_display_url_hides_password() {
        let settings = AmqpSettings {
            password: "hunter2".to_string(),
            ..AmqpSettings::default()
        };

        let url = settings.display_url();
        assert_eq!(url, "amqp://guest@localhost:5672//");
        assert!(!url.contains("hunter2"));
    }

    #[test]
    fn test_debug_output_redacts_passwords() {
        let config = Config {
            broker: BrokerConfig {
                transport: BrokerBackend::Amqp(AmqpSettings {
                    password: "hunter2".to_string(),
                    ..AmqpSettings::default()
                }),
                ..BrokerConfig::default()
            },
            store: StoreConfig::Postgres(PostgresSettings {
                password: "s3cret".to_string(),
                ..PostgresSettings::default()
            }),
            ..Config::default()
        };

        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("<redacted>"));
    }
}
