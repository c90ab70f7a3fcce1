//! Persistence for agents, telemetry history and the command ledger
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` allows swapping implementations
//! - **Async**: All operations are async and safe to share across tasks
//! - **Atomic batches**: one telemetry batch is one transaction
//!
//! ## Backends
//!
//! - **PostgreSQL** (default): production deployments
//! - **SQLite**: embedded, single node
//! - **In-Memory**: no persistence, for tests and local runs
//!
//! ## Usage
//!
//! ```no_run
//! use fleet_monitor::config::{PoolConfig, StoreConfig};
//! use fleet_monitor::storage::open_backend;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = open_backend(&StoreConfig::Memory, &PoolConfig::default()).await?;
//!     store.health_check().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::{PoolConfig, StoreConfig};

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use schema::{AgentRecord, BatchOutcome, LatestMetrics, MetricKind, MetricQuery, MetricRecord};

/// Open the configured backend. Migrations run as part of opening.
pub async fn open_backend(
    config: &StoreConfig,
    pool: &PoolConfig,
) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        #[cfg(feature = "storage-postgres")]
        StoreConfig::Postgres(settings) => {
            let backend = postgres::PostgresBackend::connect(settings, pool).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-postgres"))]
        StoreConfig::Postgres(_) => Err(StorageError::InvalidConfig(
            "built without the storage-postgres feature".to_string(),
        )),

        #[cfg(feature = "storage-sqlite")]
        StoreConfig::Sqlite { path } => {
            let backend = sqlite::SqliteBackend::new(path, pool.max_connections).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StoreConfig::Sqlite { .. } => Err(StorageError::InvalidConfig(
            "built without the storage-sqlite feature".to_string(),
        )),

        StoreConfig::Memory => {
            info!("using in-memory storage backend, data will not survive a restart");
            Ok(Arc::new(memory::MemoryBackend::new()))
        }
    }
}
