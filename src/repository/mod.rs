//! Pluggable persistence for [`Log`] records.
//!
//! The contract is uniform across backends: single or batched saves, an
//! idempotent `migrate`, and `close`. The backend is selected by the
//! `db.type` configuration tag.

pub mod memory;
pub mod migrations;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PostgresRepository;

use crate::config::DbSettings;
use crate::error::{Error, Result};
use crate::model::Log;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Uniform persistence contract for telemetry records.
#[async_trait]
pub trait LogRepository: Send + Sync {
    /// Persists one record. Saving the same record id twice yields at
    /// most one durable row.
    async fn save(&self, log: &Log) -> Result<()>;

    /// Persists a batch; transactional backends apply all-or-nothing.
    async fn save_batch(&self, logs: &[Log]) -> Result<()>;

    /// Creates missing tables and indexes; existing ones are left alone.
    async fn migrate(&self) -> Result<()>;

    /// Releases backend resources.
    async fn close(&self);
}

/// Connects the repository selected by `db.type` and leaves migration to
/// the caller.
pub async fn connect(settings: &DbSettings) -> Result<Arc<dyn LogRepository>> {
    match settings.db_type.as_str() {
        "postgres" => {
            info!(
                host = %settings.host,
                port = settings.port,
                database = %settings.database,
                "connecting to postgres log repository"
            );
            let repository = PostgresRepository::connect(settings).await?;
            Ok(Arc::new(repository))
        }
        "memory" => Ok(Arc::new(MemoryRepository::new())),
        other => Err(Error::invalid_config(format!(
            "unsupported db type: {other}"
        ))),
    }
}
