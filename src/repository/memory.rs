//! In-memory log repository, used by the test suites and selectable as
//! `db.type: memory` for dependency-free deployments.

use super::LogRepository;
use crate::error::Result;
use crate::model::{Log, ProcessType, TraceId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryRepository {
    records: RwLock<HashMap<Uuid, Log>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Records for one exchange, request before response.
    pub fn by_trace(&self, trace_id: TraceId) -> Vec<Log> {
        let mut records: Vec<Log> = self
            .records
            .read()
            .values()
            .filter(|log| log.trace_id.as_ref() == trace_id.as_ref())
            .cloned()
            .collect();
        records.sort_by_key(|log| match log.process_type {
            ProcessType::Request => 0,
            ProcessType::Response => 1,
        });
        records
    }

    pub fn all(&self) -> Vec<Log> {
        self.records.read().values().cloned().collect()
    }

    pub fn count_by_type(&self, process_type: ProcessType) -> usize {
        self.records
            .read()
            .values()
            .filter(|log| log.process_type == process_type)
            .count()
    }
}

#[async_trait]
impl LogRepository for MemoryRepository {
    async fn save(&self, log: &Log) -> Result<()> {
        self.records
            .write()
            .entry(log.id)
            .or_insert_with(|| log.clone());
        Ok(())
    }

    async fn save_batch(&self, logs: &[Log]) -> Result<()> {
        let mut records = self.records.write();
        for log in logs {
            records.entry(log.id).or_insert_with(|| log.clone());
        }
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}
