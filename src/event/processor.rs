use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgConnection;

use crate::{
    config::is_valid_ident,
    error::{ConfigError, StageError},
    types::IndexedEvent,
};

use super::{EventFilter, EventIndexer};

/// One row the application wants written during a stage commit.
///
/// The upsert runs inside the same transaction that advances the stage
/// checkpoint, so records and progress move together or not at all.
/// Implementations own their SQL and must be idempotent under replay.
#[async_trait]
pub trait MaterializedRecord: Send + Sync {
    /// Destination table, for logging and bookkeeping.
    fn table(&self) -> &str;

    async fn upsert(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error>;
}

/// One step of the compute phase.
///
/// Stages run in declared order; stage *n+1* only ever sees events already
/// committed through stage *n*'s checkpoint. `process` must not write to the
/// store itself, it returns the records for the committer to write.
#[async_trait]
pub trait ProcessorStage: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        events: &[IndexedEvent],
    ) -> Result<Vec<Box<dyn MaterializedRecord>>, StageError>;

    /// Called when a reorg rolls the pipeline back to `to_block`, so the
    /// application can revert its own tables.
    async fn rollback(&self, to_block: u64) -> Result<(), StageError> {
        let _ = to_block;
        Ok(())
    }
}

/// One configured pipeline instance: filter, indexer, and ordered stages.
///
/// The name doubles as cache-key prefix and (by default) schema namespace, so
/// it must be a plain identifier.
pub struct XGraph {
    name: String,
    pub filter: Arc<dyn EventFilter>,
    pub indexer: Arc<dyn EventIndexer>,
    pub stages: Vec<Arc<dyn ProcessorStage>>,
}

impl XGraph {
    pub fn new(
        name: impl Into<String>,
        filter: Arc<dyn EventFilter>,
        indexer: Arc<dyn EventIndexer>,
        stages: Vec<Arc<dyn ProcessorStage>>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if !is_valid_ident(&name) {
            return Err(ConfigError::InvalidSchemaName(name));
        }
        Ok(Self { name, filter, indexer, stages })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
