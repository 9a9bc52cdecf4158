//! Durable pipeline state: events, gaps, checkpoints, recent blocks.
//!
//! All writes for one job go through a single commit call and land in one
//! transaction, so a checkpoint can never run ahead of the data it covers.
//! Event inserts are idempotent on the event identity, which makes replay
//! after a crash or an abandoned shutdown safe.

use async_trait::async_trait;

use crate::{
    error::PersistError,
    event::MaterializedRecord,
    range::BlockRange,
    types::{Checkpoint, GapRecord, IndexedEvent, RecentBlock},
};

mod mem;
mod pg;

pub use mem::MemStore;
pub use pg::PgStore;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, PersistError>;

    /// Commits one scanned range atomically: its events, its decode gaps, the
    /// advanced indexer checkpoint and the refreshed recent-blocks ring.
    async fn commit_indexed(
        &self,
        events: &[IndexedEvent],
        gaps: &[GapRecord],
        checkpoint: &Checkpoint,
        recent: &[RecentBlock],
    ) -> Result<(), PersistError>;

    /// Commits one stage range atomically: the stage's records plus its
    /// advanced checkpoint.
    async fn commit_stage(
        &self,
        stage: &str,
        records: &[Box<dyn MaterializedRecord>],
        checkpoint: &Checkpoint,
    ) -> Result<(), PersistError>;

    /// Committed events in `range`, ordered by sequence.
    async fn load_events(&self, range: BlockRange) -> Result<Vec<IndexedEvent>, PersistError>;

    /// The persisted ring, ascending by block number.
    async fn recent_blocks(&self) -> Result<Vec<RecentBlock>, PersistError>;

    /// Discards everything above `block`: events, gaps, ring entries, and
    /// clamps every checkpoint down to at most `block`.
    async fn rollback_to(&self, block: u64) -> Result<(), PersistError>;

    /// Highest committed event sequence, zero for an empty store.
    async fn max_sequence(&self) -> Result<u64, PersistError>;
}
