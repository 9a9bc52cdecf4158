use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    error::PersistError,
    event::MaterializedRecord,
    range::BlockRange,
    types::{Checkpoint, GapRecord, IndexedEvent, RecentBlock},
};

use super::StateStore;

/// In-memory [`StateStore`] for tests and single-process experiments.
///
/// Mirrors the Postgres semantics: commits are all-or-nothing per call, event
/// inserts are idempotent on the identity key, rollback clamps checkpoints.
pub struct MemStore {
    inner: Mutex<Inner>,
    recent_capacity: u64,
}

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<String, Checkpoint>,
    events: Vec<IndexedEvent>,
    gaps: Vec<GapRecord>,
    recent: Vec<RecentBlock>,
    /// `(stage, table)` per record the committer wrote.
    records: Vec<(String, String)>,
}

impl MemStore {
    #[must_use]
    pub fn new(recent_capacity: u64) -> Self {
        Self { inner: Mutex::default(), recent_capacity }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// All committed events, in sequence order.
    pub fn events(&self) -> Vec<IndexedEvent> {
        let mut events = self.lock().events.clone();
        events.sort_by_key(|e| e.sequence);
        events
    }

    pub fn gaps(&self) -> Vec<GapRecord> {
        self.lock().gaps.clone()
    }

    /// `(stage, table)` pairs in commit order.
    pub fn records(&self) -> Vec<(String, String)> {
        self.lock().records.clone()
    }

    pub fn checkpoint(&self, name: &str) -> Option<Checkpoint> {
        self.lock().checkpoints.get(name).cloned()
    }

    /// Seeds pre-existing state, as if written by an earlier run.
    pub fn seed(
        &self,
        events: Vec<IndexedEvent>,
        checkpoints: Vec<Checkpoint>,
        recent: Vec<RecentBlock>,
    ) {
        let mut inner = self.lock();
        inner.events.extend(events);
        for checkpoint in checkpoints {
            inner.checkpoints.insert(checkpoint.name.clone(), checkpoint);
        }
        inner.recent.extend(recent);
        inner.recent.sort_by_key(|b| b.number);
    }
}

#[async_trait]
impl StateStore for MemStore {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, PersistError> {
        Ok(self.lock().checkpoints.get(name).cloned())
    }

    async fn commit_indexed(
        &self,
        events: &[IndexedEvent],
        gaps: &[GapRecord],
        checkpoint: &Checkpoint,
        recent: &[RecentBlock],
    ) -> Result<(), PersistError> {
        let mut inner = self.lock();
        let known: HashSet<_> = inner.events.iter().map(IndexedEvent::identity).collect();
        for event in events {
            if !known.contains(&event.identity()) {
                inner.events.push(event.clone());
            }
        }
        let known_gaps: HashSet<_> = inner
            .gaps
            .iter()
            .map(|g| (g.block_number, g.transaction_hash, g.log_index))
            .collect();
        for gap in gaps {
            if !known_gaps.contains(&(gap.block_number, gap.transaction_hash, gap.log_index)) {
                inner.gaps.push(gap.clone());
            }
        }
        for block in recent {
            match inner.recent.iter().position(|b| b.number == block.number) {
                Some(i) => inner.recent[i].hash = block.hash,
                None => inner.recent.push(*block),
            }
        }
        inner.recent.sort_by_key(|b| b.number);
        let cutoff = checkpoint.block_number.saturating_sub(self.recent_capacity);
        inner.recent.retain(|b| b.number >= cutoff);
        inner.checkpoints.insert(checkpoint.name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn commit_stage(
        &self,
        stage: &str,
        records: &[Box<dyn MaterializedRecord>],
        checkpoint: &Checkpoint,
    ) -> Result<(), PersistError> {
        let mut inner = self.lock();
        for record in records {
            inner.records.push((stage.to_owned(), record.table().to_owned()));
        }
        inner.checkpoints.insert(checkpoint.name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_events(&self, range: BlockRange) -> Result<Vec<IndexedEvent>, PersistError> {
        let mut events: Vec<_> = self
            .lock()
            .events
            .iter()
            .filter(|e| range.contains(e.block_number))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn recent_blocks(&self) -> Result<Vec<RecentBlock>, PersistError> {
        Ok(self.lock().recent.clone())
    }

    async fn rollback_to(&self, block: u64) -> Result<(), PersistError> {
        let mut inner = self.lock();
        inner.events.retain(|e| e.block_number <= block);
        inner.gaps.retain(|g| g.block_number <= block);
        inner.recent.retain(|b| b.number <= block);
        for checkpoint in inner.checkpoints.values_mut() {
            if checkpoint.block_number > block {
                checkpoint.block_number = block;
                checkpoint.block_hash = None;
            }
        }
        Ok(())
    }

    async fn max_sequence(&self) -> Result<u64, PersistError> {
        Ok(self.lock().events.iter().map(|e| e.sequence).max().unwrap_or(0))
    }
}
