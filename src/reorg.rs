//! Reorg detection against the persisted recent-blocks ring.
//!
//! Once per cycle the coordinator rechecks the indexer checkpoint's block
//! hash against the node. A mismatch means the chain reorganized underneath
//! committed state; the monitor then walks the ring from the newest entry
//! down, comparing persisted hashes with canonical ones fetched in a single
//! batched call, and reports the highest block both sides still agree on.

use std::sync::Arc;

use tracing::warn;

use crate::{
    error::XQueryError,
    fetch::FetchService,
    store::StateStore,
    types::INDEXER_STREAM,
};

pub struct ReorgMonitor {
    fetch: Arc<FetchService>,
    store: Arc<dyn StateStore>,
}

impl ReorgMonitor {
    pub fn new(fetch: Arc<FetchService>, store: Arc<dyn StateStore>) -> Self {
        Self { fetch, store }
    }

    /// Returns `Some(ancestor)` when committed state left the canonical
    /// chain; the caller rolls everything back to `ancestor` and rescans.
    pub async fn check(&self) -> Result<Option<u64>, XQueryError> {
        let Some(checkpoint) = self.store.load_checkpoint(INDEXER_STREAM).await? else {
            return Ok(None);
        };
        let Some(committed_hash) = checkpoint.block_hash else {
            // hash was cleared by a rollback; nothing to compare until the
            // next commit restores it
            return Ok(None);
        };
        match self.fetch.canonical_hash(checkpoint.block_number).await? {
            Some(canonical) if canonical == committed_hash => return Ok(None),
            Some(canonical) => warn!(
                block = checkpoint.block_number,
                committed = %committed_hash,
                canonical = %canonical,
                "checkpoint hash left the canonical chain"
            ),
            None => warn!(
                block = checkpoint.block_number,
                "checkpoint block no longer known to the node"
            ),
        }
        self.find_ancestor().await.map(Some)
    }

    async fn find_ancestor(&self) -> Result<u64, XQueryError> {
        let ring = self.store.recent_blocks().await?;
        let numbers: Vec<u64> = ring.iter().map(|b| b.number).collect();
        let canonical = self.fetch.canonical_hashes(&numbers).await?;
        for tracked in ring.iter().rev() {
            if canonical.get(&tracked.number) == Some(&tracked.hash) {
                return Ok(tracked.number);
            }
        }
        // the whole ring reorganized away; restart just below the earliest
        // tracked block
        let fallback = ring.first().map(|b| b.number.saturating_sub(1)).unwrap_or(0);
        warn!(fallback, "no common ancestor in the recent-blocks ring");
        Ok(fallback)
    }
}
