use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

use alloy::rpc::types::Log;
use tracing::warn;

use crate::{
    error::DecodeError,
    types::{DecodedEvent, GapRecord, IndexedEvent},
};

/// Decodes one raw log into zero or more logical events.
///
/// Must be pure: same log, same output. A [`DecodeError`] marks a log the
/// application's rules cannot interpret; it becomes a [`GapRecord`], never a
/// worker failure.
pub trait EventIndexer: Send + Sync {
    fn decode(&self, log: &Log) -> Result<Vec<DecodedEvent>, DecodeError>;
}

/// Output of [`index_logs`] for one range: the decoded events in chain order
/// plus a gap per undecodable log.
#[derive(Debug, Default)]
pub struct IndexedBatch {
    pub events: Vec<IndexedEvent>,
    pub gaps: Vec<GapRecord>,
}

/// Runs the indexer over one range's filtered logs.
///
/// Logs are walked in `(block_number, log_index)` order, deduplicated by
/// identity, and each log's decoded events get consecutive ordinals. Sequence
/// numbers stay zero here; the committer stamps them so they follow commit
/// order exactly.
pub fn index_logs(indexer: &dyn EventIndexer, logs: &[Log]) -> IndexedBatch {
    let mut batch = IndexedBatch::default();
    let mut seen = HashSet::new();
    for log in logs {
        let (Some(block_number), Some(block_hash), Some(transaction_hash), Some(log_index)) =
            (log.block_number, log.block_hash, log.transaction_hash, log.log_index)
        else {
            warn!("skipping log without position metadata");
            continue;
        };
        if !seen.insert((block_hash, transaction_hash, log_index)) {
            continue;
        }
        match indexer.decode(log) {
            Ok(decoded) => {
                for (ordinal, event) in decoded.into_iter().enumerate() {
                    batch.events.push(IndexedEvent {
                        sequence: 0,
                        block_number,
                        block_hash,
                        transaction_hash,
                        log_index,
                        ordinal: ordinal as u32,
                        name: event.name,
                        payload: event.payload,
                    });
                }
            }
            Err(err) => {
                warn!(
                    block = block_number,
                    tx = %transaction_hash,
                    log_index,
                    error = %err,
                    "log did not decode, recording gap"
                );
                batch.gaps.push(GapRecord {
                    block_number,
                    transaction_hash,
                    log_index,
                    reason: err.reason,
                });
            }
        }
    }
    batch
}

/// Hands out strictly increasing sequence numbers, seeded from the store's
/// maximum at startup. Shared by reference with the single committer, so
/// stamped batches inherit commit order.
#[derive(Debug)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    /// `max_persisted` is the highest sequence already in the store, zero for
    /// an empty store.
    #[must_use]
    pub fn new(max_persisted: u64) -> Self {
        Self { next: AtomicU64::new(max_persisted + 1) }
    }

    /// Stamps `events` in place with consecutive sequence numbers.
    pub fn stamp(&self, events: &mut [IndexedEvent]) {
        for event in events {
            event.sequence = self.next.fetch_add(1, Ordering::SeqCst);
        }
    }
}
