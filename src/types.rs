//! Core data types shared across the pipeline.

use alloy::{
    primitives::B256,
    rpc::types::Block,
};
use serde::{Deserialize, Serialize};

/// The slice of a block header the pipeline actually consumes.
///
/// Full RPC blocks carry transaction lists the pipeline never reads, so the
/// batch client reduces them to this as soon as they come off the wire. The
/// reduced form is what gets cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        Self {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
        }
    }
}

/// ERC-20 metadata resolved via batched `eth_call`s.
///
/// Tokens with reverting or non-conforming implementations get the field
/// defaults instead of failing the whole lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMeta {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// One logical event decoded from a raw log by an [`EventIndexer`].
///
/// [`EventIndexer`]: crate::event::EventIndexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

impl DecodedEvent {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { name: name.into(), payload }
    }
}

/// A decoded event pinned to its on-chain position.
///
/// Identity is `(block_hash, transaction_hash, log_index, ordinal)`; `ordinal`
/// distinguishes multiple logical events decoded from the same log. `sequence`
/// is zero until the committer stamps it from the [`Sequencer`].
///
/// [`Sequencer`]: crate::event::Sequencer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub sequence: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub ordinal: u32,
    pub name: String,
    pub payload: serde_json::Value,
}

impl IndexedEvent {
    /// The dedup key: two events with the same identity are the same event.
    pub fn identity(&self) -> (B256, B256, u64, u32) {
        (self.block_hash, self.transaction_hash, self.log_index, self.ordinal)
    }
}

/// Audit marker for a filter-matched log the indexer could not decode.
///
/// Gaps are committed alongside events so a missed log is visible in the
/// store rather than silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRecord {
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub reason: String,
}

/// Durable progress marker for one logical stream.
///
/// The indexer stream is named [`INDEXER_STREAM`]; each processor stage gets
/// `processor_<stage>`. The block hash (indexer stream only) anchors the
/// reorg recheck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub name: String,
    pub block_number: u64,
    pub block_hash: Option<B256>,
}

/// Checkpoint stream name for the indexer phase.
pub const INDEXER_STREAM: &str = "indexer";

/// Checkpoint stream name for a processor stage.
pub fn stage_stream(stage: &str) -> String {
    format!("processor_{stage}")
}

/// One entry of the persisted recent-blocks ring used to locate a reorg's
/// common ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentBlock {
    pub number: u64,
    pub hash: B256,
}
