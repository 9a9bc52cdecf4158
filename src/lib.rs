//! XQuery extracts, indexes and materializes EVM event logs into Postgres.
//!
//! An application describes what it wants as an [`XGraph`]: an [`EventFilter`]
//! selecting the raw logs, an [`EventIndexer`] decoding them into
//! [`IndexedEvent`]s, and an ordered list of [`ProcessorStage`]s turning
//! committed events into [`MaterializedRecord`]s for its own tables. The
//! [`Coordinator`] drives the graph against a chain endpoint.
//!
//! # Phases
//!
//! Every cycle first *scans*: confirmed blocks past the indexer checkpoint
//! are partitioned into ranges, workers run Filter → Indexer over each range,
//! and results are committed strictly in range order together with the
//! advanced checkpoint. Then it *computes*: each stage, in declared order,
//! processes the newly indexed events the same way.
//!
//! # Recovery
//!
//! All progress lives in checkpoints committed transactionally with the data
//! they cover, so a crash, restart or abandoned shutdown resumes by re-running
//! at most the uncommitted ranges. Event inserts are idempotent on
//! `(block_hash, transaction_hash, log_index, ordinal)`, which makes that
//! replay invisible in the stored tables.
//!
//! # Reorgs
//!
//! Only blocks at least `confirmation_depth` behind the head are processed,
//! and each cycle rechecks the checkpoint's block hash against the node. If
//! committed state left the canonical chain, the pipeline rolls back to the
//! common ancestor (found via a persisted ring of recent block hashes),
//! invokes each stage's rollback hook, and rescans.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod fetch;
pub mod range;
pub mod reorg;
pub mod rpc;
pub mod store;

mod error;
mod types;

pub use config::{CacheConfig, DbConfig, XQueryConfig};
pub use coordinator::{Coordinator, shutdown_token};
pub use error::{
    CacheError, ConfigError, DecodeError, FetchError, PersistError, StageError, XQueryError,
};
pub use event::{
    AddressTopicFilter, EventFilter, EventIndexer, IndexedBatch, MaterializedRecord,
    ProcessorStage, Sequencer, XGraph, index_logs,
};
pub use fetch::FetchService;
pub use range::BlockRange;
pub use rpc::{BatchClient, ChainReader};
pub use store::{MemStore, PgStore, StateStore};
pub use types::{
    BlockInfo, Checkpoint, DecodedEvent, GapRecord, INDEXER_STREAM, IndexedEvent, RecentBlock,
    TokenMeta, stage_stream,
};
