use std::sync::Arc;

use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;

/// Errors surfaced by the RPC batch client and the fetch service.
///
/// Transient failures are retried with backoff inside the batch client; once
/// retries exhaust they propagate here and fail the current range without
/// advancing its checkpoint. Values stay `Clone`-able (the underlying RPC
/// error is `Arc`-wrapped) so a single in-flight fetch can fan its result out
/// to every coalesced waiter.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// A retryable RPC failure (timeout, rate limit, backend temporarily
    /// gone) that survived the bounded retry budget.
    #[error("transient RPC failure: {0}")]
    Transient(Arc<RpcError<TransportErrorKind>>),

    /// A non-retryable RPC failure (malformed request, unsupported method).
    #[error("permanent RPC failure: {0}")]
    Permanent(Arc<RpcError<TransportErrorKind>>),

    /// A requested block does not exist on the canonical chain, typically
    /// because the requested range is ahead of the chain head.
    #[error("block {0} not found (possibly ahead of chain head)")]
    BlockNotFound(u64),
}

/// Retry predicate shared by the batch client's backoff loop and
/// [`FetchError::classify`].
pub(crate) fn is_transient_rpc(err: &RpcError<TransportErrorKind>) -> bool {
    match err {
        RpcError::Transport(kind) => kind.is_retry_err(),
        // -32005 is the conventional "limit exceeded" / throttle code
        RpcError::ErrorResp(resp) => resp.code == -32005,
        _ => false,
    }
}

impl FetchError {
    /// Classifies a raw RPC error into the transient/permanent taxonomy.
    pub fn classify(err: RpcError<TransportErrorKind>) -> Self {
        if is_transient_rpc(&err) {
            FetchError::Transient(Arc::new(err))
        } else {
            FetchError::Permanent(Arc::new(err))
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// An indexer failed to interpret a log that matched the filter.
///
/// This is a logic error in the application's decoding rules, not a runtime
/// fault: it is recorded as a gap for audit and never aborts the worker.
#[derive(Error, Debug, Clone)]
#[error("log decode failed: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Database write/read failures. Fatal to the current range's commit: the
/// checkpoint is not advanced and the range is re-queued.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema name {0:?} is not a valid SQL identifier")]
    InvalidSchema(String),
}

/// Cache I/O failures. Never fatal: the fetch service degrades a cache error
/// to a miss (reads) or a no-op (writes) and logs it.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("cache value encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors produced by application-defined processor stages.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("stage failed: {0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Invalid static configuration, reported before the coordinator starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be greater than 0")]
    InvalidWorkerCount,

    #[error("max batch size must be greater than 0")]
    InvalidMaxBatchSize,

    #[error("RPC batch size must be greater than 0")]
    InvalidRpcBatchSize,

    #[error("schema name {0:?} is not a valid SQL identifier")]
    InvalidSchemaName(String),
}

/// Top-level error type returned by the coordinator.
#[derive(Error, Debug)]
pub enum XQueryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("stage {stage:?} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("commit for blocks {start}..={end} failed {attempts} times, giving up")]
    CommitRetriesExhausted { start: u64, end: u64, attempts: u32 },

    #[error("worker pool stopped before finishing its jobs")]
    WorkersStopped,
}
