//! End-to-end pipeline tests over an in-memory store and a stubbed chain.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, B256, Bytes, LogData, keccak256},
    rpc::types::{Filter, Log},
};
use async_trait::async_trait;
use serde_json::json;
use sqlx::PgConnection;
use tokio_util::sync::CancellationToken;

use xquery::{
    AddressTopicFilter, BlockInfo, BlockRange, ChainReader, Coordinator, DecodeError,
    DecodedEvent, EventIndexer, FetchError, FetchService, INDEXER_STREAM, IndexedEvent,
    MaterializedRecord, MemStore, ProcessorStage, StageError, TokenMeta, XGraph, XQueryConfig,
    cache::MemoryCache, stage_stream,
};

const CONTRACT: Address = Address::new([0x42; 20]);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A chain serving deterministic blocks up to `latest`, with one Transfer log
/// in each of `log_blocks`. Setting `forked_from` flips every hash from that
/// height upward, simulating a reorg.
#[derive(Clone)]
struct StubChain {
    latest: u64,
    log_blocks: Vec<u64>,
    forked_from: Option<u64>,
}

impl StubChain {
    fn new(latest: u64, log_blocks: Vec<u64>) -> Self {
        Self { latest, log_blocks, forked_from: None }
    }

    fn block_hash(&self, number: u64) -> B256 {
        let forked = self.forked_from.is_some_and(|from| number >= from);
        let tag: u64 = if forked { 0xD15EA5E } else { 0xCA11AB1E };
        keccak256([tag.to_be_bytes(), number.to_be_bytes()].concat())
    }

    fn log_at(&self, number: u64) -> Log {
        let inner = alloy::primitives::Log {
            address: CONTRACT,
            data: LogData::new_unchecked(
                vec![keccak256(b"Transfer(address,address,uint256)")],
                Bytes::new(),
            ),
        };
        Log {
            inner,
            block_hash: Some(self.block_hash(number)),
            block_number: Some(number),
            block_timestamp: None,
            transaction_hash: Some(keccak256(number.to_le_bytes())),
            transaction_index: Some(0),
            log_index: Some(0),
            removed: false,
        }
    }
}

#[async_trait]
impl ChainReader for StubChain {
    async fn fetch_blocks(&self, numbers: &[u64]) -> Result<HashMap<u64, BlockInfo>, FetchError> {
        Ok(numbers
            .iter()
            .filter(|&&n| n <= self.latest)
            .map(|&n| {
                let info = BlockInfo {
                    number: n,
                    hash: self.block_hash(n),
                    parent_hash: self.block_hash(n.saturating_sub(1)),
                    timestamp: n * 12,
                };
                (n, info)
            })
            .collect())
    }

    async fn fetch_logs(
        &self,
        range: BlockRange,
        _filter: &Filter,
    ) -> Result<Vec<Log>, FetchError> {
        Ok(self
            .log_blocks
            .iter()
            .filter(|&&n| range.contains(n))
            .map(|&n| self.log_at(n))
            .collect())
    }

    async fn fetch_token_metadata(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, TokenMeta>, FetchError> {
        Ok(addresses.iter().map(|&a| (a, TokenMeta::default())).collect())
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        Ok(self.latest)
    }
}

struct TransferIndexer {
    fail_blocks: Vec<u64>,
}

impl EventIndexer for TransferIndexer {
    fn decode(&self, log: &Log) -> Result<Vec<DecodedEvent>, DecodeError> {
        let block = log.block_number.unwrap_or_default();
        if self.fail_blocks.contains(&block) {
            return Err(DecodeError::new("forced decode failure"));
        }
        Ok(vec![DecodedEvent::new("Transfer", json!({ "block": block }))])
    }
}

struct TransferRecord;

#[async_trait]
impl MaterializedRecord for TransferRecord {
    fn table(&self) -> &str {
        "transfers"
    }

    async fn upsert(&self, _conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

struct AggregateStage;

#[async_trait]
impl ProcessorStage for AggregateStage {
    fn name(&self) -> &str {
        "aggregate"
    }

    async fn process(
        &self,
        events: &[IndexedEvent],
    ) -> Result<Vec<Box<dyn MaterializedRecord>>, StageError> {
        Ok(events.iter().map(|_| Box::new(TransferRecord) as Box<dyn MaterializedRecord>).collect())
    }
}

fn config() -> XQueryConfig {
    XQueryConfig::default()
        .with_start_block(100)
        .with_workers(2)
        .with_max_batch_size(4)
        .with_confirmation_depth(15)
        .with_poll_interval(Duration::from_millis(10))
}

async fn coordinator(
    chain: StubChain,
    store: Arc<MemStore>,
    fail_blocks: Vec<u64>,
) -> Coordinator {
    coordinator_on(Arc::new(chain), store, fail_blocks).await
}

async fn coordinator_on(
    chain: Arc<dyn ChainReader>,
    store: Arc<MemStore>,
    fail_blocks: Vec<u64>,
) -> Coordinator {
    let fetch = Arc::new(FetchService::new(chain, Arc::new(MemoryCache::new()), "testgraph"));
    let filter = Arc::new(AddressTopicFilter::from_signatures(
        vec![CONTRACT],
        &["Transfer(address,address,uint256)"],
    ));
    let graph = XGraph::new(
        "testgraph",
        filter,
        Arc::new(TransferIndexer { fail_blocks }),
        vec![Arc::new(AggregateStage) as Arc<dyn ProcessorStage>],
    )
    .expect("valid graph");
    Coordinator::new(config(), graph, fetch, store).await.expect("coordinator")
}

/// Head at 124 with a confirmation depth of 15 confirms exactly 100..=109;
/// logs sit at 101, 105 and 109.
#[tokio::test]
async fn scan_and_compute_one_cycle() {
    init_tracing();
    let store = Arc::new(MemStore::new(64));
    let chain = StubChain::new(124, vec![101, 105, 109]);
    let coordinator = coordinator(chain.clone(), Arc::clone(&store), vec![]).await;

    coordinator.run_cycle(&CancellationToken::new()).await.unwrap();

    let events = store.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
    // commit order follows range order, so sequences follow block order
    assert_eq!(events.iter().map(|e| e.block_number).collect::<Vec<_>>(), vec![101, 105, 109]);
    assert!(store.gaps().is_empty());

    let indexed = store.checkpoint(INDEXER_STREAM).expect("indexer checkpoint");
    assert_eq!(indexed.block_number, 109);
    assert_eq!(indexed.block_hash, Some(chain.block_hash(109)));

    let records = store.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|(stage, table)| stage == "aggregate" && table == "transfers"));
    let staged = store.checkpoint(&stage_stream("aggregate")).expect("stage checkpoint");
    assert_eq!(staged.block_number, 109);
}

#[tokio::test]
async fn replayed_cycles_commit_nothing_new() {
    init_tracing();
    let store = Arc::new(MemStore::new(64));
    let chain = StubChain::new(124, vec![101, 105, 109]);
    let coordinator = coordinator(chain, Arc::clone(&store), vec![]).await;
    let token = CancellationToken::new();

    coordinator.run_cycle(&token).await.unwrap();
    coordinator.run_cycle(&token).await.unwrap();

    assert_eq!(store.events().len(), 3);
    assert_eq!(store.records().len(), 3);
    assert_eq!(store.checkpoint(INDEXER_STREAM).unwrap().block_number, 109);
}

#[tokio::test]
async fn undecodable_log_becomes_a_gap_without_stopping_the_scan() {
    init_tracing();
    let store = Arc::new(MemStore::new(64));
    let chain = StubChain::new(124, vec![101, 105, 109]);
    let coordinator = coordinator(chain, Arc::clone(&store), vec![105]).await;

    coordinator.run_cycle(&CancellationToken::new()).await.unwrap();

    let events = store.events();
    assert_eq!(events.iter().map(|e| e.block_number).collect::<Vec<_>>(), vec![101, 109]);
    let gaps = store.gaps();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].block_number, 105);
    assert_eq!(gaps[0].reason, "forced decode failure");
    // the gap does not hold the checkpoint back
    assert_eq!(store.checkpoint(INDEXER_STREAM).unwrap().block_number, 109);
}

/// A restart constructs a fresh coordinator over the surviving store; the
/// sequencer must resume past the persisted maximum.
#[tokio::test]
async fn restart_resumes_checkpoints_and_sequences() {
    init_tracing();
    let store = Arc::new(MemStore::new(64));
    let chain = StubChain::new(124, vec![101, 105, 109]);
    let first = coordinator(chain, Arc::clone(&store), vec![]).await;
    first.run_cycle(&CancellationToken::new()).await.unwrap();
    drop(first);

    // the chain advanced while we were down; one new log at 112
    let chain = StubChain::new(130, vec![101, 105, 109, 112]);
    let second = coordinator(chain, Arc::clone(&store), vec![]).await;
    second.run_cycle(&CancellationToken::new()).await.unwrap();

    let events = store.events();
    assert_eq!(
        events.iter().map(|e| (e.sequence, e.block_number)).collect::<Vec<_>>(),
        vec![(1, 101), (2, 105), (3, 109), (4, 112)]
    );
    assert_eq!(store.checkpoint(INDEXER_STREAM).unwrap().block_number, 115);
    assert_eq!(store.checkpoint(&stage_stream("aggregate")).unwrap().block_number, 115);
}

/// Blocks 109+ leave the canonical chain. The next cycle must roll back to
/// the highest ring entry still canonical (107), rescan, and re-commit the
/// replacement event under the new block hash.
#[tokio::test]
async fn reorg_rolls_back_to_common_ancestor_and_rescans() {
    init_tracing();
    let store = Arc::new(MemStore::new(64));
    let chain = StubChain::new(124, vec![101, 105, 109]);
    let original_109 = chain.block_hash(109);
    let first = coordinator(chain.clone(), Arc::clone(&store), vec![]).await;
    first.run_cycle(&CancellationToken::new()).await.unwrap();
    drop(first);

    let mut reorged = chain;
    reorged.forked_from = Some(109);
    let new_109 = reorged.block_hash(109);
    assert_ne!(original_109, new_109);
    let second = coordinator(reorged, Arc::clone(&store), vec![]).await;
    second.run_cycle(&CancellationToken::new()).await.unwrap();

    let events = store.events();
    assert_eq!(events.iter().map(|e| e.block_number).collect::<Vec<_>>(), vec![101, 105, 109]);
    let replacement = events.iter().find(|e| e.block_number == 109).unwrap();
    assert_eq!(replacement.block_hash, new_109);
    // the replacement was committed after the rollback, so it carries a fresh
    // sequence number
    assert!(replacement.sequence > 3);

    let indexed = store.checkpoint(INDEXER_STREAM).unwrap();
    assert_eq!(indexed.block_number, 109);
    assert_eq!(indexed.block_hash, Some(new_109));
}

/// Delegates to [`StubChain`], cancelling the token once the scan reaches
/// `cancel_from`, so shutdown lands while jobs are still in flight.
struct CancellingChain {
    inner: StubChain,
    cancel_from: u64,
    token: CancellationToken,
}

#[async_trait]
impl ChainReader for CancellingChain {
    async fn fetch_blocks(&self, numbers: &[u64]) -> Result<HashMap<u64, BlockInfo>, FetchError> {
        self.inner.fetch_blocks(numbers).await
    }

    async fn fetch_logs(&self, range: BlockRange, filter: &Filter) -> Result<Vec<Log>, FetchError> {
        if range.start() >= self.cancel_from {
            self.token.cancel();
        }
        self.inner.fetch_logs(range, filter).await
    }

    async fn fetch_token_metadata(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, TokenMeta>, FetchError> {
        self.inner.fetch_token_metadata(addresses).await
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        self.inner.latest_block().await
    }
}

/// Shutdown while jobs are in flight must never strand a half-committed
/// range: checkpoints rest only on job boundaries, every event at or below
/// the indexer checkpoint was committed with it, none above it survive, and
/// stage records stay consistent with the stage checkpoint.
#[tokio::test]
async fn cancellation_mid_cycle_leaves_no_partial_commit() {
    init_tracing();
    let store = Arc::new(MemStore::new(64));
    let token = CancellationToken::new();
    let chain = CancellingChain {
        inner: StubChain::new(124, vec![101, 105, 109]),
        cancel_from: 108,
        token: token.clone(),
    };
    let coordinator = coordinator_on(Arc::new(chain), Arc::clone(&store), vec![]).await;

    tokio::time::timeout(Duration::from_secs(5), coordinator.run(token))
        .await
        .expect("run must stop after cancellation")
        .expect("cancelled run is not an error");

    // 100..=109 split by a batch size of 4 commits at 103, 107 and 109
    let indexed = store.checkpoint(INDEXER_STREAM).map(|cp| cp.block_number).unwrap_or(99);
    assert!([99, 103, 107, 109].contains(&indexed), "checkpoint off a job boundary: {indexed}");

    let events = store.events();
    let expected: Vec<u64> = [101, 105, 109].into_iter().filter(|&b| b <= indexed).collect();
    assert_eq!(events.iter().map(|e| e.block_number).collect::<Vec<_>>(), expected);

    match store.checkpoint(&stage_stream("aggregate")) {
        Some(staged) => {
            assert!(staged.block_number <= indexed);
            let processed =
                events.iter().filter(|e| e.block_number <= staged.block_number).count();
            assert_eq!(store.records().len(), processed);
        }
        None => assert!(store.records().is_empty()),
    }
}

#[tokio::test]
async fn cancelled_token_stops_the_run_loop_promptly() {
    init_tracing();
    let store = Arc::new(MemStore::new(64));
    let chain = StubChain::new(124, vec![101, 105, 109]);
    let coordinator = coordinator(chain, store, vec![]).await;

    let token = CancellationToken::new();
    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), coordinator.run(token))
        .await
        .expect("run must return promptly")
        .expect("cancelled run is not an error");
}
