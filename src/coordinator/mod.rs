//! The control loop tying the pipeline together.
//!
//! Each cycle polls the chain head, publishes the safe head, rechecks for
//! reorgs, then runs the scan phase (Filter → Indexer over new blocks) and
//! the compute phase (each processor stage over newly indexed events). Both
//! phases partition their span into jobs, fan them out over a worker pool,
//! and commit results strictly in assignment order.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::XQueryConfig,
    error::{FetchError, XQueryError},
    event::{
        EventFilter, EventIndexer, IndexedBatch, MaterializedRecord, ProcessorStage, Sequencer,
        XGraph, index_logs,
    },
    fetch::FetchService,
    range::BlockRange,
    reorg::ReorgMonitor,
    store::StateStore,
    types::{Checkpoint, INDEXER_STREAM, RecentBlock, stage_stream},
};

mod commit_queue;
mod worker;

use worker::{Job, JobCommitter, JobRunner, PoolSettings, run_pool};

pub struct Coordinator {
    config: XQueryConfig,
    graph: XGraph,
    fetch: Arc<FetchService>,
    store: Arc<dyn StateStore>,
    sequencer: Sequencer,
    reorg: ReorgMonitor,
}

impl Coordinator {
    /// Validates the configuration and seeds the sequencer from the store.
    pub async fn new(
        config: XQueryConfig,
        graph: XGraph,
        fetch: Arc<FetchService>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, XQueryError> {
        config.validate()?;
        let sequencer = Sequencer::new(store.max_sequence().await?);
        let reorg = ReorgMonitor::new(Arc::clone(&fetch), Arc::clone(&store));
        Ok(Self { config, graph, fetch, store, sequencer, reorg })
    }

    /// Runs cycles until `token` is cancelled.
    ///
    /// The first cycle's error is fatal so misconfiguration surfaces at
    /// startup; afterwards a failed cycle is logged and retried on the next
    /// poll.
    pub async fn run(&self, token: CancellationToken) -> Result<(), XQueryError> {
        let mut first_cycle = true;
        while !token.is_cancelled() {
            match self.run_cycle(&token).await {
                Ok(()) => {}
                Err(err) if first_cycle => return Err(err),
                Err(err) => error!(error = %err, "cycle failed, retrying next poll"),
            }
            first_cycle = false;
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!("coordinator stopped");
        Ok(())
    }

    /// One head-poll / reorg-check / scan / compute round.
    pub async fn run_cycle(&self, token: &CancellationToken) -> Result<(), XQueryError> {
        let latest = self.fetch.latest_block().await?;
        let safe_head = latest.saturating_sub(self.config.confirmation_depth);
        self.fetch.set_safe_head(safe_head);
        debug!(latest, safe_head, "cycle start");

        if let Some(ancestor) = self.reorg.check().await? {
            warn!(ancestor, "reorg detected, rolling back");
            self.store.rollback_to(ancestor).await?;
            for stage in &self.graph.stages {
                stage.rollback(ancestor).await.map_err(|source| XQueryError::Stage {
                    stage: stage.name().to_owned(),
                    source,
                })?;
            }
        }

        self.scan_phase(safe_head, token).await?;
        self.compute_phase(token).await?;
        Ok(())
    }

    async fn scan_phase(
        &self,
        safe_head: u64,
        token: &CancellationToken,
    ) -> Result<(), XQueryError> {
        let from = match self.store.load_checkpoint(INDEXER_STREAM).await? {
            Some(checkpoint) => checkpoint.block_number + 1,
            None => self.config.start_block,
        };
        if from > safe_head {
            debug!(from, safe_head, "no confirmed blocks to scan");
            return Ok(());
        }
        let span = BlockRange::new(from, safe_head);
        let jobs = make_jobs(span, self.config.max_batch_size);
        info!(span = %span, jobs = jobs.len(), "scan phase");

        let runner = Arc::new(ScanRunner {
            fetch: Arc::clone(&self.fetch),
            filter: Arc::clone(&self.graph.filter),
            indexer: Arc::clone(&self.graph.indexer),
        });
        let mut committer = ScanCommitter {
            fetch: Arc::clone(&self.fetch),
            store: Arc::clone(&self.store),
            sequencer: &self.sequencer,
        };
        run_pool(runner, &mut committer, jobs, &self.pool_settings(), token).await
    }

    async fn compute_phase(&self, token: &CancellationToken) -> Result<(), XQueryError> {
        let Some(indexed_to) = self.store.load_checkpoint(INDEXER_STREAM).await? else {
            return Ok(());
        };
        for stage in &self.graph.stages {
            if token.is_cancelled() {
                break;
            }
            let stream = stage_stream(stage.name());
            let from = match self.store.load_checkpoint(&stream).await? {
                Some(checkpoint) => checkpoint.block_number + 1,
                None => self.config.start_block,
            };
            if from > indexed_to.block_number {
                continue;
            }
            let span = BlockRange::new(from, indexed_to.block_number);
            let jobs = make_jobs(span, self.config.max_batch_size);
            info!(stage = stage.name(), span = %span, jobs = jobs.len(), "compute phase");

            let runner = Arc::new(StageRunner {
                store: Arc::clone(&self.store),
                stage: Arc::clone(stage),
            });
            let mut committer =
                StageCommitter { store: Arc::clone(&self.store), stage: Arc::clone(stage), stream };
            run_pool(runner, &mut committer, jobs, &self.pool_settings(), token).await?;
        }
        Ok(())
    }

    fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.config.workers,
            retry_limit: self.config.commit_retry_limit,
            head_lag_backoff: self.config.head_lag_backoff,
            shutdown_grace: self.config.shutdown_grace,
        }
    }
}

fn make_jobs(span: BlockRange, max_batch_size: u64) -> Vec<Job> {
    span.split(max_batch_size)
        .into_iter()
        .enumerate()
        .map(|(id, range)| Job { id: id as u64, range })
        .collect()
}

/// Scan-phase worker: Filter → Indexer over one range. Read-only.
struct ScanRunner {
    fetch: Arc<FetchService>,
    filter: Arc<dyn EventFilter>,
    indexer: Arc<dyn EventIndexer>,
}

#[async_trait]
impl JobRunner for ScanRunner {
    type Output = IndexedBatch;

    async fn run(&self, range: BlockRange) -> Result<IndexedBatch, XQueryError> {
        let logs = self.filter.fetch_logs(&self.fetch, range).await?;
        Ok(index_logs(self.indexer.as_ref(), &logs))
    }
}

/// Scan-phase committer: stamps sequences and persists events, gaps,
/// checkpoint and the recent-blocks ring in one transaction.
struct ScanCommitter<'a> {
    fetch: Arc<FetchService>,
    store: Arc<dyn StateStore>,
    sequencer: &'a Sequencer,
}

#[async_trait]
impl JobCommitter<IndexedBatch> for ScanCommitter<'_> {
    async fn commit(&mut self, range: BlockRange, batch: IndexedBatch) -> Result<(), XQueryError> {
        let end = range.end();
        let blocks = self.fetch.get_blocks(&[end]).await?;
        let end_info = blocks.get(&end).copied().ok_or(FetchError::BlockNotFound(end))?;

        let mut events = batch.events;
        self.sequencer.stamp(&mut events);

        let mut ring: BTreeMap<u64, RecentBlock> = events
            .iter()
            .map(|e| (e.block_number, RecentBlock { number: e.block_number, hash: e.block_hash }))
            .collect();
        ring.insert(end, RecentBlock { number: end, hash: end_info.hash });
        let recent: Vec<RecentBlock> = ring.into_values().collect();

        let checkpoint = Checkpoint {
            name: INDEXER_STREAM.to_owned(),
            block_number: end,
            block_hash: Some(end_info.hash),
        };
        self.store.commit_indexed(&events, &batch.gaps, &checkpoint, &recent).await?;
        info!(range = %range, events = events.len(), gaps = batch.gaps.len(), "range indexed");
        Ok(())
    }
}

/// Compute-phase worker: one stage over one range of committed events.
struct StageRunner {
    store: Arc<dyn StateStore>,
    stage: Arc<dyn ProcessorStage>,
}

#[async_trait]
impl JobRunner for StageRunner {
    type Output = Vec<Box<dyn MaterializedRecord>>;

    async fn run(
        &self,
        range: BlockRange,
    ) -> Result<Vec<Box<dyn MaterializedRecord>>, XQueryError> {
        let events = self.store.load_events(range).await?;
        self.stage.process(&events).await.map_err(|source| XQueryError::Stage {
            stage: self.stage.name().to_owned(),
            source,
        })
    }
}

struct StageCommitter {
    store: Arc<dyn StateStore>,
    stage: Arc<dyn ProcessorStage>,
    stream: String,
}

#[async_trait]
impl JobCommitter<Vec<Box<dyn MaterializedRecord>>> for StageCommitter {
    async fn commit(
        &mut self,
        range: BlockRange,
        records: Vec<Box<dyn MaterializedRecord>>,
    ) -> Result<(), XQueryError> {
        let checkpoint =
            Checkpoint { name: self.stream.clone(), block_number: range.end(), block_hash: None };
        self.store.commit_stage(self.stage.name(), &records, &checkpoint).await?;
        info!(stage = self.stage.name(), range = %range, records = records.len(), "range processed");
        Ok(())
    }
}

/// A token cancelled by SIGINT or SIGTERM, for wiring [`Coordinator::run`]
/// into a binary's shutdown path.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        let interrupt = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "cannot listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = interrupt => info!("interrupt received, shutting down"),
            () = terminate => info!("terminate received, shutting down"),
        }
        signal_token.cancel();
    });
    token
}
