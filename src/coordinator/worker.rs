use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{FetchError, XQueryError},
    range::BlockRange,
};

use super::commit_queue::CommitQueue;

/// One unit of work: a sub-range under a pool-local id. Ids are assigned in
/// range order and commits happen in id order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Job {
    pub id: u64,
    pub range: BlockRange,
}

struct JobResult<T> {
    id: u64,
    range: BlockRange,
    outcome: Result<T, XQueryError>,
}

/// The read-only half of a job, run concurrently by the workers.
#[async_trait]
pub(crate) trait JobRunner: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn run(&self, range: BlockRange) -> Result<Self::Output, XQueryError>;
}

/// The write half, run by the single dispatcher in job-id order.
#[async_trait]
pub(crate) trait JobCommitter<T>: Send {
    async fn commit(&mut self, range: BlockRange, output: T) -> Result<(), XQueryError>;
}

pub(crate) struct PoolSettings {
    pub workers: usize,
    pub retry_limit: u32,
    pub head_lag_backoff: Duration,
    pub shutdown_grace: Duration,
}

/// Runs `jobs` over `settings.workers` tasks and commits the results in
/// assignment order.
///
/// Failed jobs (fetch or commit) are re-queued under their original id, which
/// parks every later result until the retry lands; a job that failed because
/// its range ran ahead of the head waits `head_lag_backoff` first. On
/// cancellation the dispatcher stops committing, lets workers finish their
/// current job for up to `shutdown_grace`, then abandons the rest.
pub(crate) async fn run_pool<R: JobRunner>(
    runner: Arc<R>,
    committer: &mut (dyn JobCommitter<R::Output> + '_),
    jobs: Vec<Job>,
    settings: &PoolSettings,
    token: &CancellationToken,
) -> Result<(), XQueryError> {
    if jobs.is_empty() {
        return Ok(());
    }
    let first_id = jobs[0].id;
    let total = jobs.len() as u64;

    let (job_tx, job_rx) = mpsc::channel::<Job>(jobs.len() + settings.workers);
    let (result_tx, mut result_rx) = mpsc::channel::<JobResult<R::Output>>(jobs.len());
    for job in &jobs {
        // capacity covers every job, so this never blocks
        let _ = job_tx.send(*job).await;
    }

    let job_rx = Arc::new(Mutex::new(job_rx));
    let mut workers = JoinSet::new();
    for worker_id in 0..settings.workers {
        let runner = Arc::clone(&runner);
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let token = token.clone();
        workers.spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                let job = { job_rx.lock().await.recv().await };
                let Some(job) = job else { break };
                debug!(worker = worker_id, job = job.id, range = %job.range, "job started");
                let outcome = runner.run(job.range).await;
                let result = JobResult { id: job.id, range: job.range, outcome };
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut queue: CommitQueue<(BlockRange, R::Output)> = CommitQueue::new(first_id);
    let mut attempts: HashMap<u64, u32> = HashMap::new();

    let outcome = 'pool: loop {
        if queue.next_id() == first_id + total {
            break Ok(());
        }
        let result = tokio::select! {
            () = token.cancelled() => break Ok(()),
            result = result_rx.recv() => result,
        };
        let Some(result) = result else {
            if token.is_cancelled() {
                break Ok(());
            }
            break Err(XQueryError::WorkersStopped);
        };
        match result.outcome {
            Ok(output) => {
                queue.push(result.id, (result.range, output));
                debug!(job = result.id, parked = queue.parked_len(), "result parked");
                while let Some((id, (range, output))) = queue.take_ready() {
                    match committer.commit(range, output).await {
                        Ok(()) => {
                            queue.advance();
                            attempts.remove(&id);
                        }
                        Err(err) => {
                            let tries = bump(&mut attempts, id);
                            if tries > settings.retry_limit {
                                break 'pool Err(XQueryError::CommitRetriesExhausted {
                                    start: range.start(),
                                    end: range.end(),
                                    attempts: tries,
                                });
                            }
                            warn!(job = id, error = %err, "commit failed, re-running job");
                            let _ = job_tx.send(Job { id, range }).await;
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                let tries = bump(&mut attempts, result.id);
                if tries > settings.retry_limit {
                    break Err(err);
                }
                if matches!(&err, XQueryError::Fetch(FetchError::BlockNotFound(_))) {
                    info!(job = result.id, range = %result.range, "range ahead of head, backing off");
                    tokio::time::sleep(settings.head_lag_backoff).await;
                } else {
                    warn!(job = result.id, error = %err, "job failed, re-queueing");
                }
                let _ = job_tx.send(Job { id: result.id, range: result.range }).await;
            }
        }
    };

    drop(job_tx);
    let drained = timeout(settings.shutdown_grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("shutdown grace elapsed, abandoning in-flight jobs");
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }
    outcome
}

fn bump(attempts: &mut HashMap<u64, u32>, id: u64) -> u32 {
    let entry = attempts.entry(id).or_insert(0);
    *entry += 1;
    *entry
}
