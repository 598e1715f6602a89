/// Work Dispatcher - bounded worker pools over the judge queues
///
/// Each queue gets its own fixed number of workers. A worker claims one job,
/// judges it, hands the verdict to the store or the client session, and
/// acknowledges the job whether or not judging succeeded. Nothing is retried.
///
/// Claimed jobs sit on a processing list until acknowledged, so a job that was
/// in flight when the process died is put back on its queue at next start.

use crate::notifier::Notifier;
use crate::pipeline::Judge;
use crate::store::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ojudge_common::redis::{self as queue_ops, ClaimedJob, Queue};
use ojudge_common::types::{JobMode, JobRequest, Verdict, VerdictKind};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// Seconds a claim blocks before the worker re-checks for shutdown
pub const CLAIM_TIMEOUT_SECS: f64 = 5.0;

/// One worker's handle on the queues
#[async_trait]
pub trait WorkerQueue: Send {
    async fn claim(&mut self, queue: Queue) -> Result<Option<ClaimedJob>>;
    async fn ack(&mut self, queue: Queue, claimed: &ClaimedJob) -> Result<()>;
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// A dedicated handle per worker, since a blocking claim holds its connection
    async fn connect(&self) -> Result<Box<dyn WorkerQueue>>;

    /// Requeue jobs left in flight by a previous run
    async fn recover(&self, queue: Queue) -> Result<usize>;
}

pub struct RedisJobSource {
    client: redis::Client,
    claim_timeout_secs: f64,
}

impl RedisJobSource {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            claim_timeout_secs: CLAIM_TIMEOUT_SECS,
        }
    }
}

struct RedisWorkerQueue {
    conn: ConnectionManager,
    claim_timeout_secs: f64,
}

#[async_trait]
impl WorkerQueue for RedisWorkerQueue {
    async fn claim(&mut self, queue: Queue) -> Result<Option<ClaimedJob>> {
        Ok(queue_ops::claim_job(&mut self.conn, queue, self.claim_timeout_secs).await?)
    }

    async fn ack(&mut self, queue: Queue, claimed: &ClaimedJob) -> Result<()> {
        Ok(queue_ops::ack_job(&mut self.conn, queue, claimed).await?)
    }
}

#[async_trait]
impl JobSource for RedisJobSource {
    async fn connect(&self) -> Result<Box<dyn WorkerQueue>> {
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .context("Failed to connect to Redis")?;
        Ok(Box::new(RedisWorkerQueue {
            conn,
            claim_timeout_secs: self.claim_timeout_secs,
        }))
    }

    async fn recover(&self, queue: Queue) -> Result<usize> {
        let mut conn = ConnectionManager::new(self.client.clone())
            .await
            .context("Failed to connect to Redis")?;
        Ok(queue_ops::recover_in_flight(&mut conn, queue).await?)
    }
}

/// Judges one job and routes the verdict by job mode
pub struct JobHandler {
    judge: Arc<dyn Judge>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl JobHandler {
    pub fn new(judge: Arc<dyn Judge>, store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            judge,
            store,
            notifier,
        }
    }

    pub async fn handle(&self, queue: Queue, job: &JobRequest) -> Result<VerdictKind> {
        let mode = job
            .mode()
            .context("Job has neither a submission id nor a session token")?;

        info!(
            queue = %queue,
            problem_id = job.problem_id,
            language = %job.language,
            "Start process problem [ {} ]",
            job.label()
        );
        if let Some(enqueued_at) = job.enqueued_at {
            let waited = Utc::now().signed_duration_since(enqueued_at);
            info!(queue = %queue, queue_ms = waited.num_milliseconds(), "Queue latency");
        }

        let started = Instant::now();
        let verdict = self.judge.judge(job).await?;
        let kind = verdict.kind();

        match mode {
            JobMode::Persisted(submission_id) => {
                self.persist(submission_id, &job.language, &verdict).await?
            }
            JobMode::Interactive(token) => {
                self.notifier.deliver(&token, &verdict.to_payload()).await
            }
        }

        info!(
            queue = %queue,
            status = %kind,
            process_ms = started.elapsed().as_millis() as u64,
            "End process problem [ {} ]",
            job.label()
        );
        Ok(kind)
    }

    async fn persist(&self, submission_id: i64, language: &str, verdict: &Verdict) -> Result<()> {
        match verdict {
            Verdict::Accepted { metrics, .. } => {
                let (runtime, memory) = metrics.runtime_and_memory();
                self.store
                    .record_accepted(submission_id, verdict.kind(), language, runtime, memory)
                    .await
            }
            _ => {
                self.store
                    .record_rejected(submission_id, verdict.kind(), verdict.diagnostic())
                    .await
            }
        }
    }
}

pub struct Dispatcher {
    source: Arc<dyn JobSource>,
    handler: Arc<JobHandler>,
    pools: Vec<(Queue, usize)>,
}

impl Dispatcher {
    pub fn new(source: Arc<dyn JobSource>, handler: Arc<JobHandler>) -> Self {
        Self {
            source,
            handler,
            pools: Vec::new(),
        }
    }

    pub fn with_pool(mut self, queue: Queue, workers: usize) -> Self {
        self.pools.push((queue, workers.max(1)));
        self
    }

    /// Run every pool until `shutdown` flips to true. In-progress jobs finish first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        for (queue, _) in &self.pools {
            let moved = self
                .source
                .recover(*queue)
                .await
                .with_context(|| format!("Failed to recover in-flight jobs of {}", queue))?;
            if moved > 0 {
                warn!(queue = %queue, jobs = moved, "Requeued jobs left in flight");
            }
        }

        let mut workers = JoinSet::new();
        for (queue, count) in &self.pools {
            for worker_id in 0..*count {
                let conn = self.source.connect().await?;
                workers.spawn(worker_loop(
                    *queue,
                    worker_id,
                    conn,
                    self.handler.clone(),
                    shutdown.clone(),
                ));
            }
            info!(queue = %queue, workers = count, "Worker pool started");
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        Ok(())
    }
}

#[instrument(skip(conn, handler, shutdown), fields(queue = %queue))]
async fn worker_loop(
    queue: Queue,
    worker_id: usize,
    mut conn: Box<dyn WorkerQueue>,
    handler: Arc<JobHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = tokio::select! {
            _ = shutdown.changed() => break,
            claimed = conn.claim(queue) => claimed,
        };

        match claimed {
            Ok(Some(claimed)) => {
                let job = claimed.job.clone();
                let job_handler = handler.clone();
                // A panic in judging must not take the worker down with it
                let task = tokio::spawn(async move { job_handler.handle(queue, &job).await });

                match task.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        error!(job = %claimed.job.label(), error = %format!("{:#}", e), "Job failed");
                    }
                    Err(e) => {
                        error!(job = %claimed.job.label(), error = %e, "Job handler panicked");
                    }
                }

                if let Err(e) = conn.ack(queue, &claimed).await {
                    error!(job = %claimed.job.label(), error = %e, "Failed to acknowledge job");
                }
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    info!(worker_id, "Worker stopped");
}
