use crate::types::{JobRequest, VerdictPayload};
use ::redis::{AsyncCommands, Direction, RedisResult};

/// Redis queue semantics - defines only semantics, not runtime logic
/// Keeps producers and workers agreeing on key names and claim/ack rules

pub const KEY_PREFIX: &str = "ojudge";
pub const RESULT_CHANNEL_PREFIX: &str = "ojudge:result";

/// The four judge queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Official code submissions
    Problem,
    /// Interactive code test runs
    TestProblem,
    /// Official SQL submissions
    Mysql,
    /// Interactive SQL test runs
    TestMysql,
}

impl Queue {
    pub const ALL: [Queue; 4] = [
        Queue::Problem,
        Queue::TestProblem,
        Queue::Mysql,
        Queue::TestMysql,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Queue::Problem => "problem-queue",
            Queue::TestProblem => "test-problem-queue",
            Queue::Mysql => "mysql-queue",
            Queue::TestMysql => "mysql-test-queue",
        }
    }

    pub fn is_sql(&self) -> bool {
        matches!(self, Queue::Mysql | Queue::TestMysql)
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, Queue::TestProblem | Queue::TestMysql)
    }

    /// Producer-side routing: SQL vs code, official vs test run
    pub fn for_job(job: &JobRequest) -> Queue {
        match (job.is_sql(), job.submitted_id.is_some()) {
            (true, true) => Queue::Mysql,
            (true, false) => Queue::TestMysql,
            (false, true) => Queue::Problem,
            (false, false) => Queue::TestProblem,
        }
    }

    pub fn from_name(name: &str) -> Option<Queue> {
        Queue::ALL.into_iter().find(|q| q.name() == name)
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pending list for a queue
pub fn queue_key(queue: Queue) -> String {
    format!("{}:queue:{}", KEY_PREFIX, queue.name())
}

/// Jobs claimed by a worker but not yet acknowledged
pub fn processing_key(queue: Queue) -> String {
    format!("{}:processing", queue_key(queue))
}

/// Pub/sub channel an interactive session listens on
pub fn result_channel(session_token: &str) -> String {
    format!("{}:{}", RESULT_CHANNEL_PREFIX, session_token)
}

/// A job moved onto the processing list.
/// Keeps the exact payload so the acknowledgement removes the same entry.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JobRequest,
    raw: String,
}

impl ClaimedJob {
    pub fn new(job: JobRequest, raw: String) -> Self {
        Self { job, raw }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn type_error(what: &'static str, e: serde_json::Error) -> ::redis::RedisError {
    ::redis::RedisError::from((::redis::ErrorKind::TypeError, what, e.to_string()))
}

/// Push a job to the tail of its queue (FIFO)
pub async fn push_job(
    conn: &mut ::redis::aio::ConnectionManager,
    queue: Queue,
    job: &JobRequest,
) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(|e| type_error("serialization error", e))?;
    conn.rpush(queue_key(queue), payload).await
}

/// Claim the head of a queue, blocking up to `timeout_seconds`.
/// The entry stays on the processing list until [`ack_job`].
/// An undecodable entry is dropped from the processing list and reported as an error.
pub async fn claim_job(
    conn: &mut ::redis::aio::ConnectionManager,
    queue: Queue,
    timeout_seconds: f64,
) -> RedisResult<Option<ClaimedJob>> {
    let processing = processing_key(queue);
    let payload: Option<String> = conn
        .blmove(
            queue_key(queue),
            &processing,
            Direction::Left,
            Direction::Right,
            timeout_seconds,
        )
        .await?;

    let Some(raw) = payload else {
        return Ok(None);
    };

    match serde_json::from_str::<JobRequest>(&raw) {
        Ok(job) => Ok(Some(ClaimedJob { job, raw })),
        Err(e) => {
            let _: i64 = conn.lrem(&processing, 1, &raw).await?;
            Err(type_error("deserialization error", e))
        }
    }
}

/// Remove a finished job from the processing list
pub async fn ack_job(
    conn: &mut ::redis::aio::ConnectionManager,
    queue: Queue,
    claimed: &ClaimedJob,
) -> RedisResult<()> {
    let _: i64 = conn.lrem(processing_key(queue), 1, claimed.raw()).await?;
    Ok(())
}

/// Move jobs left on the processing list by a dead worker back to the head of the queue.
/// Returns how many were moved.
pub async fn recover_in_flight(
    conn: &mut ::redis::aio::ConnectionManager,
    queue: Queue,
) -> RedisResult<usize> {
    let processing = processing_key(queue);
    let pending = queue_key(queue);
    let mut moved = 0;
    loop {
        let entry: Option<String> = conn
            .lmove(&processing, &pending, Direction::Right, Direction::Left)
            .await?;
        if entry.is_none() {
            return Ok(moved);
        }
        moved += 1;
    }
}

/// `(pending, processing)` lengths of a queue
pub async fn queue_depth(
    conn: &mut ::redis::aio::ConnectionManager,
    queue: Queue,
) -> RedisResult<(usize, usize)> {
    let pending: usize = conn.llen(queue_key(queue)).await?;
    let processing: usize = conn.llen(processing_key(queue)).await?;
    Ok((pending, processing))
}

/// Publish a verdict to an interactive session. Nobody acknowledges it.
pub async fn publish_result(
    conn: &mut ::redis::aio::ConnectionManager,
    session_token: &str,
    payload: &VerdictPayload,
) -> RedisResult<()> {
    let message = serde_json::to_string(payload).map_err(|e| type_error("serialization error", e))?;
    let _: i64 = conn.publish(result_channel(session_token), message).await?;
    Ok(())
}
