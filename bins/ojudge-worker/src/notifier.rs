// Result delivery for interactive test runs
use async_trait::async_trait;
use ojudge_common::redis::publish_result;
use ojudge_common::types::VerdictPayload;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// Pushes a verdict to the client session that asked for it.
/// Fire-and-forget: nothing is retried and errors are only logged.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, session_token: &str, payload: &VerdictPayload);
}

pub struct RedisNotifier {
    conn: ConnectionManager,
}

impl RedisNotifier {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn deliver(&self, session_token: &str, payload: &VerdictPayload) {
        // ConnectionManager is a cheap multiplexed handle
        let mut conn = self.conn.clone();
        match publish_result(&mut conn, session_token, payload).await {
            Ok(()) => debug!(session = %session_token, status = %payload.status, "Result delivered"),
            Err(e) => warn!(session = %session_token, error = %e, "Failed to deliver result"),
        }
    }
}
