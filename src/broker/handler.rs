use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::broker::session::BrokerSession;

/// Policy invoked when a session loses its connection.
///
/// `on_disconnected` must not return until the session is usable again
/// (typically by calling `BrokerSession::reconnect`) or the handler has given
/// up. The caller retries right after it returns and does not bound the number
/// of attempts, so a handler that returns immediately without reconnecting
/// produces a busy loop.
#[async_trait]
pub trait ConnectionLostHandler: Send + Sync {
    async fn on_disconnected(&self, session: &BrokerSession);
}

/// Waits a fixed delay, then reconnects.
#[derive(Debug)]
pub struct FixedDelayReconnect {
    delay: Duration,
    attempts: AtomicU64,
}

impl FixedDelayReconnect {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            attempts: AtomicU64::new(0),
        }
    }

    /// Reconnect attempts made so far, across all sessions.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionLostHandler for FixedDelayReconnect {
    async fn on_disconnected(&self, session: &BrokerSession) {
        warn!(
            endpoint = %session.endpoint(),
            delay_ms = self.delay.as_millis() as u64,
            "connection lost, reconnecting"
        );
        tokio::time::sleep(self.delay).await;
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        match session.reconnect().await {
            Ok(()) => info!(endpoint = %session.endpoint(), attempt, "reconnected"),
            Err(e) => warn!(endpoint = %session.endpoint(), attempt, error = %e, "failed to reconnect"),
        }
    }
}
