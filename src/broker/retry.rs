use std::future::Future;
use std::io;

use tracing::{debug, warn};

use crate::broker::session::BrokerSession;
use crate::utils::{Error, Result};

/// How the retry wrapper treats a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The connection went away. Worth a reconnect and another attempt.
    Recoverable,
    Fatal,
}

/// Decides which failures count as "connection lost".
///
/// `ConnectionBad` and the broker closing the stream are always recoverable.
/// Raw I/O errors are recoverable when their kind is listed here; the default
/// list is `BrokenPipe` and `ConnectionReset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    recoverable: Vec<io::ErrorKind>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            recoverable: vec![io::ErrorKind::BrokenPipe, io::ErrorKind::ConnectionReset],
        }
    }
}

impl RecoveryPolicy {
    /// Only a broken pipe is recoverable.
    pub fn strict() -> Self {
        Self {
            recoverable: vec![io::ErrorKind::BrokenPipe],
        }
    }

    pub fn with_kind(mut self, kind: io::ErrorKind) -> Self {
        if !self.recoverable.contains(&kind) {
            self.recoverable.push(kind);
        }
        self
    }

    pub fn kinds(&self) -> &[io::ErrorKind] {
        &self.recoverable
    }

    pub fn classify(&self, err: &Error) -> Outcome {
        match err {
            Error::ConnectionBad | Error::EndOfStream => Outcome::Recoverable,
            Error::Io(e) if self.recoverable.contains(&e.kind()) => Outcome::Recoverable,
            _ => Outcome::Fatal,
        }
    }
}

/// Runs `op` until it succeeds or fails for a reason the session's recovery
/// policy does not cover.
///
/// On a recoverable failure the session's `ConnectionLostHandler` is awaited
/// and `op` is attempted again. Without a handler, or once the session has been
/// closed, the failure is returned unchanged. There is no attempt limit.
pub async fn retry_on_send<T, F, Fut>(session: &BrokerSession, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if session.is_closed() {
            return Err(err);
        }
        let Some(handler) = session.lost_handler() else {
            return Err(err);
        };
        if session.policy().classify(&err) == Outcome::Fatal {
            debug!(endpoint = %session.endpoint(), error = %err, "operation failed, not retrying");
            return Err(err);
        }

        warn!(
            endpoint = %session.endpoint(),
            attempt,
            error = %err,
            "connection lost during operation, waiting for recovery"
        );
        handler.on_disconnected(session).await;
    }
}
