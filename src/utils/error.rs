//! The `error` module defines the error type shared by every layer of `stompsub`.
//!
//! Protocol sentinels (`ConnectionBad`, `DuplicateSubscription`,
//! `MissingDestination`, `MissingSubscriptionId`) are plain variants so callers
//! can match on them directly; `category()` folds every variant into the coarse
//! taxonomy used when deciding whether a failure is worth retrying.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid broker address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("destination is required")]
    MissingDestination,

    #[error("subscription id is required")]
    MissingSubscriptionId,

    #[error("unknown ack mode {0:?} (expected auto, client-individual or client)")]
    InvalidAckMode(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{host} did not resolve to any address")]
    NoAddresses { host: String },

    #[error("failed to connect to {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: Box<Error>,
    },

    /// The broker answered CONNECT with an ERROR frame.
    #[error("broker rejected the connection: {0}")]
    Rejected(String),

    /// The protocol session is unusable: never established, torn down, or a
    /// previous reconnect attempt failed.
    #[error("connection to the broker is not established")]
    ConnectionBad,

    #[error("broker closed the connection")]
    EndOfStream,

    #[error("subscription id {0:?} is already in use on this connection")]
    DuplicateSubscription(String),

    /// ERROR frame received after the handshake.
    #[error("broker error: {0}")]
    Broker(String),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("broker session has been closed")]
    SessionClosed,

    #[error("the broker session that delivered this message no longer exists")]
    SessionGone,

    /// A received frame lacks a header needed to answer it.
    #[error("message has no {0} header")]
    MissingHeader(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before any network call was made.
    Configuration,
    /// Address resolution, dialing or handshake failure.
    Dial,
    /// The connection went away; recoverable through reconnection.
    ConnectionLost,
    /// Expected when one host is reachable through several addresses.
    DuplicateSubscription,
    /// Raw I/O failure; whether it is recoverable is a policy decision.
    Transport,
    Protocol,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidAddress { .. }
            | Error::MissingDestination
            | Error::MissingSubscriptionId
            | Error::InvalidAckMode(_)
            | Error::Tls(_) => ErrorCategory::Configuration,
            Error::Resolve { .. }
            | Error::NoAddresses { .. }
            | Error::Dial { .. }
            | Error::Rejected(_) => ErrorCategory::Dial,
            Error::ConnectionBad | Error::EndOfStream => ErrorCategory::ConnectionLost,
            Error::DuplicateSubscription(_) => ErrorCategory::DuplicateSubscription,
            Error::Io(_) => ErrorCategory::Transport,
            Error::Broker(_)
            | Error::Protocol(_)
            | Error::MissingHeader(_)
            | Error::SessionClosed
            | Error::SessionGone => ErrorCategory::Protocol,
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol(reason.into())
    }

    pub(crate) fn tls(reason: impl std::fmt::Display) -> Self {
        Error::Tls(reason.to_string())
    }
}
