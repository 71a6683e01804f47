use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::broker::BrokerSession;
use crate::transport::connector::Endpoint;
use crate::transport::frame::{Frame, Headers};
use crate::utils::{Error, Result};

/// How consumed messages are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// The broker considers a message acknowledged once delivered.
    #[default]
    Auto,
    /// Each message is acknowledged on its own.
    ClientIndividual,
    /// Acknowledging a message also acknowledges every earlier one on the
    /// subscription.
    Client,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::ClientIndividual => "client-individual",
            AckMode::Client => "client",
        }
    }

    /// Whether messages need an explicit ACK/NACK.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

impl FromStr for AckMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client-individual" => Ok(AckMode::ClientIndividual),
            "client" => Ok(AckMode::Client),
            other => Err(Error::InvalidAckMode(other.to_string())),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivered message plus the session it came from.
///
/// The session reference does not keep the session alive. Acknowledging a
/// message whose consumer has been dropped fails with `Error::SessionGone`.
#[derive(Clone)]
pub struct Message {
    frame: Frame,
    received_at: DateTime<Utc>,
    endpoint: Endpoint,
    session: Weak<BrokerSession>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("destination", &self.destination())
            .field("message_id", &self.message_id())
            .field("endpoint", &self.endpoint)
            .field("received_at", &self.received_at)
            .field("body_len", &self.frame.body.len())
            .finish()
    }
}

impl Message {
    pub(crate) fn new(frame: Frame, session: &Arc<BrokerSession>) -> Self {
        Self {
            frame,
            received_at: Utc::now(),
            endpoint: session.endpoint().clone(),
            session: Arc::downgrade(session),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.frame.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.frame.header(key)
    }

    pub fn body(&self) -> &Bytes {
        &self.frame.body
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        self.frame.body_text()
    }

    pub fn destination(&self) -> Option<&str> {
        self.header("destination")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header("message-id")
    }

    pub fn subscription(&self) -> Option<&str> {
        self.header("subscription")
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// The broker endpoint that delivered this message.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// Acknowledges the message on the session that delivered it.
    pub async fn ack(&self) -> Result<()> {
        let headers = self.ack_headers()?;
        self.session()?.ack(headers).await
    }

    /// Tells the delivering broker the message was not consumed.
    pub async fn nack(&self) -> Result<()> {
        let headers = self.ack_headers()?;
        self.session()?.nack(headers).await
    }

    fn session(&self) -> Result<Arc<BrokerSession>> {
        self.session.upgrade().ok_or(Error::SessionGone)
    }

    fn ack_headers(&self) -> Result<Headers> {
        let message_id = self
            .message_id()
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingHeader("message-id"))?;
        let subscription = self
            .subscription()
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingHeader("subscription"))?;
        Ok(Headers::new()
            .add("message-id", message_id)
            .add("subscription", subscription))
    }
}
