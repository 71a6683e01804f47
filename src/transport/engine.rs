//! Protocol engine
//!
//! A `Connection` is one STOMP session over one transport. It is a cheap
//! clonable handle: the write half sits behind an async mutex, and a single
//! reader task owns the read half and routes inbound MESSAGE frames to the
//! subscription named by their `subscription` header.
//!
//! Every subscription gets its own bounded channel. When the channel is full
//! the reader waits, which stalls this connection only.
//!
//! Once the reader stops (EOF, ERROR frame, I/O error, or the task dying) or
//! the connection is closed locally, the connection is marked unusable:
//! further operations fail with `Error::ConnectionBad` and every open
//! subscription receives one final `Delivery` describing why.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::transport::codec::StompCodec;
use crate::transport::connector::BoxedTransport;
use crate::transport::frame::{Command, Frame, Headers};
use crate::utils::{Error, Result};

/// Protocol version negotiated on CONNECT.
pub const PROTOCOL_VERSION: &str = "1.1";

/// Per-subscription inbound buffer.
pub const SUBSCRIPTION_BUFFER: usize = 100;

type FrameSink = SplitSink<Framed<BoxedTransport, StompCodec>, Frame>;
type FrameStream = SplitStream<Framed<BoxedTransport, StompCodec>>;

/// One item of a subscription's inbound stream.
#[derive(Debug)]
pub enum Delivery {
    Message(Frame),
    /// Orderly end of the connection: the broker closed it, or it was closed
    /// locally. Recoverable by reconnecting and resubscribing.
    Disconnected,
    /// The connection failed: ERROR frame or transport error.
    Failed(Error),
}

/// Why the reader stopped; replayed to every open subscription.
#[derive(Debug, Clone)]
enum Shutdown {
    Eof,
    Broker(String),
    Io(io::ErrorKind, String),
    Protocol(String),
}

impl Shutdown {
    fn from_error(err: Error) -> Self {
        match err {
            Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => Shutdown::Eof,
            Error::Io(e) => Shutdown::Io(e.kind(), e.to_string()),
            other => Shutdown::Protocol(other.to_string()),
        }
    }

    fn delivery(&self) -> Delivery {
        match self {
            Shutdown::Eof => Delivery::Disconnected,
            Shutdown::Broker(message) => Delivery::Failed(Error::Broker(message.clone())),
            Shutdown::Io(kind, message) => {
                Delivery::Failed(Error::Io(io::Error::new(*kind, message.clone())))
            }
            Shutdown::Protocol(message) => Delivery::Failed(Error::Protocol(message.clone())),
        }
    }
}

/// State shared between the connection handle and its reader task.
#[derive(Default)]
struct Inbox {
    subscriptions: Mutex<HashMap<String, mpsc::Sender<Delivery>>>,
    healthy: AtomicBool,
}

impl Inbox {
    async fn dispatch(&self, frame: Frame) {
        let Some(id) = frame.header("subscription").map(str::to_owned) else {
            warn!("dropping MESSAGE frame without a subscription header");
            return;
        };
        let sender = self.lock().get(&id).cloned();
        let Some(sender) = sender else {
            debug!(subscription = %id, "dropping message for unknown subscription");
            return;
        };
        if sender.send(Delivery::Message(frame)).await.is_err() {
            trace!(subscription = %id, "subscriber went away");
            self.lock().remove(&id);
        }
    }

    /// Marks the connection unusable and hands every open subscription its
    /// final delivery. Runs at most once per subscription.
    async fn shutdown(&self, reason: Shutdown) {
        notify(self.close_all(), &reason).await;
    }

    fn close_all(&self) -> Vec<(String, mpsc::Sender<Delivery>)> {
        self.healthy.store(false, Ordering::SeqCst);
        self.lock().drain().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Delivery>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn notify(subscribers: Vec<(String, mpsc::Sender<Delivery>)>, reason: &Shutdown) {
    for (id, sender) in subscribers {
        trace!(subscription = %id, ?reason, "closing subscription");
        let _ = sender.send(reason.delivery()).await;
    }
}

/// Owned by the reader task. However the task ends (returning, aborted or
/// panicking) the connection is marked unusable and no subscriber is left
/// waiting for a final delivery.
struct ReaderGuard {
    inbox: Arc<Inbox>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let subscribers = self.inbox.close_all();
        if subscribers.is_empty() {
            return;
        }
        let reason = if std::thread::panicking() {
            warn!("reader task panicked");
            Shutdown::Protocol("reader task panicked".to_string())
        } else {
            Shutdown::Eof
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { notify(subscribers, &reason).await });
            }
            Err(_) => {
                for (_, sender) in subscribers {
                    let _ = sender.try_send(reason.delivery());
                }
            }
        }
    }
}

struct Shared {
    writer: AsyncMutex<FrameSink>,
    inbox: Arc<Inbox>,
    reader: JoinHandle<()>,
    server: Option<String>,
    version: String,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Handle to an established protocol session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.shared.version)
            .field("server", &self.shared.server)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl Connection {
    /// Performs the CONNECT handshake over `transport` and starts the reader.
    pub async fn connect(transport: BoxedTransport, headers: Headers) -> Result<Self> {
        let mut framed = Framed::new(transport, StompCodec::default());
        framed
            .send(Frame::new(Command::Connect).with_headers(headers))
            .await?;

        let reply = match framed.next().await {
            Some(reply) => reply?,
            None => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "broker closed the connection during the handshake",
                )));
            }
        };

        match reply.command {
            Command::Connected => {}
            Command::Error => return Err(Error::Rejected(rejection_reason(&reply))),
            other => {
                return Err(Error::protocol(format!(
                    "expected CONNECTED, broker sent {other}"
                )));
            }
        }

        let version = reply
            .header("version")
            .unwrap_or(PROTOCOL_VERSION)
            .to_string();
        let server = reply.header("server").map(str::to_owned);

        let (sink, stream) = framed.split();
        let inbox = Arc::new(Inbox::default());
        inbox.healthy.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_loop(
            stream,
            ReaderGuard {
                inbox: inbox.clone(),
            },
        ));

        debug!(%version, server = server.as_deref().unwrap_or("unknown"), "protocol session established");
        Ok(Self {
            shared: Arc::new(Shared {
                writer: AsyncMutex::new(sink),
                inbox,
                reader,
                server,
                version,
            }),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.inbox.healthy.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> &str {
        &self.shared.version
    }

    pub fn server(&self) -> Option<&str> {
        self.shared.server.as_deref()
    }

    /// Registers a subscription and returns its inbound stream. The stream
    /// ends cleanly (`None`) once the subscription is removed with
    /// `unsubscribe`.
    pub async fn subscribe(&self, headers: Headers) -> Result<mpsc::Receiver<Delivery>> {
        let id = headers
            .get("id")
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingSubscriptionId)?
            .to_string();
        if headers.get("destination").is_none_or(str::is_empty) {
            return Err(Error::MissingDestination);
        }
        self.ensure_healthy()?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        {
            let mut subscriptions = self.shared.inbox.lock();
            if subscriptions.contains_key(&id) {
                return Err(Error::DuplicateSubscription(id));
            }
            subscriptions.insert(id.clone(), tx);
        }

        if let Err(e) = self
            .write(Frame::new(Command::Subscribe).with_headers(headers))
            .await
        {
            self.shared.inbox.lock().remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    pub async fn unsubscribe(&self, headers: Headers) -> Result<()> {
        let id = headers
            .get("id")
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingSubscriptionId)?
            .to_string();
        self.write(Frame::new(Command::Unsubscribe).with_headers(headers))
            .await?;
        self.shared.inbox.lock().remove(&id);
        Ok(())
    }

    pub async fn send(&self, headers: Headers, body: Bytes) -> Result<()> {
        if headers.get("destination").is_none_or(str::is_empty) {
            return Err(Error::MissingDestination);
        }
        self.write(Frame::new(Command::Send).with_headers(headers).with_body(body))
            .await
    }

    pub async fn ack(&self, headers: Headers) -> Result<()> {
        self.write(Frame::new(Command::Ack).with_headers(headers))
            .await
    }

    pub async fn nack(&self, headers: Headers) -> Result<()> {
        self.write(Frame::new(Command::Nack).with_headers(headers))
            .await
    }

    /// Sends DISCONNECT. The connection is unusable afterwards.
    pub async fn disconnect(&self, headers: Headers) -> Result<()> {
        let result = self
            .write(Frame::new(Command::Disconnect).with_headers(headers))
            .await;
        self.shared.inbox.healthy.store(false, Ordering::SeqCst);
        result
    }

    /// Closes the transport. Open subscriptions observe `Delivery::Disconnected`.
    /// Idempotent; errors are ignored.
    pub async fn close(&self) {
        self.shared.inbox.healthy.store(false, Ordering::SeqCst);
        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.close().await {
                trace!(error = %e, "error while closing transport");
            }
        }
        self.shared.reader.abort();

        let inbox = self.shared.inbox.clone();
        tokio::spawn(async move { inbox.shutdown(Shutdown::Eof).await });
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(Error::ConnectionBad)
        }
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        self.ensure_healthy()?;
        trace!(command = %frame.command, "sending frame");
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.send(frame).await {
            self.shared.inbox.healthy.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

async fn read_loop(mut stream: FrameStream, guard: ReaderGuard) {
    let inbox = &guard.inbox;
    let reason = loop {
        match stream.next().await {
            None => break Shutdown::Eof,
            Some(Ok(frame)) => match frame.command {
                Command::Message => inbox.dispatch(frame).await,
                Command::Error => break Shutdown::Broker(rejection_reason(&frame)),
                Command::Receipt => trace!(receipt = ?frame.header("receipt-id"), "receipt"),
                other => debug!(command = %other, "ignoring unexpected frame"),
            },
            Some(Err(e)) => break Shutdown::from_error(e),
        }
    };
    match &reason {
        Shutdown::Eof => debug!("broker closed the connection"),
        other => warn!(reason = ?other, "protocol session failed"),
    }
    inbox.shutdown(reason).await;
}

/// Human readable explanation carried by an ERROR frame.
fn rejection_reason(frame: &Frame) -> String {
    let body = frame.body_text();
    let body = body.trim_end_matches(['\0', '\n', '\r']);
    if !body.is_empty() {
        return body.to_string();
    }
    frame
        .header("message")
        .unwrap_or("no reason given")
        .to_string()
}
