//! In-memory STOMP broker used by the test suites.
//!
//! Every dial through `FakeBroker::connector()` gets its own duplex pipe and a
//! task serving the broker side. Connections are numbered in dial order and
//! can be driven from the test (deliver, hang up, fail). Everything the broker
//! sees is reported as a `BrokerEvent`.

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::codec::Framed;

use crate::broker::{BrokerSession, ConnectionLostHandler, ConnectionParameters};
use crate::transport::codec::StompCodec;
use crate::transport::connector::{BoxedTransport, Connector, Endpoint, Resolver};
use crate::transport::frame::{Command, Frame, Headers};
use crate::utils::{Error, Result};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BrokerEvent {
    Connected { conn: usize, headers: Headers },
    Subscribed {
        conn: usize,
        id: String,
        destination: String,
        ack: String,
    },
    Sent {
        conn: usize,
        headers: Headers,
        body: Bytes,
    },
    Acked { conn: usize, headers: Headers },
    Nacked { conn: usize, headers: Headers },
    Unsubscribed { conn: usize, id: String },
    Disconnected { conn: usize },
    Closed { conn: usize },
}

enum Control {
    Deliver(Bytes),
    Fail(String),
    Hangup,
}

struct Inner {
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<BrokerEvent>>,
    links: Mutex<Vec<(Endpoint, mpsc::UnboundedSender<Control>)>>,
    refused: Mutex<HashSet<IpAddr>>,
    offline: AtomicBool,
    reject_logins: AtomicBool,
    dials: AtomicUsize,
}

impl Inner {
    fn emit(&self, event: BrokerEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[derive(Clone)]
pub(crate) struct FakeBroker {
    inner: Arc<Inner>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                events_tx,
                events_rx: AsyncMutex::new(events_rx),
                links: Mutex::new(Vec::new()),
                refused: Mutex::new(HashSet::new()),
                offline: AtomicBool::new(false),
                reject_logins: AtomicBool::new(false),
                dials: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector(self.inner.clone()))
    }

    /// Parameters pointing at this broker through `address`.
    pub(crate) fn parameters(&self, address: &str) -> ConnectionParameters {
        ConnectionParameters::new(address).with_connector(self.connector())
    }

    /// Refuse dials to `ip`.
    pub(crate) fn refuse(&self, ip: IpAddr) {
        self.inner.refused.lock().unwrap().insert(ip);
    }

    /// Refuse every dial while `offline` is set.
    pub(crate) fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn reject_logins(&self) {
        self.inner.reject_logins.store(true, Ordering::SeqCst);
    }

    pub(crate) fn dials(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn connections(&self) -> usize {
        self.inner.links.lock().unwrap().len()
    }

    pub(crate) fn endpoint(&self, conn: usize) -> Endpoint {
        self.inner.links.lock().unwrap()[conn].0.clone()
    }

    pub(crate) fn deliver(&self, conn: usize, body: impl Into<Bytes>) {
        self.control(conn, Control::Deliver(body.into()));
    }

    pub(crate) fn fail(&self, conn: usize, message: &str) {
        self.control(conn, Control::Fail(message.to_string()));
    }

    pub(crate) fn hangup(&self, conn: usize) {
        self.control(conn, Control::Hangup);
    }

    fn control(&self, conn: usize, command: Control) {
        let links = self.inner.links.lock().unwrap();
        let _ = links[conn].1.send(command);
    }

    pub(crate) async fn next_event(&self) -> BrokerEvent {
        let mut events = self.inner.events_rx.lock().await;
        tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for a broker event")
            .expect("event channel closed")
    }

    /// Skips events until one matches.
    pub(crate) async fn wait_for(&self, matches: impl Fn(&BrokerEvent) -> bool) -> BrokerEvent {
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
        }
    }

    /// Events already reported, without waiting.
    pub(crate) async fn drain_events(&self) -> Vec<BrokerEvent> {
        let mut events = self.inner.events_rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

struct FakeConnector(Arc<Inner>);

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport> {
        self.0.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self.0.offline.load(Ordering::SeqCst)
            || endpoint
                .ip
                .is_some_and(|ip| self.0.refused.lock().unwrap().contains(&ip));
        if refused {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut links = self.0.links.lock().unwrap();
            links.push((endpoint.clone(), tx));
            links.len() - 1
        };
        tokio::spawn(serve(conn, server, rx, self.0.clone()));
        Ok(Box::new(client))
    }
}

async fn serve(
    conn: usize,
    stream: DuplexStream,
    mut control: mpsc::UnboundedReceiver<Control>,
    inner: Arc<Inner>,
) {
    let mut framed = Framed::new(stream, StompCodec::default());
    let Some(Ok(connect)) = framed.next().await else {
        inner.emit(BrokerEvent::Closed { conn });
        return;
    };

    if inner.reject_logins.load(Ordering::SeqCst) {
        let _ = framed
            .send(
                Frame::new(Command::Error)
                    .with_header("message", "login failed")
                    .with_body("bad credentials"),
            )
            .await;
        inner.emit(BrokerEvent::Closed { conn });
        return;
    }

    let connected = Frame::new(Command::Connected)
        .with_header("version", "1.1")
        .with_header("server", "fake/1.0");
    if framed.send(connected).await.is_err() {
        inner.emit(BrokerEvent::Closed { conn });
        return;
    }
    inner.emit(BrokerEvent::Connected {
        conn,
        headers: connect.headers,
    });

    let mut subscription: Option<(String, String)> = None;
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            inbound = framed.next() => {
                let Some(Ok(frame)) = inbound else { break };
                let header = |key: &str| frame.header(key).unwrap_or_default().to_string();
                match frame.command {
                    Command::Subscribe => {
                        subscription = Some((header("id"), header("destination")));
                        inner.emit(BrokerEvent::Subscribed {
                            conn,
                            id: header("id"),
                            destination: header("destination"),
                            ack: header("ack"),
                        });
                    }
                    Command::Unsubscribe => {
                        subscription = None;
                        inner.emit(BrokerEvent::Unsubscribed { conn, id: header("id") });
                    }
                    Command::Send => inner.emit(BrokerEvent::Sent {
                        conn,
                        headers: frame.headers.clone(),
                        body: frame.body.clone(),
                    }),
                    Command::Ack => inner.emit(BrokerEvent::Acked { conn, headers: frame.headers.clone() }),
                    Command::Nack => inner.emit(BrokerEvent::Nacked { conn, headers: frame.headers.clone() }),
                    Command::Disconnect => inner.emit(BrokerEvent::Disconnected { conn }),
                    _ => {}
                }
            }
            command = control.recv() => match command {
                Some(Control::Deliver(body)) => {
                    let Some((id, destination)) = subscription.clone() else { continue };
                    sequence += 1;
                    let message = Frame::new(Command::Message)
                        .with_header("destination", destination)
                        .with_header("message-id", format!("{conn}-{sequence}"))
                        .with_header("subscription", id)
                        .with_header("content-length", body.len().to_string())
                        .with_body(body);
                    if framed.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Control::Fail(message)) => {
                    let _ = framed
                        .send(Frame::new(Command::Error).with_header("message", message))
                        .await;
                    break;
                }
                Some(Control::Hangup) | None => break,
            }
        }
    }
    inner.emit(BrokerEvent::Closed { conn });
}

/// Resolver answering every lookup with a fixed address list.
pub(crate) struct StaticResolver(pub(crate) Vec<IpAddr>);

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

/// Counts invocations and, when asked to, reconnects the session.
#[derive(Default)]
pub(crate) struct CountingHandler {
    pub(crate) calls: AtomicUsize,
    pub(crate) reconnect: bool,
}

impl CountingHandler {
    pub(crate) fn reconnecting() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reconnect: true,
        })
    }

    pub(crate) fn passive() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionLostHandler for CountingHandler {
    async fn on_disconnected(&self, session: &BrokerSession) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reconnect {
            let _ = session.reconnect().await;
        }
    }
}
