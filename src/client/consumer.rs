//! Multi-broker consumer.
//!
//! A logical address may hide several brokers. The consumer resolves it, keeps
//! one `BrokerSession` per address, and merges what every session delivers
//! into a single `Subscription`. Each session is drained by its own forwarding
//! task, which also resubscribes after the session has been reconnected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::broker::{BrokerSession, ConnectionLostHandler, ConnectionParameters, Outcome};
use crate::client::fanin::{Completion, Contributor, fan_in};
use crate::client::message::{AckMode, Message};
use crate::transport::connector::{Endpoint, split_host_port};
use crate::transport::engine::Delivery;
use crate::transport::frame::Headers;
use crate::utils::{Error, Result};

/// Capacity of the merged message queue.
pub const MESSAGE_BUFFER: usize = 100;

/// Destination, id and ack mode of one logical subscription. Reused verbatim
/// on every resubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    destination: String,
    id: String,
    ack: AckMode,
}

impl SubscriptionSpec {
    pub fn new(destination: impl Into<String>, id: impl Into<String>, ack: AckMode) -> Result<Self> {
        let spec = Self {
            destination: destination.into(),
            id: id.into(),
            ack,
        };
        if spec.id.is_empty() {
            return Err(Error::MissingSubscriptionId);
        }
        if spec.destination.is_empty() {
            return Err(Error::MissingDestination);
        }
        Ok(spec)
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ack(&self) -> AckMode {
        self.ack
    }

    fn headers(&self) -> Headers {
        Headers::new()
            .add("destination", self.destination.as_str())
            .add("id", self.id.as_str())
            .add("ack", self.ack.as_str())
    }
}

/// Merged output of a subscription across every broker.
///
/// Both queues close once every forwarding task has finished: after
/// unsubscribing, after the consumer is closed, or after each session has
/// failed in a way it could not recover from.
pub struct Subscription {
    pub messages: mpsc::Receiver<Message>,
    /// Per-session failures. Duplicate-subscription errors never show up here.
    pub errors: mpsc::Receiver<Error>,
    completion: Completion,
}

impl Subscription {
    /// Whether both queues have been closed.
    pub fn is_closed(&self) -> bool {
        self.completion.is_done()
    }

    /// Resolves once both queues have been closed.
    pub async fn closed(&self) {
        self.completion.wait().await
    }
}

/// Sessions opened while building a consumer. Whatever is still held when the
/// set is dropped gets closed in the background.
#[derive(Default)]
struct SessionSet {
    sessions: Vec<Arc<BrokerSession>>,
}

impl SessionSet {
    fn push(&mut self, session: Arc<BrokerSession>) {
        self.sessions.push(session);
    }

    async fn release(mut self) {
        let sessions = std::mem::take(&mut self.sessions);
        for session in sessions {
            session.close().await;
        }
    }

    fn into_inner(mut self) -> Vec<Arc<BrokerSession>> {
        std::mem::take(&mut self.sessions)
    }
}

impl Drop for SessionSet {
    fn drop(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let sessions = std::mem::take(&mut self.sessions);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for session in sessions {
                    session.close().await;
                }
            });
        }
    }
}

/// Registry entry of a subscription that may still be forwarding.
#[derive(Clone)]
struct ActiveSubscription {
    cancelled: Arc<AtomicBool>,
    completion: Completion,
}

impl ActiveSubscription {
    fn is_live(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst) && !self.completion.is_done()
    }
}

type Registry = Mutex<HashMap<String, ActiveSubscription>>;

fn lock_registry(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<String, ActiveSubscription>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consumes from every broker behind one logical address.
pub struct Consumer {
    sessions: Vec<Arc<BrokerSession>>,
    active: Arc<Registry>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl Consumer {
    /// Resolves `params.address` and opens a session to every address found.
    ///
    /// All or nothing: if any dial fails, the sessions already opened are
    /// closed before the error is returned.
    pub async fn connect(params: ConnectionParameters) -> Result<Self> {
        let (host, port) = split_host_port(&params.address)?;
        let connector = params.build_connector()?;

        let ips = params
            .resolver()
            .resolve(&host)
            .await
            .map_err(|source| Error::Resolve {
                host: host.clone(),
                source,
            })?;
        if ips.is_empty() {
            return Err(Error::NoAddresses { host });
        }
        debug!(%host, addresses = ips.len(), "dialing every broker behind the alias");

        let params = Arc::new(params);
        let mut opened = SessionSet::default();
        for ip in ips {
            let endpoint = Endpoint::resolved(host.as_str(), ip, port);
            match BrokerSession::dial(endpoint.clone(), params.clone(), connector.clone()).await {
                Ok(session) => opened.push(session),
                Err(e) => {
                    warn!(%endpoint, error = %e, opened = opened.sessions.len(), "dial failed, releasing opened sessions");
                    opened.release().await;
                    return Err(Error::Dial {
                        endpoint: endpoint.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        let sessions = opened.into_inner();
        info!(address = %params.address, brokers = sessions.len(), "consumer connected");
        Ok(Self {
            sessions,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn sessions(&self) -> &[Arc<BrokerSession>] {
        &self.sessions
    }

    /// Subscribes on every broker and merges the streams.
    ///
    /// Fails only on invalid arguments or an id that is still in use; a
    /// session that cannot subscribe reports through `Subscription::errors`.
    pub async fn subscribe(&self, destination: &str, id: &str, ack: AckMode) -> Result<Subscription> {
        self.subscribe_with(SubscriptionSpec::new(destination, id, ack)?)
            .await
    }

    /// Like `subscribe`. An id that is still forwarding cannot be reused
    /// until it is unsubscribed or its queues have closed.
    pub async fn subscribe_with(&self, spec: SubscriptionSpec) -> Result<Subscription> {
        let (contributors, merged) = fan_in(self.sessions.len(), MESSAGE_BUFFER);
        let entry = ActiveSubscription {
            cancelled: Arc::new(AtomicBool::new(false)),
            completion: merged.completion.clone(),
        };
        {
            let mut active = lock_registry(&self.active);
            if active.get(&spec.id).is_some_and(ActiveSubscription::is_live) {
                return Err(Error::DuplicateSubscription(spec.id));
            }
            active.insert(spec.id.clone(), entry.clone());
        }
        tokio::spawn(forget_when_done(self.active.clone(), spec.id.clone(), entry.clone()));

        let cancelled = entry.cancelled;
        let spec = Arc::new(spec);
        for (session, out) in self.sessions.iter().zip(contributors) {
            tokio::spawn(forward(
                session.clone(),
                spec.clone(),
                cancelled.clone(),
                out,
            ));
        }
        info!(destination = %spec.destination, subscription = %spec.id, ack = %spec.ack, "subscribed");

        Ok(Subscription {
            messages: merged.items,
            errors: merged.errors,
            completion: merged.completion,
        })
    }

    /// Unsubscribes `id` from every broker. Every session is attempted; the
    /// first failure is returned.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::MissingSubscriptionId);
        }
        if let Some(entry) = lock_registry(&self.active).remove(id) {
            entry.cancelled.store(true, Ordering::SeqCst);
        }

        let mut first_error = None;
        for session in &self.sessions {
            if let Err(e) = session.unsubscribe(Headers::new().add("id", id)).await {
                warn!(endpoint = %session.endpoint(), subscription = %id, error = %e, "unsubscribe failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Closes every session. Open subscriptions drain and close.
    pub async fn close(&self) {
        for entry in lock_registry(&self.active).values() {
            entry.cancelled.store(true, Ordering::SeqCst);
        }
        join_all(self.sessions.iter().map(|session| session.close())).await;
        debug!(brokers = self.sessions.len(), "consumer closed");
    }

    /// Ids of the subscriptions still forwarding, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_registry(&self.active)
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Drops the registry entry once the merged queues have closed, unless the id
/// has been taken over by a newer subscription.
async fn forget_when_done(registry: Arc<Registry>, id: String, entry: ActiveSubscription) {
    entry.completion.wait().await;
    let mut active = lock_registry(&registry);
    if active
        .get(&id)
        .is_some_and(|current| Arc::ptr_eq(&current.cancelled, &entry.cancelled))
    {
        active.remove(&id);
        trace!(subscription = %id, "subscription finished");
    }
}

/// Forwarding task for one session. Ends when the stream ends cleanly, the
/// subscription is cancelled, or the session fails for good.
async fn forward(
    session: Arc<BrokerSession>,
    spec: Arc<SubscriptionSpec>,
    cancelled: Arc<AtomicBool>,
    out: Contributor<Message, Error>,
) {
    match pump(&session, &spec, &cancelled, &out).await {
        Ok(()) => debug!(endpoint = %session.endpoint(), subscription = %spec.id, "forwarding finished"),
        Err(Error::DuplicateSubscription(id)) => {
            debug!(endpoint = %session.endpoint(), subscription = %id, "already subscribed through another address");
        }
        Err(e) => {
            warn!(endpoint = %session.endpoint(), subscription = %spec.id, error = %e, "forwarding stopped");
            out.fail(e).await;
        }
    }
}

async fn pump(
    session: &Arc<BrokerSession>,
    spec: &SubscriptionSpec,
    cancelled: &AtomicBool,
    out: &Contributor<Message, Error>,
) -> Result<()> {
    let mut generation = session.generation();
    let mut stream = session.subscribe(spec.headers()).await?;

    loop {
        let lost = match stream.recv().await {
            None => return Ok(()),
            Some(Delivery::Message(frame)) => {
                if !out.push(Message::new(frame, session)).await {
                    debug!(subscription = %spec.id, "merged queue dropped by the application");
                    return Ok(());
                }
                continue;
            }
            Some(Delivery::Disconnected) => Error::EndOfStream,
            Some(Delivery::Failed(e)) => e,
        };

        if session.is_closed() || cancelled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let handler = match session.lost_handler() {
            Some(handler) if session.policy().classify(&lost) == Outcome::Recoverable => handler,
            _ => return Err(lost),
        };

        match resubscribe(session, spec, cancelled, handler.as_ref(), generation).await? {
            Some((next, next_generation)) => {
                stream = next;
                generation = next_generation;
            }
            None => return Ok(()),
        }
    }
}

/// Waits for the session to come back and subscribes again. `None` means the
/// session was closed or the subscription cancelled in the meantime.
async fn resubscribe(
    session: &BrokerSession,
    spec: &SubscriptionSpec,
    cancelled: &AtomicBool,
    handler: &dyn ConnectionLostHandler,
    mut seen: u64,
) -> Result<Option<(mpsc::Receiver<Delivery>, u64)>> {
    loop {
        if session.is_closed() || cancelled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        // someone else already brought the session back
        let replaced = session.generation() != seen && session.is_connected();
        if !replaced {
            handler.on_disconnected(session).await;
            if session.is_closed() || cancelled.load(Ordering::SeqCst) {
                return Ok(None);
            }
        }

        let generation = session.generation();
        match session.subscribe(spec.headers()).await {
            Ok(stream) => {
                info!(endpoint = %session.endpoint(), subscription = %spec.id, generation, "resubscribed");
                return Ok(Some((stream, generation)));
            }
            Err(e @ Error::DuplicateSubscription(_)) => return Err(e),
            Err(Error::SessionClosed) => return Ok(None),
            Err(e) => {
                warn!(endpoint = %session.endpoint(), subscription = %spec.id, error = %e, "resubscribe failed");
                seen = generation;
            }
        }
    }
}
