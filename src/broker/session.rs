use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info, trace, warn};

use crate::broker::handler::ConnectionLostHandler;
use crate::broker::params::ConnectionParameters;
use crate::broker::retry::{RecoveryPolicy, retry_on_send};
use crate::transport::connector::{Connector, Endpoint};
use crate::transport::engine::{Connection, Delivery, PROTOCOL_VERSION};
use crate::transport::frame::Headers;
use crate::utils::{Error, Result};

/// Lifecycle of a `BrokerSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One transport connection and its protocol session to a single endpoint.
///
/// The connection is replaced wholesale by `reconnect`, which closes the old
/// one first; at most one connection is alive at a time. Reconnects are
/// serialised internally, but a reconnect racing an in-flight operation makes
/// that operation fail with `ConnectionBad`, which the retry wrapper then
/// treats as a lost connection.
pub struct BrokerSession {
    endpoint: Endpoint,
    params: Arc<ConnectionParameters>,
    connector: Arc<dyn Connector>,
    connection: RwLock<Option<Connection>>,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    closed: AtomicBool,
    dialing: AsyncMutex<()>,
}

impl fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BrokerSession {
    fn new(
        endpoint: Endpoint,
        params: Arc<ConnectionParameters>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            endpoint,
            params,
            connector,
            connection: RwLock::new(None),
            state: Mutex::new(SessionState::Disconnected),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            dialing: AsyncMutex::new(()),
        }
    }

    /// Opens a session to `endpoint`. The first dial goes through `reconnect`.
    pub(crate) async fn dial(
        endpoint: Endpoint,
        params: Arc<ConnectionParameters>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        let session = Arc::new(Self::new(endpoint, params, connector));
        session.reconnect().await?;
        Ok(session)
    }

    /// Drops the current connection (if any) and establishes a new one.
    ///
    /// On failure the session is left `Disconnected` and every operation fails
    /// with `ConnectionBad` until a later reconnect succeeds.
    pub async fn reconnect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let _dialing = self.dialing.lock().await;

        self.set_state(SessionState::Connecting);
        if let Some(old) = self.take_connection() {
            trace!(endpoint = %self.endpoint, "closing previous connection");
            old.close().await;
        }

        let connection = match self.establish().await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                warn!(endpoint = %self.endpoint, error = %e, "failed to connect");
                return Err(e);
            }
        };

        let version = connection.version().to_string();
        // checked under the slot lock so a concurrent close() either sees the
        // new connection or makes us drop it
        let rejected = {
            let mut slot = self.write_connection();
            if self.is_closed() {
                Some(connection)
            } else {
                *slot = Some(connection);
                None
            }
        };
        if let Some(connection) = rejected {
            debug!(endpoint = %self.endpoint, "session closed while reconnecting");
            connection.close().await;
            self.set_state(SessionState::Disconnected);
            return Err(Error::SessionClosed);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(SessionState::Connected);
        info!(endpoint = %self.endpoint, generation, %version, "connected to broker");
        Ok(())
    }

    async fn establish(&self) -> Result<Connection> {
        let transport = self.connector.connect(&self.endpoint).await?;

        let mut headers = Headers::new()
            .add("accept-version", PROTOCOL_VERSION)
            .add("host", self.endpoint.host.as_str())
            .add("heart-beat", "0,0");
        if let Some(login) = self.params.login() {
            headers.push("login", login);
        }
        if let Some(passcode) = self.params.passcode() {
            headers.push("passcode", passcode);
        }
        if let Some(client_id) = self.params.client_id() {
            headers.push("client-id", client_id);
        }

        Connection::connect(transport, headers).await
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn state(&self) -> SessionState {
        let state = *self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state {
            SessionState::Connected if !self.is_connected() => SessionState::Disconnected,
            other => other,
        }
    }

    /// Bumped on every successful (re)connect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.read_connection()
            .as_ref()
            .is_some_and(Connection::is_healthy)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn lost_handler(&self) -> Option<Arc<dyn ConnectionLostHandler>> {
        self.params.on_connection_lost.clone()
    }

    pub(crate) fn policy(&self) -> &RecoveryPolicy {
        &self.params.recovery
    }

    /// The current protocol session.
    pub fn connection(&self) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.read_connection()
            .as_ref()
            .cloned()
            .ok_or(Error::ConnectionBad)
    }

    /// Issues SUBSCRIBE on the current connection. Not retried: the consumer
    /// drives its own resubscribe loop.
    pub async fn subscribe(&self, headers: Headers) -> Result<mpsc::Receiver<Delivery>> {
        self.connection()?.subscribe(headers).await
    }

    pub async fn send(&self, headers: Headers, body: Bytes) -> Result<()> {
        let (headers, body) = (&headers, &body);
        retry_on_send(self, || async move {
            self.connection()?.send(headers.clone(), body.clone()).await
        })
        .await
    }

    pub async fn ack(&self, headers: Headers) -> Result<()> {
        let headers = &headers;
        retry_on_send(self, || async move { self.connection()?.ack(headers.clone()).await }).await
    }

    pub async fn nack(&self, headers: Headers) -> Result<()> {
        let headers = &headers;
        retry_on_send(self, || async move { self.connection()?.nack(headers.clone()).await }).await
    }

    pub async fn unsubscribe(&self, headers: Headers) -> Result<()> {
        let headers = &headers;
        retry_on_send(self, || async move {
            self.connection()?.unsubscribe(headers.clone()).await
        })
        .await
    }

    /// DISCONNECT, then close the transport. Best effort; the session is
    /// unusable afterwards and its handler is never invoked again.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.take_connection() {
            if connection.is_healthy() {
                if let Err(e) = connection.disconnect(Headers::new()).await {
                    debug!(endpoint = %self.endpoint, error = %e, "DISCONNECT failed");
                }
            }
            connection.close().await;
        }
        self.set_state(SessionState::Disconnected);
        debug!(endpoint = %self.endpoint, "session closed");
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn take_connection(&self) -> Option<Connection> {
        self.write_connection().take()
    }

    fn read_connection(&self) -> std::sync::RwLockReadGuard<'_, Option<Connection>> {
        self.connection.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_connection(&self) -> std::sync::RwLockWriteGuard<'_, Option<Connection>> {
        self.connection.write().unwrap_or_else(|p| p.into_inner())
    }
}
