use std::fmt;
use std::sync::Arc;

use crate::broker::handler::ConnectionLostHandler;
use crate::broker::retry::RecoveryPolicy;
use crate::transport::connector::{Connector, DnsResolver, Resolver, TcpConnector};
use crate::transport::tls::{self, TlsSettings};
use crate::utils::Result;

/// Everything needed to reach a broker (or every broker behind an alias).
///
/// Fixed once a `Consumer` or `Producer` has been built from it; every
/// resolved endpoint shares the same copy.
#[derive(Clone, Default)]
pub struct ConnectionParameters {
    /// Logical `host:port`.
    pub address: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Sent as `client-id` on CONNECT, used by brokers for durable subscriptions.
    pub client_id: Option<String>,
    pub tls: Option<TlsSettings>,
    pub on_connection_lost: Option<Arc<dyn ConnectionLostHandler>>,
    pub recovery: RecoveryPolicy,
    pub resolver: Option<Arc<dyn Resolver>>,
    pub connector: Option<Arc<dyn Connector>>,
}

impl ConnectionParameters {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn on_connection_lost(mut self, handler: Arc<dyn ConnectionLostHandler>) -> Self {
        self.on_connection_lost = Some(handler);
        self
    }

    pub fn with_recovery_policy(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub(crate) fn login(&self) -> Option<&str> {
        self.login.as_deref().filter(|v| !v.is_empty())
    }

    pub(crate) fn passcode(&self) -> Option<&str> {
        self.passcode.as_deref().filter(|v| !v.is_empty())
    }

    pub(crate) fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref().filter(|v| !v.is_empty())
    }

    pub(crate) fn resolver(&self) -> Arc<dyn Resolver> {
        self.resolver
            .clone()
            .unwrap_or_else(|| Arc::new(DnsResolver))
    }

    /// The injected connector, or a TCP connector carrying TLS material loaded
    /// right now. Called once per consumer/producer construction.
    pub(crate) fn build_connector(&self) -> Result<Arc<dyn Connector>> {
        if let Some(connector) = &self.connector {
            return Ok(connector.clone());
        }
        let connector = match &self.tls {
            Some(settings) => TcpConnector::tls(tls::client_config(settings)?),
            None => TcpConnector::plain(),
        };
        Ok(Arc::new(connector))
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("address", &self.address)
            .field("login", &self.login)
            .field("passcode", &self.passcode.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("tls", &self.tls)
            .field("on_connection_lost", &self.on_connection_lost.is_some())
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}
