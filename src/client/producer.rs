use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::broker::{BrokerSession, ConnectionParameters};
use crate::transport::connector::{Endpoint, split_host_port};
use crate::transport::frame::Headers;
use crate::utils::{Error, Result};

/// Content type used when `SendParams::content_type` is empty.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Per-message options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendParams {
    pub persist: bool,
    pub content_type: Option<String>,
}

impl SendParams {
    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    fn content_type(&self) -> &str {
        self.content_type
            .as_deref()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// Publishes through a single broker connection.
#[derive(Debug)]
pub struct Producer {
    session: Arc<BrokerSession>,
}

impl Producer {
    /// Connects to `params.address`. The name is resolved by the connector,
    /// so only one of the brokers behind an alias is used.
    pub async fn connect(params: ConnectionParameters) -> Result<Self> {
        let (host, port) = split_host_port(&params.address)?;
        let connector = params.build_connector()?;
        let endpoint = Endpoint::new(host, port);

        let session = BrokerSession::dial(endpoint.clone(), Arc::new(params), connector)
            .await
            .map_err(|e| Error::Dial {
                endpoint: endpoint.to_string(),
                source: Box::new(e),
            })?;
        info!(%endpoint, "producer connected");
        Ok(Self { session })
    }

    pub fn session(&self) -> &Arc<BrokerSession> {
        &self.session
    }

    /// Sends `body` to `destination`, retrying across reconnects.
    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<Bytes>,
        params: &SendParams,
    ) -> Result<()> {
        if destination.is_empty() {
            return Err(Error::MissingDestination);
        }
        let body = body.into();
        let headers = Headers::new()
            .add("destination", destination)
            .add("content-type", params.content_type())
            .add("content-length", body.len().to_string())
            .add("persistent", params.persist.to_string());

        debug!(destination, bytes = body.len(), persist = params.persist, "sending message");
        self.session.send(headers, body).await
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}
