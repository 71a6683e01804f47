//! Address handling and the two dialing seams: name resolution and transport
//! establishment. Both are traits so the consumer can be pointed at anything
//! that speaks bytes (tests use in-memory pipes).

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::utils::{Error, Result};

/// Byte stream a protocol session runs over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// A concrete broker endpoint. `host` is the logical name the caller asked
/// for; `ip` is set when the consumer resolved the name itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ip: Option<IpAddr>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ip: None,
        }
    }

    pub fn resolved(host: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ip: Some(ip),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(f, "{addr}"),
            None if self.host.contains(':') => write!(f, "[{}]:{}", self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Splits `host:port` or `[v6]:port`.
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let invalid = |reason: &str| Error::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing ']' in address"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port in address"))?;
        (host, port)
    } else {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port in address"))?;
        if host.contains(':') {
            return Err(invalid("too many colons in address"));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid("missing host in address"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| invalid("port is not a number between 0 and 65535"))?;
    Ok((host.to_string(), port))
}

/// Turns a host name into the set of addresses behind it.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// System resolver. Duplicates are dropped, resolution order is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, 0)).await? {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        debug!(host, resolved = ips.len(), "resolved broker alias");
        Ok(ips)
    }
}

/// Opens the byte transport a protocol session runs over.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport>;
}

/// Plain TCP, or TLS over TCP when built with a client config.
#[derive(Clone, Default)]
pub struct TcpConnector {
    tls: Option<Arc<ClientConfig>>,
}

impl TcpConnector {
    pub fn plain() -> Self {
        Self { tls: None }
    }

    pub fn tls(config: Arc<ClientConfig>) -> Self {
        Self { tls: Some(config) }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("tls", &self.is_tls())
            .finish()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport> {
        let stream = match endpoint.socket_addr() {
            Some(addr) => TcpStream::connect(addr).await?,
            None => TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?,
        };
        stream.set_nodelay(true)?;

        let Some(config) = &self.tls else {
            return Ok(Box::new(stream));
        };

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| Error::tls(format!("invalid server name {:?}: {e}", endpoint.host)))?;
        let stream = TlsConnector::from(config.clone())
            .connect(server_name, stream)
            .await?;
        Ok(Box::new(stream))
    }
}
