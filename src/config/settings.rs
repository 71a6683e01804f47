use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::{ConnectionParameters, FixedDelayReconnect};
use crate::transport::TlsSettings;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub tls: TlsConfig,
    pub reconnect: ReconnectSettings,
    pub logging: LoggingSettings,
}

/// Where the brokers live and how to log in.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// `host:port`; every address behind `host` is consumed from.
    pub address: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub enabled: bool,
    pub insecure: bool,
    pub ca_path: Option<PathBuf>,
    pub ca_bundle: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Automatic reconnection after a lost connection.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Settings as found in files or the environment; anything missing is taken
/// from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub tls: Option<PartialTlsConfig>,
    pub reconnect: Option<PartialReconnectSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub address: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialTlsConfig {
    pub enabled: Option<bool>,
    pub insecure: Option<bool>,
    pub ca_path: Option<PathBuf>,
    pub ca_bundle: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct PartialReconnectSettings {
    pub enabled: Option<bool>,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                address: "localhost:61613".to_string(),
                login: None,
                passcode: None,
                client_id: None,
            },
            tls: TlsConfig {
                enabled: false,
                insecure: false,
                ca_path: Some(PathBuf::from("/etc/grid-security/certificates")),
                ca_bundle: None,
                cert: None,
                key: None,
            },
            reconnect: ReconnectSettings {
                enabled: true,
                delay_ms: 1000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Fills the gaps in `partial` with defaults.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let broker = partial.broker.as_ref();
        let tls = partial.tls.as_ref();
        let reconnect = partial.reconnect.as_ref();

        Settings {
            broker: BrokerSettings {
                address: broker
                    .and_then(|b| b.address.clone())
                    .unwrap_or(default.broker.address),
                login: broker
                    .and_then(|b| b.login.clone())
                    .or(default.broker.login),
                passcode: broker
                    .and_then(|b| b.passcode.clone())
                    .or(default.broker.passcode),
                client_id: broker
                    .and_then(|b| b.client_id.clone())
                    .or(default.broker.client_id),
            },
            tls: TlsConfig {
                enabled: tls.and_then(|t| t.enabled).unwrap_or(default.tls.enabled),
                insecure: tls.and_then(|t| t.insecure).unwrap_or(default.tls.insecure),
                ca_path: tls.and_then(|t| t.ca_path.clone()).or(default.tls.ca_path),
                ca_bundle: tls
                    .and_then(|t| t.ca_bundle.clone())
                    .or(default.tls.ca_bundle),
                cert: tls.and_then(|t| t.cert.clone()).or(default.tls.cert),
                key: tls.and_then(|t| t.key.clone()).or(default.tls.key),
            },
            reconnect: ReconnectSettings {
                enabled: reconnect
                    .and_then(|r| r.enabled)
                    .unwrap_or(default.reconnect.enabled),
                delay_ms: reconnect
                    .and_then(|r| r.delay_ms)
                    .unwrap_or(default.reconnect.delay_ms),
            },
            logging: LoggingSettings {
                level: partial
                    .logging
                    .and_then(|l| l.level)
                    .unwrap_or(default.logging.level),
            },
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.delay_ms)
    }

    /// Connection parameters described by these settings. A
    /// `FixedDelayReconnect` handler is installed when reconnection is enabled.
    pub fn connection_parameters(&self) -> ConnectionParameters {
        let mut params = ConnectionParameters::new(self.broker.address.clone());
        params.login = self.broker.login.clone();
        params.passcode = self.broker.passcode.clone();
        params.client_id = self.broker.client_id.clone();

        if self.tls.enabled {
            params = params.with_tls(TlsSettings {
                insecure: self.tls.insecure,
                ca_path: self.tls.ca_path.clone(),
                ca_bundle: self.tls.ca_bundle.clone(),
                cert: self.tls.cert.clone(),
                key: self.tls.key.clone(),
            });
        }
        if self.reconnect.enabled {
            params = params.on_connection_lost(Arc::new(FixedDelayReconnect::new(
                self.reconnect_delay(),
            )));
        }
        params
    }
}
