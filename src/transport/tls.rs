//! Certificate loading and rustls client configuration.
//!
//! CA material is best-effort: files that cannot be read or parsed are
//! skipped. A client identity that was asked for but cannot be loaded is fatal.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::utils::{Error, Result};

/// TLS options for reaching the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// Skip server certificate verification.
    pub insecure: bool,
    /// Directory scanned recursively for `*.pem` CA certificates.
    pub ca_path: Option<PathBuf>,
    /// CA bundle file.
    pub ca_bundle: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    /// Defaults to `cert` when only the certificate is given.
    pub key: Option<PathBuf>,
}

/// Client certificate chain plus its private key.
#[derive(Debug)]
pub struct ClientIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

pub fn load_root_store(ca_dir: Option<&Path>, ca_bundle: Option<&Path>) -> RootCertStore {
    let mut store = RootCertStore::empty();
    if let Some(bundle) = ca_bundle {
        add_pem_file(&mut store, bundle);
    }
    if let Some(dir) = ca_dir {
        walk_pem_dir(&mut store, dir);
    }
    debug!(roots = store.len(), "loaded CA certificates");
    store
}

fn walk_pem_dir(store: &mut RootCertStore, dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "skipping unreadable CA directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_pem_dir(store, &path);
        } else if path.extension().is_some_and(|ext| ext == "pem") {
            add_pem_file(store, &path);
        }
    }
}

fn add_pem_file(store: &mut RootCertStore, path: &Path) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "skipping unreadable CA file");
            return;
        }
    };
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .filter_map(|cert| cert.ok())
        .collect();
    let (added, ignored) = store.add_parsable_certificates(certs);
    if ignored > 0 {
        debug!(path = %path.display(), added, ignored, "some CA certificates were not usable");
    }
}

pub fn load_client_identity(
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<Option<ClientIdentity>> {
    let Some(cert) = cert else {
        if key.is_some() {
            return Err(Error::tls("a client key was given without a certificate"));
        }
        return Ok(None);
    };
    let key = key.unwrap_or(cert);

    let chain = rustls_pemfile::certs(&mut BufReader::new(open(cert)?))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::tls(format!("parse {}: {e}", cert.display())))?;
    if chain.is_empty() {
        return Err(Error::tls(format!(
            "no certificate found in {}",
            cert.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(open(key)?))
        .map_err(|e| Error::tls(format!("parse {}: {e}", key.display())))?
        .ok_or_else(|| Error::tls(format!("no private key found in {}", key.display())))?;

    Ok(Some(ClientIdentity { chain, key }))
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::tls(format!("open {}: {e}", path.display())))
}

/// Builds the client config shared by every endpoint of a consumer.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = load_root_store(settings.ca_path.as_deref(), settings.ca_bundle.as_deref());
    let identity = load_client_identity(settings.cert.as_deref(), settings.key.as_deref())?;

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(Error::tls)?
        .with_root_certificates(roots);
    let mut config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain, identity.key)
            .map_err(Error::tls)?,
        None => builder.with_no_client_auth(),
    };

    if settings.insecure {
        warn!("TLS server certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification(provider)));
    }
    Ok(Arc::new(config))
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
