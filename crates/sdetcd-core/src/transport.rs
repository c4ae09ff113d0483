//! Transport Construction
//!
//! Turns a timeout policy and an optional credential bundle into the
//! transport each protocol generation needs:
//! - v2: a pooled `reqwest` HTTP client
//! - v3: `etcd_client` connect options for the gRPC channel
//!
//! Certificate, key and CA reads are the only I/O performed here. A broken
//! certificate or key fails construction; a broken CA bundle only means the
//! system trust roots are used.

use crate::config::{ClientOptions, Credentials};
use crate::error::{Error, Result};
use etcd_client::{Certificate, ConnectOptions, Identity, TlsOptions};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Resolved per-client timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Connection establishment
    pub dial_timeout: Duration,
    /// TCP / HTTP2 keep-alive interval
    pub dial_keepalive: Duration,
    /// Bound on a single request (and the keep-alive ack wait on v3)
    pub header_timeout: Duration,
}

impl TimeoutPolicy {
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            dial_timeout: timeout,
            dial_keepalive: timeout,
            header_timeout: timeout,
        }
    }

    /// Fill every unset or zero timeout with `default`.
    pub fn resolve(options: &ClientOptions, default: Duration) -> Self {
        let pick = |value: Option<Duration>| value.filter(|d| !d.is_zero()).unwrap_or(default);
        Self {
            dial_timeout: pick(options.dial_timeout),
            dial_keepalive: pick(options.dial_keepalive),
            header_timeout: pick(options.header_timeout),
        }
    }
}

/// Parsed client identity plus the optional custom trust roots.
#[derive(Clone)]
pub struct TlsMaterial {
    cert_path: PathBuf,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    ca: Option<CaBundle>,
}

#[derive(Clone)]
struct CaBundle {
    pem: Vec<u8>,
    roots: Vec<CertificateDer<'static>>,
}

impl TlsMaterial {
    /// Load the certificate/key pair, if both are configured.
    pub fn load(credentials: &Credentials) -> Result<Option<Self>> {
        let Some((cert_path, key_path)) = credentials.identity() else {
            return Ok(None);
        };

        let cert_pem = std::fs::read(cert_path).map_err(|e| Error::certificate(cert_path, e))?;
        let key_pem = std::fs::read(key_path).map_err(|e| Error::certificate(key_path, e))?;

        let certs = CertificateDer::pem_slice_iter(&cert_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::certificate(cert_path, format!("{e:?}")))?;
        if certs.is_empty() {
            return Err(Error::certificate(cert_path, "no PEM certificate found"));
        }
        PrivateKeyDer::from_pem_slice(&key_pem)
            .map_err(|e| Error::certificate(key_path, format!("{e:?}")))?;

        let ca = credentials.cacert.as_deref().and_then(load_ca_bundle);

        Ok(Some(Self {
            cert_path: cert_path.to_path_buf(),
            cert_pem,
            key_pem,
            ca,
        }))
    }

    pub fn has_custom_roots(&self) -> bool {
        self.ca.is_some()
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_path", &self.cert_path)
            .field("custom_roots", &self.has_custom_roots())
            .finish()
    }
}

fn load_ca_bundle(path: &Path) -> Option<CaBundle> {
    let pem = match std::fs::read(path) {
        Ok(pem) => pem,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "CA bundle unreadable, keeping default roots");
            return None;
        }
    };

    let roots: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&pem)
        .filter_map(|cert| cert.ok())
        .collect();
    if roots.is_empty() {
        debug!(path = %path.display(), "CA bundle holds no certificates, keeping default roots");
        return None;
    }

    Some(CaBundle { pem, roots })
}

/// Immutable transport description shared by both protocol generations.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeouts: TimeoutPolicy,
    pub tls: Option<TlsMaterial>,
}

impl TransportConfig {
    pub fn build(timeouts: TimeoutPolicy, credentials: &Credentials) -> Result<Self> {
        Ok(Self {
            timeouts,
            tls: TlsMaterial::load(credentials)?,
        })
    }

    pub fn is_mutual_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// HTTP client for the v2 keys API.
    ///
    /// No overall request timeout is set: watches are long polls. Callers
    /// bound individual reads themselves.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.timeouts.dial_timeout)
            .tcp_keepalive(self.timeouts.dial_keepalive);

        if let Some(tls) = &self.tls {
            let mut pem = tls.cert_pem.clone();
            pem.push(b'\n');
            pem.extend_from_slice(&tls.key_pem);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::certificate(&tls.cert_path, e))?;
            builder = builder.identity(identity);

            if let Some(ca) = &tls.ca {
                builder = builder.tls_built_in_root_certs(false);
                for root in &ca.roots {
                    builder = builder.add_root_certificate(reqwest::Certificate::from_der(root)?);
                }
            }
        }

        Ok(builder.build()?)
    }

    /// Connect options for the v3 gRPC channel.
    pub fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(self.timeouts.dial_timeout)
            .with_keep_alive(self.timeouts.dial_keepalive, self.timeouts.header_timeout);

        if let Some(tls) = &self.tls {
            let mut tls_options =
                TlsOptions::new().identity(Identity::from_pem(&tls.cert_pem, &tls.key_pem));
            if let Some(ca) = &tls.ca {
                tls_options = tls_options.ca_certificate(Certificate::from_pem(&ca.pem));
            }
            if self.uses_native_roots() {
                tls_options = tls_options.with_native_roots();
            }
            options = options.with_tls(tls_options);
        }

        options
    }

    /// Whether the v3 channel verifies the server against the system trust
    /// store. Only mutual TLS without a usable CA bundle does.
    pub fn uses_native_roots(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| !tls.has_custom_roots())
    }
}
