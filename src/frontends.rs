//! Frontend catalog adapter
//!
//! A frontend binds a public URL to a service name, optionally carrying a
//! TLS certificate. Frontends are read from an external key-value store and
//! change events are optionally bridged from a queue watcher.

use crate::queue::{decode_names, QueueWatcher};
use async_trait::async_trait;
use hyper::http::uri::Uri;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// A TLS certificate with its private key, immutable after construction
#[derive(Clone)]
pub struct Certificate {
    certified_key: Arc<CertifiedKey>,
    not_after: Option<SystemTime>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Certificate construction errors
#[derive(Debug)]
pub enum CertificateError {
    /// The chain PEM contained no certificates
    NoCertificates,
    /// The key PEM contained no supported private key
    NoPrivateKey,
    /// PEM decoding failed
    Pem(String),
    /// The private key type is not supported by the TLS backend
    UnsupportedKey(String),
}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateError::NoCertificates => write!(f, "no certificates in PEM"),
            CertificateError::NoPrivateKey => write!(f, "no private key in PEM"),
            CertificateError::Pem(e) => write!(f, "PEM decode error: {}", e),
            CertificateError::UnsupportedKey(e) => write!(f, "unsupported private key: {}", e),
        }
    }
}

impl std::error::Error for CertificateError {}

impl Certificate {
    /// Parse a certificate chain and private key from PEM bytes
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertificateError> {
        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &*chain_pem)
            .collect::<Result<_, _>>()
            .map_err(|e| CertificateError::Pem(e.to_string()))?;

        if chain.is_empty() {
            return Err(CertificateError::NoCertificates);
        }

        let key = read_private_key(key_pem)?;
        let signing_key =
            any_supported_type(&key).map_err(|e| CertificateError::UnsupportedKey(e.to_string()))?;

        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            not_after: None,
        })
    }

    /// Attach the advisory expiry reported by the catalog
    pub fn with_not_after(mut self, not_after: SystemTime) -> Self {
        self.not_after = Some(not_after);
        self
    }

    pub fn not_after(&self) -> Option<SystemTime> {
        self.not_after
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

fn read_private_key(key_pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let mut reader = &*key_pem;

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| CertificateError::Pem(e.to_string()))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(CertificateError::NoPrivateKey)
}

/// A public frontend bound to a service
#[derive(Debug, Clone)]
pub struct Frontend {
    pub name: String,
    pub url: Uri,
    pub service_name: String,
    pub certificate: Option<Certificate>,
}

/// Change event for a frontend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendEvent {
    pub name: String,
}

/// A frontend record as stored in the catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FrontendRecord {
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub service_name: String,
    /// PEM-encoded certificate chain; empty for plaintext frontends
    pub certificate: String,
    /// PEM-encoded private key; empty for plaintext frontends
    pub private_key: String,
    /// Advisory expiry as unix time
    pub certificate_expires_at: Option<u64>,
}

/// Errors reported by a frontend store backend
#[derive(Debug)]
pub struct StoreError(String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// Interface to the external key-value store holding frontend records.
/// Implementations skip records that are missing a usable name.
#[async_trait]
pub trait FrontendStore: Send + Sync {
    async fn scan_names(&self) -> Result<Vec<String>, StoreError>;

    async fn get(&self, name: &str) -> Result<Option<FrontendRecord>, StoreError>;
}

/// Frontend catalog errors
#[derive(Debug)]
pub enum FrontendError {
    /// Sentinel: the frontend is not (or no longer) part of the catalog
    UnknownFrontend,
    /// The record URL does not parse or lacks a host
    InvalidUrl { name: String, url: String },
    /// The record carries certificate material that does not parse
    Certificate {
        name: String,
        error: CertificateError,
    },
    /// Transport or backend failure
    Store(StoreError),
}

impl fmt::Display for FrontendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendError::UnknownFrontend => write!(f, "unknown frontend"),
            FrontendError::InvalidUrl { name, url } => {
                write!(f, "invalid URL for frontend {}: {}", name, url)
            }
            FrontendError::Certificate { name, error } => {
                write!(f, "certificate error for frontend {}: {}", name, error)
            }
            FrontendError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FrontendError {}

/// Catalog of frontends backed by an external store
pub struct FrontendCatalog {
    store: Arc<dyn FrontendStore>,
    watcher: Option<Arc<QueueWatcher>>,
}

impl FrontendCatalog {
    pub fn new(store: Arc<dyn FrontendStore>) -> Self {
        Self {
            store,
            watcher: None,
        }
    }

    /// Attach a queue watcher, making the catalog watchable
    pub fn with_watcher(mut self, watcher: Arc<QueueWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// List the names of all frontends in the catalog
    pub async fn list_frontends(&self) -> Result<Vec<String>, FrontendError> {
        self.store.scan_names().await.map_err(FrontendError::Store)
    }

    /// Describe the named frontend. Returns
    /// [`FrontendError::UnknownFrontend`] when it does not exist. A record
    /// with both certificate and private key present must parse; a record
    /// with neither is a plaintext frontend.
    pub async fn describe_frontend(&self, name: &str) -> Result<Frontend, FrontendError> {
        let record = self
            .store
            .get(name)
            .await
            .map_err(FrontendError::Store)?
            .ok_or(FrontendError::UnknownFrontend)?;

        let url: Uri = record.url.parse().map_err(|_| FrontendError::InvalidUrl {
            name: name.to_string(),
            url: record.url.clone(),
        })?;

        if url.host().is_none() {
            return Err(FrontendError::InvalidUrl {
                name: name.to_string(),
                url: record.url.clone(),
            });
        }

        let certificate = if !record.certificate.is_empty() && !record.private_key.is_empty() {
            let cert =
                Certificate::from_pem(record.certificate.as_bytes(), record.private_key.as_bytes())
                    .map_err(|error| FrontendError::Certificate {
                        name: name.to_string(),
                        error,
                    })?;

            let cert = match record.certificate_expires_at {
                Some(ts) => cert.with_not_after(UNIX_EPOCH + Duration::from_secs(ts)),
                None => cert,
            };

            Some(cert)
        } else {
            None
        };

        Ok(Frontend {
            name: record.name,
            url,
            service_name: record.service_name,
            certificate,
        })
    }

    /// Subscribe to frontend change events. Returns `None` for a poll-only
    /// catalog (no queue watcher attached).
    pub fn subscribe(&self) -> Option<mpsc::Receiver<FrontendEvent>> {
        let watcher = self.watcher.as_ref()?;
        let mut messages = watcher.subscribe();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                for name in decode_names(&message.body, "Frontends") {
                    if tx.send(FrontendEvent { name }).await.is_err() {
                        return;
                    }
                }
            }
        });

        Some(rx)
    }
}
