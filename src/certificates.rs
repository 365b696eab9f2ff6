//! Thread-safe certificate store with SNI resolution
//!
//! Certificates are stored per server name and handed to the TLS stack
//! through the [`ResolvesServerCert`] callback. A client hello without a
//! matching certificate resolves to nothing, which aborts the handshake.

use crate::frontends::Certificate;
use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Maps server names to certificates for SNI resolution
pub struct CertificateManager {
    certificates: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("certificates", &self.certificates.read().len())
            .finish()
    }
}

impl Default for CertificateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateManager {
    pub fn new() -> Self {
        Self {
            certificates: RwLock::new(HashMap::new()),
        }
    }

    /// Set the certificate for the provided server name
    pub fn upsert_certificate(&self, server_name: &str, certificate: &Certificate) {
        self.certificates
            .write()
            .insert(server_name.to_lowercase(), certificate.certified_key());
    }

    /// Look up the certificate for a server name. SNI names are
    /// case-insensitive DNS names, so lookups normalize the same way
    /// upserts do.
    pub fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.certificates
            .read()
            .get(&server_name.to_lowercase())
            .cloned()
    }
}

impl ResolvesServerCert for CertificateManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        self.lookup(server_name)
    }
}
