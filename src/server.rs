//! Plain and secure web servers
//!
//! Both servers bind their listener at construction, so an unavailable
//! address fails startup instead of the accept loop. Requests are served
//! HTTP/1.1 and dispatched through an embedded [`RouteManager`]. The secure
//! server terminates TLS with a pinned profile and resolves certificates
//! per server name through a [`CertificateManager`].

use crate::certificates::CertificateManager;
use crate::frontends::Certificate;
use crate::handlers::{ClientConnection, Handler};
use crate::routes::{RouteError, RouteManager};
use crate::tasks::TaskGuard;
use anyhow::Context;
use hyper::http::uri::Uri;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Normalize a listen address: a bare `:port` binds all interfaces
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// HTTP web server routing requests by host and path prefix
pub struct WebServer {
    routes: Arc<RouteManager>,
    addr: SocketAddr,
}

impl WebServer {
    /// Bind the listener and start serving. Bind failure is fatal to
    /// construction; the accept loop holds the guard until shutdown.
    pub async fn bind(
        addr: &str,
        shutdown_rx: watch::Receiver<bool>,
        guard: TaskGuard,
    ) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr(addr))
            .await
            .with_context(|| format!("binding web server to {}", addr))?;

        let server = Arc::new(Self {
            routes: Arc::new(RouteManager::new()),
            addr: listener.local_addr()?,
        });

        info!(addr = %server.addr, "web server listening");

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&server.routes),
            shutdown_rx,
            guard,
        ));

        Ok(server)
    }

    pub fn upsert_route(&self, url: &Uri, handler: Handler) -> Result<(), RouteError> {
        self.routes.upsert_route(url, handler)
    }

    pub fn delete_route(&self, url: &Uri) {
        self.routes.delete_route(url)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// HTTPS web server with SNI certificate resolution
pub struct SecureWebServer {
    routes: Arc<RouteManager>,
    certificates: Arc<CertificateManager>,
    addr: SocketAddr,
}

impl SecureWebServer {
    /// Bind the TLS listener and start serving. Bind failure is fatal to
    /// construction; the accept loop holds the guard until shutdown.
    pub async fn bind(
        addr: &str,
        shutdown_rx: watch::Receiver<bool>,
        guard: TaskGuard,
    ) -> anyhow::Result<Arc<Self>> {
        let certificates = Arc::new(CertificateManager::new());

        let tls_config = tls_server_config(Arc::clone(&certificates))?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(listen_addr(addr))
            .await
            .with_context(|| format!("binding secure web server to {}", addr))?;

        let server = Arc::new(Self {
            routes: Arc::new(RouteManager::new()),
            certificates,
            addr: listener.local_addr()?,
        });

        info!(addr = %server.addr, "secure web server listening");

        tokio::spawn(secure_accept_loop(
            listener,
            acceptor,
            Arc::clone(&server.routes),
            shutdown_rx,
            guard,
        ));

        Ok(server)
    }

    pub fn upsert_route(&self, url: &Uri, handler: Handler) -> Result<(), RouteError> {
        self.routes.upsert_route(url, handler)
    }

    pub fn delete_route(&self, url: &Uri) {
        self.routes.delete_route(url)
    }

    /// Set the certificate served for the provided server name
    pub fn upsert_certificate(&self, server_name: &str, certificate: &Certificate) {
        self.certificates.upsert_certificate(server_name, certificate)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// TLS profile for the secure listener: TLS 1.2 with AES-256-GCM ECDHE
/// suites, NIST curves P-384 and P-256 in that order, no ALPN (so no HTTP/2
/// upgrade), certificates resolved per server name.
fn tls_server_config(resolver: Arc<CertificateManager>) -> anyhow::Result<rustls::ServerConfig> {
    use rustls::crypto::ring;

    let provider = rustls::crypto::CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ],
        kx_groups: vec![ring::kx_group::SECP384R1, ring::kx_group::SECP256R1],
        ..ring::default_provider()
    };

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12])
        .context("building TLS server config")?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = Vec::new();

    Ok(config)
}

async fn accept_loop(
    listener: TcpListener,
    routes: Arc<RouteManager>,
    mut shutdown_rx: watch::Receiver<bool>,
    _guard: TaskGuard,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let routes = Arc::clone(&routes);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, routes, addr, false).await {
                                debug!(addr = %addr, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accepting connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("web server shutting down");
                    break;
                }
            }
        }
    }
}

async fn secure_accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    routes: Arc<RouteManager>,
    mut shutdown_rx: watch::Receiver<bool>,
    _guard: TaskGuard,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let routes = Arc::clone(&routes);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    if let Err(e) = serve_connection(tls_stream, routes, addr, true).await {
                                        debug!(addr = %addr, error = %e, "TLS connection error");
                                    }
                                }
                                Err(e) => {
                                    debug!(addr = %addr, error = %e, "TLS handshake failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accepting connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("secure web server shutting down");
                    break;
                }
            }
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    routes: Arc<RouteManager>,
    addr: SocketAddr,
    secure: bool,
) -> hyper::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |mut req| {
        let routes = Arc::clone(&routes);
        req.extensions_mut().insert(ClientConnection { addr, secure });
        async move { Ok::<_, hyper::Error>(routes.handle(req).await) }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::WaitGroup;

    #[test]
    fn test_listen_addr_normalization() {
        assert_eq!(listen_addr(":80"), "0.0.0.0:80");
        assert_eq!(listen_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[test]
    fn test_tls_profile_disables_alpn() {
        let config = tls_server_config(Arc::new(CertificateManager::new())).expect("TLS config");
        assert!(config.alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let tasks = WaitGroup::new();
        let first = WebServer::bind("127.0.0.1:0", rx.clone(), tasks.guard())
            .await
            .expect("bind");

        let taken = format!("127.0.0.1:{}", first.local_addr().port());
        assert!(WebServer::bind(&taken, rx, tasks.guard()).await.is_err());
    }
}
