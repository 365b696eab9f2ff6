//! Round-robin load balancer over resolved upstream addresses
//!
//! `upsert_service` resolves every server URL's host to its addresses and
//! builds a forwarding handler cycling over the union. Forwarding goes
//! through a shared pooled HTTP client so connections to upstreams are
//! reused across requests and services.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::handlers::{ClientConnection, Handler, HttpHandler, ProxyBody};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::http::uri::Uri;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Load balancer errors
#[derive(Debug)]
pub enum LoadBalancerError {
    /// A server URL has no host to resolve
    MissingHost { service: String, url: String },
    /// Host resolution failed
    Resolve {
        service: String,
        host: String,
        error: String,
    },
    /// Resolution produced no usable upstream
    NoUpstreams { service: String },
}

impl fmt::Display for LoadBalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancerError::MissingHost { service, url } => {
                write!(f, "server URL for service {} has no host: {}", service, url)
            }
            LoadBalancerError::Resolve {
                service,
                host,
                error,
            } => write!(f, "resolving {} for service {}: {}", host, service, error),
            LoadBalancerError::NoUpstreams { service } => {
                write!(f, "no upstreams resolved for service {}", service)
            }
        }
    }
}

impl std::error::Error for LoadBalancerError {}

/// Builds per-service forwarding handlers over a shared pooled client
pub struct LoadBalancer {
    client: Client<HttpConnector, Incoming>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { client }
    }

    /// Set the server URLs for a service. Every URL's host is resolved to
    /// all of its addresses; one upstream is synthesized per address,
    /// preserving scheme and port. Returns the handler that forwards
    /// requests to the service.
    pub async fn upsert_service(
        &self,
        name: &str,
        urls: &[Uri],
    ) -> Result<Handler, LoadBalancerError> {
        let mut upstreams = Vec::new();

        for url in urls {
            let host = url.host().ok_or_else(|| LoadBalancerError::MissingHost {
                service: name.to_string(),
                url: url.to_string(),
            })?;

            let scheme = url.scheme_str().unwrap_or("http").to_string();
            let port = url
                .port_u16()
                .unwrap_or(if scheme == "https" { 443 } else { 80 });

            let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
                LoadBalancerError::Resolve {
                    service: name.to_string(),
                    host: host.to_string(),
                    error: e.to_string(),
                }
            })?;

            for addr in addrs {
                let upstream: Uri = match format!("{}://{}", scheme, addr).parse() {
                    Ok(uri) => uri,
                    Err(_) => continue,
                };
                upstreams.push(upstream);
            }
        }

        if upstreams.is_empty() {
            return Err(LoadBalancerError::NoUpstreams {
                service: name.to_string(),
            });
        }

        debug!(service = name, upstreams = upstreams.len(), "service upserted");

        Ok(Arc::new(RoundRobinForwarder {
            service: name.to_string(),
            upstreams,
            next: AtomicUsize::new(0),
            client: self.client.clone(),
        }))
    }

    /// Delete a service. Handler references are dropped by the caller, so
    /// there is nothing to tear down here.
    pub fn delete_service(&self, _name: &str) {}
}

/// Forwards requests to a fixed set of upstreams in round-robin order
struct RoundRobinForwarder {
    service: String,
    upstreams: Vec<Uri>,
    next: AtomicUsize,
    client: Client<HttpConnector, Incoming>,
}

impl RoundRobinForwarder {
    fn next_upstream(&self) -> &Uri {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.upstreams.len();
        &self.upstreams[idx]
    }
}

#[async_trait]
impl HttpHandler for RoundRobinForwarder {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let upstream = self.next_upstream();

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let uri = format!(
            "{}://{}{}",
            upstream.scheme_str().unwrap_or("http"),
            upstream.authority().map(|a| a.as_str()).unwrap_or_default(),
            path_and_query
        );

        let (mut parts, body) = req.into_parts();

        // overwrite the forwarding headers rather than appending, so clients
        // cannot spoof them; this proxy is the first trusted hop
        if let Some(host) = parts.headers.get(hyper::header::HOST).cloned() {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(conn) = parts.extensions.get::<ClientConnection>() {
            if let Ok(value) = HeaderValue::from_str(&conn.addr.ip().to_string()) {
                parts.headers.insert(X_FORWARDED_FOR, value);
            }

            let proto = if conn.secure { "https" } else { "http" };
            parts.headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        }

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = match builder.body(body) {
            Ok(req) => req,
            Err(e) => {
                error!(service = %self.service, error = %e, "building upstream request");
                return json_error_response(
                    ProxyErrorCode::UpstreamConnectionFailed,
                    "Failed to build upstream request",
                );
            }
        };

        match self.client.request(upstream_req).await {
            Ok(response) => {
                debug!(
                    service = %self.service,
                    upstream = %uri,
                    status = response.status().as_u16(),
                    "forwarded request"
                );
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                error!(service = %self.service, upstream = %uri, error = %e, "forwarding request");
                json_error_response(
                    ProxyErrorCode::UpstreamConnectionFailed,
                    "Failed to connect to upstream",
                )
            }
        }
    }
}
