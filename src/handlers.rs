//! Request handler abstraction shared by the router, the load balancer and
//! the reconciliation engine
//!
//! Handlers are stored behind `Arc` so the routing table can address them by
//! identity: the router digest changes exactly when a route points at a
//! different handler allocation.

use crate::error::{json_error_response, ProxyErrorCode};
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::http::uri::Uri;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;

/// Response body type used throughout the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Connection-level facts the listeners attach to every request as an
/// extension, so forwarding handlers can set accurate `x-forwarded-*`
/// headers.
#[derive(Debug, Clone, Copy)]
pub struct ClientConnection {
    /// Peer address of the accepted connection
    pub addr: SocketAddr,
    /// Whether the request arrived over TLS
    pub secure: bool,
}

/// An HTTP request handler
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody>;
}

/// Shared handler reference stored in routing tables
pub type Handler = Arc<dyn HttpHandler>;

/// Opaque identity of a handler allocation, used by the router digest
pub fn handler_identity(handler: &Handler) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// An empty response body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A response body holding the provided bytes
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Placeholder handler for frontends whose bound service does not (yet)
/// exist. The route stays mapped; requests get a stable 404 shape.
pub struct UnknownServiceHandler;

#[async_trait]
impl HttpHandler for UnknownServiceHandler {
    async fn handle(&self, _req: Request<Incoming>) -> Response<ProxyBody> {
        json_error_response(
            ProxyErrorCode::UnknownService,
            "Unknown or unconfigured service",
        )
    }
}

/// Returns a fresh 404 placeholder handler
pub fn unknown_service_handler() -> Handler {
    Arc::new(UnknownServiceHandler)
}

/// Placeholder handler substituted when a service handler could not be
/// built, so callers get a stable 500 shape instead of a missing route.
pub struct ServiceFailedHandler;

#[async_trait]
impl HttpHandler for ServiceFailedHandler {
    async fn handle(&self, _req: Request<Incoming>) -> Response<ProxyBody> {
        json_error_response(ProxyErrorCode::ServiceFailed, "Service is not available")
    }
}

/// Returns a fresh 500 placeholder handler
pub fn service_failed_handler() -> Handler {
    Arc::new(ServiceFailedHandler)
}

/// Permanent redirect from the plain listener to the secure URL of a
/// frontend, preserving the request path and query.
pub struct HttpsRedirectHandler {
    authority: String,
}

impl HttpsRedirectHandler {
    /// Create a redirect handler targeting the host (and optional port) of
    /// the provided secure URL.
    pub fn new(secure_url: &Uri) -> Self {
        let authority = secure_url
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Self { authority }
    }
}

#[async_trait]
impl HttpHandler for HttpsRedirectHandler {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let location = format!("https://{}{}", self.authority, path);

        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(hyper::header::LOCATION, location)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(full_body("Redirecting to HTTPS"))
            .expect("valid response builder")
    }
}
