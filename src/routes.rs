//! Thread-safe routing table with a copy-on-write router
//!
//! Routes are keyed on `host|path`. Mutations rebuild an immutable router
//! snapshot which is swapped in atomically, so request serving never
//! observes a partially built table. A content digest over the sorted
//! `key:handler-identity` pairs suppresses redundant rebuilds.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::handlers::{handler_identity, Handler, ProxyBody};
use hyper::body::Incoming;
use hyper::http::uri::Uri;
use hyper::{Request, Response};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Route manager errors
#[derive(Debug, PartialEq, Eq)]
pub enum RouteError {
    /// The route URL has no host to match on
    MissingHost,
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::MissingHost => write!(f, "route URL must have a host"),
        }
    }
}

impl std::error::Error for RouteError {}

struct Route {
    url: Uri,
    handler: Handler,
}

impl Route {
    fn key(&self) -> String {
        route_key(&self.url)
    }
}

fn route_key(url: &Uri) -> String {
    let host = url.host().unwrap_or_default().to_lowercase();
    format!("{}|{}", host, url.path())
}

type Routes = HashMap<String, Route>;

fn routes_digest(routes: &Routes) -> [u8; 32] {
    let mut keys: Vec<&String> = routes.keys().collect();
    keys.sort();

    let mut hasher = Sha256::new();
    for key in keys {
        let route = &routes[key];
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(handler_identity(&route.handler).to_ne_bytes());
    }

    hasher.finalize().into()
}

/// Immutable router snapshot matching on exact host and longest path prefix
struct Router {
    digest: [u8; 32],
    /// host -> (path prefix, handler), prefixes sorted longest first
    hosts: HashMap<String, Vec<(String, Handler)>>,
}

impl Router {
    fn empty() -> Self {
        Self {
            digest: routes_digest(&Routes::new()),
            hosts: HashMap::new(),
        }
    }

    fn build(routes: &Routes, digest: [u8; 32]) -> Self {
        let mut hosts: HashMap<String, Vec<(String, Handler)>> = HashMap::new();

        for route in routes.values() {
            let host = route.url.host().unwrap_or_default().to_lowercase();

            let mut path = route.url.path().to_string();
            if path.is_empty() {
                path = "/".to_string();
            }

            hosts
                .entry(host)
                .or_default()
                .push((path, Arc::clone(&route.handler)));
        }

        for prefixes in hosts.values_mut() {
            prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        }

        Self { digest, hosts }
    }

    fn lookup(&self, host: &str, path: &str) -> Option<Handler> {
        let prefixes = self.hosts.get(host)?;
        prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, handler)| Arc::clone(handler))
    }
}

/// Thread-safe map of (host, path prefix) to handler
pub struct RouteManager {
    routes: Mutex<Routes>,
    router: RwLock<Arc<Router>>,
}

impl Default for RouteManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteManager {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Routes::new()),
            router: RwLock::new(Arc::new(Router::empty())),
        }
    }

    /// Add or replace the route for the URL's host and path, forwarding all
    /// matching requests to the provided handler.
    pub fn upsert_route(&self, url: &Uri, handler: Handler) -> Result<(), RouteError> {
        if url.host().is_none() {
            return Err(RouteError::MissingHost);
        }

        let mut routes = self.routes.lock();

        let route = Route {
            url: url.clone(),
            handler,
        };
        routes.insert(route.key(), route);

        self.reconfigure(&routes);

        Ok(())
    }

    /// Delete the route for the URL's host and path
    pub fn delete_route(&self, url: &Uri) {
        let mut routes = self.routes.lock();

        routes.remove(&route_key(url));

        self.reconfigure(&routes);
    }

    // routes is already locked when reconfigure is called
    fn reconfigure(&self, routes: &Routes) {
        let digest = routes_digest(routes);
        if digest == self.router.read().digest {
            // routes haven't been changed
            return;
        }

        let router = Arc::new(Router::build(routes, digest));

        *self.router.write() = router;
    }

    /// Serve a request using the current router snapshot. The snapshot is
    /// taken under the read lock and released before the handler runs.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let router = Arc::clone(&self.router.read());

        let host = request_host(&req);
        debug!(host = host.as_deref().unwrap_or(""), uri = %req.uri(), "serving HTTP");

        let handler = host.and_then(|host| router.lookup(&host, req.uri().path()));

        match handler {
            Some(handler) => handler.handle(req).await,
            None => json_error_response(ProxyErrorCode::UnknownRoute, "No route matches"),
        }
    }

    /// Digest of the current router snapshot
    pub fn digest(&self) -> [u8; 32] {
        self.router.read().digest
    }

    #[cfg(test)]
    fn snapshot(&self) -> Arc<Router> {
        Arc::clone(&self.router.read())
    }
}

/// Extract the request host from the Host header (HTTP/1.1) or the URI
/// authority, stripped of any port and lowercased.
fn request_host(req: &Request<Incoming>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let host = host.split(':').next()?;
    if host.is_empty() {
        return None;
    }

    Some(host.to_lowercase())
}
