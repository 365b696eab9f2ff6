//! Reconciliation engine
//!
//! Converges the observed catalog state into effective routes, certificates
//! and load-balancer handlers. The engine is the single owner of the
//! service-handler and frontend-config maps and consumes four inputs from
//! one loop: the shutdown signal, the polling ticker, and the two catalog
//! event channels. Every mutation is idempotent against the current catalog
//! snapshot and the periodic full poll acts as a self-heal, so arbitrary
//! ordering between events and polls is tolerated.

use crate::frontends::{FrontendCatalog, FrontendError};
use crate::handlers::{
    service_failed_handler, unknown_service_handler, Handler, HttpsRedirectHandler,
};
use crate::loadbalancer::LoadBalancer;
use crate::server::{SecureWebServer, WebServer};
use crate::services::{ServiceCatalog, ServiceError};
use hyper::http::uri::Uri;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Engine construction errors
#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    /// The polling duration must be greater than zero
    InvalidPollingDuration,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidPollingDuration => {
                write!(f, "polling duration must be greater than zero")
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Per-frontend state the engine needs to rewire and delete routes
#[derive(Debug, Clone)]
struct FrontendConfig {
    service_name: String,
    url: Uri,
    secure: bool,
}

/// Derive the plain-scheme twin of a secure URL: same authority and path,
/// scheme http. Used for the redirect route a secure frontend gets on the
/// plain server.
fn http_version_of(url: &Uri) -> Uri {
    let mut parts = url.clone().into_parts();
    parts.scheme = Some(hyper::http::uri::Scheme::HTTP);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(hyper::http::uri::PathAndQuery::from_static("/"));
    }

    Uri::from_parts(parts).unwrap_or_else(|_| url.clone())
}

/// Orchestrates catalogs, load balancer and web servers into a consistent
/// routing state
pub struct Engine {
    services: Arc<ServiceCatalog>,
    frontends: Arc<FrontendCatalog>,
    load_balancer: Arc<LoadBalancer>,
    web_server: Arc<WebServer>,
    secure_web_server: Arc<SecureWebServer>,
    polling_duration: Duration,

    service_handlers: HashMap<String, Handler>,
    frontend_configs: HashMap<String, FrontendConfig>,
}

impl Engine {
    pub fn new(
        services: Arc<ServiceCatalog>,
        frontends: Arc<FrontendCatalog>,
        load_balancer: Arc<LoadBalancer>,
        web_server: Arc<WebServer>,
        secure_web_server: Arc<SecureWebServer>,
        polling_duration: Duration,
    ) -> Result<Self, EngineError> {
        if polling_duration.is_zero() {
            return Err(EngineError::InvalidPollingDuration);
        }

        Ok(Self {
            services,
            frontends,
            load_balancer,
            web_server,
            secure_web_server,
            polling_duration,
            service_handlers: HashMap::new(),
            frontend_configs: HashMap::new(),
        })
    }

    /// Run the reconciliation loop until the shutdown signal fires. Performs
    /// an initial full reconcile before entering the loop.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut service_events = self.services.subscribe();
        let mut frontend_events = self.frontends.subscribe();

        info!(
            watchable_services = service_events.is_some(),
            watchable_frontends = frontend_events.is_some(),
            polling_secs = self.polling_duration.as_secs_f64(),
            "reconciliation engine starting"
        );

        self.configure().await;

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.polling_duration,
            self.polling_duration,
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation engine stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    debug!("polling tick");
                    self.configure().await;
                }
                event = next_event(&mut service_events) => {
                    debug!(service = %event.name, "service change event");
                    self.configure_service(&event.name).await;
                }
                event = next_event(&mut frontend_events) => {
                    debug!(frontend = %event.name, "frontend change event");
                    self.configure_frontend(&event.name).await;
                }
            }
        }
    }

    /// Full reconcile: converge every service and frontend, including ones
    /// that disappeared from the catalogs since the last pass.
    async fn configure(&mut self) {
        match self.services.list_services().await {
            Ok(names) => {
                let known: Vec<String> = self
                    .service_handlers
                    .keys()
                    .filter(|known| !names.contains(*known))
                    .cloned()
                    .collect();

                for name in names {
                    self.configure_service(&name).await;
                }

                // deletion is detected by describe failing with unknown
                for name in known {
                    self.configure_service(&name).await;
                }
            }
            Err(e) => error!(error = %e, "listing services"),
        }

        match self.frontends.list_frontends().await {
            Ok(names) => {
                let known: Vec<String> = self
                    .frontend_configs
                    .keys()
                    .filter(|known| !names.contains(*known))
                    .cloned()
                    .collect();

                for name in names {
                    self.configure_frontend(&name).await;
                }

                for name in known {
                    self.configure_frontend(&name).await;
                }
            }
            Err(e) => error!(error = %e, "listing frontends"),
        }
    }

    /// Converge a single service: upsert its load-balancer handler, or on
    /// deletion drop the handler and rewire the frontends that point at it.
    async fn configure_service(&mut self, name: &str) {
        match self.services.describe_service(name).await {
            Err(ServiceError::UnknownService) => {
                if self.service_handlers.remove(name).is_none() {
                    // unknown previously as well
                    return;
                }

                info!(service = name, "service deleted");

                for frontend in self.frontends_bound_to(name) {
                    self.configure_frontend(&frontend).await;
                }

                self.load_balancer.delete_service(name);
            }
            Err(e) => {
                // transient; the next poll retries
                error!(service = name, error = %e, "describing service");
            }
            Ok(service) => {
                let handler = match self
                    .load_balancer
                    .upsert_service(name, &service.servers)
                    .await
                {
                    Ok(handler) => handler,
                    Err(e) => {
                        error!(service = name, error = %e, "building service handler");
                        service_failed_handler()
                    }
                };

                self.service_handlers.insert(name.to_string(), handler);

                debug!(service = name, servers = service.servers.len(), "service configured");

                // the router stores handlers by value, so frontends bound to
                // this service must be rewired to pick up the new handler
                for frontend in self.frontends_bound_to(name) {
                    self.configure_frontend(&frontend).await;
                }
            }
        }
    }

    /// Converge a single frontend: upsert its route (and certificate plus
    /// redirect route when secure), or delete its routes when gone.
    async fn configure_frontend(&mut self, name: &str) {
        match self.frontends.describe_frontend(name).await {
            Err(FrontendError::UnknownFrontend) => {
                let Some(previous) = self.frontend_configs.remove(name) else {
                    // unknown previously as well
                    return;
                };

                info!(frontend = name, url = %previous.url, "frontend deleted");
                self.delete_frontend_routes(&previous);
            }
            Err(e) => {
                // the entity is skipped until its next event or poll
                error!(frontend = name, error = %e, "describing frontend");
            }
            Ok(frontend) => {
                let secure = frontend.certificate.is_some();

                // a moved or re-secured frontend leaves stale routes behind
                if let Some(previous) = self.frontend_configs.get(name) {
                    let url_changed = route_identity(&previous.url) != route_identity(&frontend.url);
                    if url_changed || previous.secure != secure {
                        let previous = previous.clone();
                        self.delete_frontend_routes(&previous);
                    }
                }

                let handler = self.service_handler(&frontend.service_name);

                if let Some(certificate) = &frontend.certificate {
                    if let Some(host) = frontend.url.host() {
                        self.secure_web_server.upsert_certificate(host, certificate);
                    }

                    if let Err(e) = self.secure_web_server.upsert_route(&frontend.url, handler) {
                        error!(frontend = name, error = %e, "upserting secure route");
                        return;
                    }

                    let redirect_url = http_version_of(&frontend.url);
                    let redirect: Handler = Arc::new(HttpsRedirectHandler::new(&frontend.url));
                    if let Err(e) = self.web_server.upsert_route(&redirect_url, redirect) {
                        error!(frontend = name, error = %e, "upserting redirect route");
                    }
                } else if let Err(e) = self.web_server.upsert_route(&frontend.url, handler) {
                    error!(frontend = name, error = %e, "upserting route");
                    return;
                }

                debug!(frontend = name, url = %frontend.url, secure, "frontend configured");

                self.frontend_configs.insert(
                    name.to_string(),
                    FrontendConfig {
                        service_name: frontend.service_name,
                        url: frontend.url,
                        secure,
                    },
                );
            }
        }
    }

    fn delete_frontend_routes(&self, config: &FrontendConfig) {
        if config.secure {
            self.secure_web_server.delete_route(&config.url);
            self.web_server.delete_route(&http_version_of(&config.url));
        } else {
            self.web_server.delete_route(&config.url);
        }
    }

    fn frontends_bound_to(&self, service_name: &str) -> Vec<String> {
        self.frontend_configs
            .iter()
            .filter(|(_, config)| config.service_name == service_name)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The current handler for a service, or a 404 placeholder when the
    /// service does not (yet) exist.
    fn service_handler(&self, name: &str) -> Handler {
        self.service_handlers
            .get(name)
            .cloned()
            .unwrap_or_else(unknown_service_handler)
    }
}

/// Host and path identity of a route, ignoring scheme
fn route_identity(url: &Uri) -> (String, String) {
    (
        url.host().unwrap_or_default().to_lowercase(),
        url.path().to_string(),
    )
}

/// Yield the next event from an optional channel. A poll-only catalog has no
/// channel and a closed channel stops yielding; both park forever so the
/// select loop falls through to its other inputs.
async fn next_event<T>(events: &mut Option<mpsc::Receiver<T>>) -> T {
    if let Some(receiver) = events {
        if let Some(event) = receiver.recv().await {
            return event;
        }
        *events = None;
    }

    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_version_of() {
        let url: Uri = "https://example.com/app".parse().expect("valid URI");
        let http = http_version_of(&url);

        assert_eq!(http.scheme_str(), Some("http"));
        assert_eq!(http.host(), Some("example.com"));
        assert_eq!(http.path(), "/app");
    }

    #[test]
    fn test_http_version_of_bare_host() {
        let url: Uri = "https://example.com".parse().expect("valid URI");
        let http = http_version_of(&url);

        assert_eq!(http.scheme_str(), Some("http"));
        assert_eq!(http.path(), "/");
    }

    #[test]
    fn test_route_identity_ignores_scheme() {
        let https: Uri = "https://Example.com/app".parse().expect("valid URI");
        let http: Uri = "http://example.com/app".parse().expect("valid URI");
        assert_eq!(route_identity(&https), route_identity(&http));
    }

    #[tokio::test]
    async fn test_next_event_parks_on_missing_channel() {
        let mut events: Option<mpsc::Receiver<u32>> = None;

        let result =
            tokio::time::timeout(Duration::from_millis(20), next_event(&mut events)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_next_event_drains_channel_then_parks() {
        let (tx, rx) = mpsc::channel(1);
        let mut events = Some(rx);

        tx.send(5u32).await.expect("send");
        assert_eq!(next_event(&mut events).await, 5);

        drop(tx);
        let result =
            tokio::time::timeout(Duration::from_millis(20), next_event(&mut events)).await;
        assert!(result.is_err());
        assert!(events.is_none());
    }
}
