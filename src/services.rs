//! Service catalog adapter
//!
//! Resolves logical service names into upstream server URLs by inspecting
//! the task definition of the service's server container in an external
//! registry. Optionally bridges change events from a queue watcher.

use crate::queue::{decode_names, QueueWatcher};
use async_trait::async_trait;
use hyper::http::uri::Uri;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default name of the container serving requests
pub const DEFAULT_SERVER_CONTAINER_NAME: &str = "server";

/// Default label carrying the server port
pub const DEFAULT_PORT_LABEL: &str = "com.off-sync.platform.proxy.port";

/// Default server port when the label is absent
pub const DEFAULT_PORT: u16 = 8080;

/// A logical service resolved to its upstream server URLs
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub servers: Vec<Uri>,
}

/// Change event for a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub name: String,
}

/// Registry-native description of a service
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub name: String,
    /// Registry lifecycle status; INACTIVE services are treated as unknown
    pub status: String,
    /// Identifier of the task definition describing the service's containers
    pub task_definition: String,
}

/// A container within a task definition
#[derive(Debug, Clone, Default)]
pub struct ContainerDefinition {
    pub name: String,
    pub hostname: String,
    pub labels: HashMap<String, String>,
}

/// A task definition as reported by the registry
#[derive(Debug, Clone, Default)]
pub struct TaskDefinition {
    pub container_definitions: Vec<ContainerDefinition>,
}

/// Errors reported by a service registry backend
#[derive(Debug)]
pub enum RegistryError {
    /// The named service does not exist in the registry
    ServiceNotFound,
    /// Any other backend failure
    Api(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::ServiceNotFound => write!(f, "service not found"),
            RegistryError::Api(e) => write!(f, "registry error: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Interface to an external service registry
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn list_services(&self) -> Result<Vec<String>, RegistryError>;

    async fn describe_service(&self, name: &str) -> Result<ServiceDescription, RegistryError>;

    async fn describe_task_definition(&self, id: &str) -> Result<TaskDefinition, RegistryError>;
}

/// Service catalog errors
#[derive(Debug)]
pub enum ServiceError {
    /// Sentinel: the service is not (or no longer) part of the catalog
    UnknownService,
    /// The port label holds a value that is not a valid port
    InvalidPort { service: String, label: String },
    /// The task definition has no container matching the configured server
    /// container name
    NoServerContainer { task_definition: String },
    /// The resolved server URL does not parse
    InvalidServerUrl { service: String, url: String },
    /// Transport or backend failure
    Registry(RegistryError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::UnknownService => write!(f, "unknown service"),
            ServiceError::InvalidPort { service, label } => {
                write!(f, "invalid port for service {}: {}", service, label)
            }
            ServiceError::NoServerContainer { task_definition } => {
                write!(f, "no server container in task definition: {}", task_definition)
            }
            ServiceError::InvalidServerUrl { service, url } => {
                write!(f, "invalid server URL for service {}: {}", service, url)
            }
            ServiceError::Registry(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Catalog of services backed by an external registry
pub struct ServiceCatalog {
    registry: Arc<dyn ServiceRegistry>,
    watcher: Option<Arc<QueueWatcher>>,

    server_container_name: String,
    port_label: String,
    default_port: u16,
}

impl ServiceCatalog {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            watcher: None,
            server_container_name: DEFAULT_SERVER_CONTAINER_NAME.to_string(),
            port_label: DEFAULT_PORT_LABEL.to_string(),
            default_port: DEFAULT_PORT,
        }
    }

    /// Attach a queue watcher, making the catalog watchable
    pub fn with_watcher(mut self, watcher: Arc<QueueWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn with_server_container_name(mut self, name: impl Into<String>) -> Self {
        self.server_container_name = name.into();
        self
    }

    pub fn with_port_label(mut self, label: impl Into<String>) -> Self {
        self.port_label = label.into();
        self
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// List the names of all services in the catalog
    pub async fn list_services(&self) -> Result<Vec<String>, ServiceError> {
        self.registry
            .list_services()
            .await
            .map_err(ServiceError::Registry)
    }

    /// Describe the named service, resolving its upstream server URLs.
    /// Returns [`ServiceError::UnknownService`] when the service does not
    /// exist or is INACTIVE.
    pub async fn describe_service(&self, name: &str) -> Result<Service, ServiceError> {
        let description = self.registry.describe_service(name).await.map_err(|e| match e {
            RegistryError::ServiceNotFound => ServiceError::UnknownService,
            other => ServiceError::Registry(other),
        })?;

        if description.status == "INACTIVE" {
            return Err(ServiceError::UnknownService);
        }

        let task_definition = self
            .registry
            .describe_task_definition(&description.task_definition)
            .await
            .map_err(ServiceError::Registry)?;

        for container in &task_definition.container_definitions {
            if container.name != self.server_container_name {
                // not the server
                continue;
            }

            let port = match container.labels.get(&self.port_label) {
                Some(label) => label.parse::<u16>().map_err(|_| ServiceError::InvalidPort {
                    service: name.to_string(),
                    label: label.clone(),
                })?,
                None => self.default_port,
            };

            let url = format!("http://{}:{}", container.hostname, port);
            let server: Uri = url.parse().map_err(|_| ServiceError::InvalidServerUrl {
                service: name.to_string(),
                url,
            })?;

            return Ok(Service {
                name: name.to_string(),
                servers: vec![server],
            });
        }

        Err(ServiceError::NoServerContainer {
            task_definition: description.task_definition,
        })
    }

    /// Subscribe to service change events. Returns `None` for a poll-only
    /// catalog (no queue watcher attached).
    pub fn subscribe(&self) -> Option<mpsc::Receiver<ServiceEvent>> {
        let watcher = self.watcher.as_ref()?;
        let mut messages = watcher.subscribe();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                for name in decode_names(&message.body, "Services") {
                    if tx.send(ServiceEvent { name }).await.is_err() {
                        return;
                    }
                }
            }
        });

        Some(rx)
    }
}
