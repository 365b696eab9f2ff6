//! File-backed catalog and queue backends
//!
//! These implement the registry, store and queue seams against local files
//! so the gateway can run without a cloud control plane: catalogs are TOML
//! files re-read on every call, and queues are spool directories where each
//! message is one file. Cloud-backed implementations plug into the same
//! traits.

use crate::frontends::{FrontendRecord, FrontendStore, StoreError};
use crate::queue::{
    visibility_timeout_secs, QueueApi, QueueError, QueueMessage, DEFAULT_WAIT_TIME_SECS,
};
use crate::services::{
    ContainerDefinition, RegistryError, ServiceDescription, ServiceRegistry, TaskDefinition,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Service registry backed by a TOML file
pub struct FileServiceRegistry {
    path: PathBuf,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceFile {
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceEntry {
    name: String,
    #[serde(default = "default_status")]
    status: String,
    #[serde(default)]
    containers: Vec<ContainerEntry>,
}

fn default_status() -> String {
    "ACTIVE".to_string()
}

#[derive(Debug, Deserialize)]
struct ContainerEntry {
    name: String,
    hostname: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

impl FileServiceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<ServiceFile, RegistryError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RegistryError::Api(format!("{}: {}", self.path.display(), e)))?;

        toml::from_str(&content)
            .map_err(|e| RegistryError::Api(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl ServiceRegistry for FileServiceRegistry {
    async fn list_services(&self) -> Result<Vec<String>, RegistryError> {
        let file = self.read().await?;
        Ok(file.services.into_iter().map(|s| s.name).collect())
    }

    async fn describe_service(&self, name: &str) -> Result<ServiceDescription, RegistryError> {
        let file = self.read().await?;

        file.services
            .iter()
            .find(|s| s.name == name)
            .map(|s| ServiceDescription {
                name: s.name.clone(),
                status: s.status.clone(),
                // entries double as their own task definition
                task_definition: s.name.clone(),
            })
            .ok_or(RegistryError::ServiceNotFound)
    }

    async fn describe_task_definition(&self, id: &str) -> Result<TaskDefinition, RegistryError> {
        let file = self.read().await?;

        file.services
            .iter()
            .find(|s| s.name == id)
            .map(|s| TaskDefinition {
                container_definitions: s
                    .containers
                    .iter()
                    .map(|c| ContainerDefinition {
                        name: c.name.clone(),
                        hostname: c.hostname.clone(),
                        labels: c.labels.clone(),
                    })
                    .collect(),
            })
            .ok_or_else(|| RegistryError::Api(format!("task definition not found: {}", id)))
    }
}

/// Frontend store backed by a TOML file
pub struct FileFrontendStore {
    path: PathBuf,
}

#[derive(Debug, Deserialize, Default)]
struct FrontendFile {
    #[serde(default)]
    frontends: Vec<FrontendEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontendEntry {
    name: String,
    url: String,
    service_name: String,
    #[serde(default)]
    certificate: String,
    #[serde(default)]
    private_key: String,
    /// Alternative to inline PEM: paths read at describe time
    #[serde(default)]
    certificate_file: String,
    #[serde(default)]
    private_key_file: String,
    #[serde(default)]
    certificate_expires_at: Option<u64>,
}

impl FileFrontendStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<FrontendFile, StoreError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StoreError::new(format!("{}: {}", self.path.display(), e)))?;

        toml::from_str(&content)
            .map_err(|e| StoreError::new(format!("{}: {}", self.path.display(), e)))
    }
}

async fn read_pem(inline: &str, file: &str) -> Result<String, StoreError> {
    if !inline.is_empty() || file.is_empty() {
        return Ok(inline.to_string());
    }

    tokio::fs::read_to_string(file)
        .await
        .map_err(|e| StoreError::new(format!("{}: {}", file, e)))
}

#[async_trait]
impl FrontendStore for FileFrontendStore {
    async fn scan_names(&self) -> Result<Vec<String>, StoreError> {
        let file = self.read().await?;
        Ok(file
            .frontends
            .into_iter()
            .filter(|f| !f.name.is_empty())
            .map(|f| f.name)
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Option<FrontendRecord>, StoreError> {
        let file = self.read().await?;

        let Some(entry) = file.frontends.into_iter().find(|f| f.name == name) else {
            return Ok(None);
        };

        let certificate = read_pem(&entry.certificate, &entry.certificate_file).await?;
        let private_key = read_pem(&entry.private_key, &entry.private_key_file).await?;

        Ok(Some(FrontendRecord {
            name: entry.name,
            url: entry.url,
            service_name: entry.service_name,
            certificate,
            private_key,
            certificate_expires_at: entry.certificate_expires_at,
        }))
    }
}

/// Message queue backed by a spool directory: one file per message. Claimed
/// messages are renamed aside and become visible again when older than the
/// visibility timeout, so delivery is at-least-once.
pub struct DirQueue {
    dir: PathBuf,
    wait_time: Duration,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

const CLAIMED_SUFFIX: &str = ".processing";

impl DirQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let mut queue = Self {
            dir: dir.into(),
            wait_time: Duration::from_secs(DEFAULT_WAIT_TIME_SECS),
            visibility_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(250),
        };
        queue.set_wait_time(DEFAULT_WAIT_TIME_SECS);
        queue
    }

    /// Set the long-poll wait window in seconds. The visibility timeout
    /// follows: half the wait, minimum one second.
    pub fn with_wait_time(mut self, seconds: u64) -> Self {
        self.set_wait_time(seconds);
        self
    }

    fn set_wait_time(&mut self, seconds: u64) {
        self.wait_time = Duration::from_secs(seconds);
        self.visibility_timeout = Duration::from_secs(visibility_timeout_secs(seconds));
    }

    async fn scan(&self, queue_dir: &Path) -> Result<Vec<QueueMessage>, QueueError> {
        let mut messages = Vec::new();

        let mut entries = tokio::fs::read_dir(queue_dir)
            .await
            .map_err(|e| QueueError::Api(e.to_string()))?;

        while let Ok(Some(entry)) = entries.next_entry().await.map_err(|e| e.to_string()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let claimed = path
                .to_str()
                .map(|p| p.ends_with(CLAIMED_SUFFIX))
                .unwrap_or(false);

            let receipt = if claimed {
                // re-offer claims whose visibility timeout expired
                let expired = entry
                    .metadata()
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .map(|age| age >= self.visibility_timeout)
                    .unwrap_or(false);

                if !expired {
                    continue;
                }

                path.clone()
            } else {
                let mut claimed_path = path.clone().into_os_string();
                claimed_path.push(CLAIMED_SUFFIX);
                let claimed_path = PathBuf::from(claimed_path);

                if tokio::fs::rename(&path, &claimed_path).await.is_err() {
                    // lost the claim race
                    continue;
                }

                claimed_path
            };

            match tokio::fs::read_to_string(&receipt).await {
                Ok(body) => messages.push(QueueMessage {
                    body,
                    receipt_handle: receipt.to_string_lossy().into_owned(),
                }),
                Err(_) => continue,
            }
        }

        Ok(messages)
    }
}

#[async_trait]
impl QueueApi for DirQueue {
    async fn queue_url(&self, queue_name: &str) -> Result<String, QueueError> {
        if queue_name.is_empty() {
            return Err(QueueError::MissingQueueName);
        }

        let queue_dir = self.dir.join(queue_name);
        tokio::fs::create_dir_all(&queue_dir)
            .await
            .map_err(|e| QueueError::Api(e.to_string()))?;

        Ok(queue_dir.to_string_lossy().into_owned())
    }

    async fn receive_messages(&self, queue_url: &str) -> Result<Vec<QueueMessage>, QueueError> {
        let queue_dir = PathBuf::from(queue_url);
        let deadline = tokio::time::Instant::now() + self.wait_time;

        loop {
            let messages = self.scan(&queue_dir).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Ok(Vec::new());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn delete_message(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueError> {
        tokio::fs::remove_file(receipt_handle)
            .await
            .map_err(|e| QueueError::Api(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("platform-gateway-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[tokio::test]
    async fn test_file_registry_round_trip() {
        let dir = scratch_dir();
        let path = dir.join("services.toml");
        std::fs::write(
            &path,
            r#"
            [[services]]
            name = "s1"

            [[services.containers]]
            name = "server"
            hostname = "10.0.0.1"
            labels = { "com.off-sync.platform.proxy.port" = "9000" }
        "#,
        )
        .expect("write services file");

        let registry = FileServiceRegistry::new(&path);

        assert_eq!(registry.list_services().await.expect("list"), ["s1"]);

        let description = registry.describe_service("s1").await.expect("describe");
        assert_eq!(description.status, "ACTIVE");

        let task = registry
            .describe_task_definition(&description.task_definition)
            .await
            .expect("task definition");
        assert_eq!(task.container_definitions.len(), 1);
        assert_eq!(task.container_definitions[0].hostname, "10.0.0.1");

        let missing = registry.describe_service("other").await.err();
        assert!(matches!(missing, Some(RegistryError::ServiceNotFound)));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = scratch_dir();
        let path = dir.join("frontends.toml");
        std::fs::write(
            &path,
            r#"
            [[frontends]]
            name = "f1"
            url = "http://example.com/api"
            serviceName = "s1"
        "#,
        )
        .expect("write frontends file");

        let store = FileFrontendStore::new(&path);

        assert_eq!(store.scan_names().await.expect("scan"), ["f1"]);

        let record = store.get("f1").await.expect("get").expect("record");
        assert_eq!(record.url, "http://example.com/api");
        assert_eq!(record.service_name, "s1");
        assert!(record.certificate.is_empty());

        assert!(store.get("other").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_dir_queue_receive_and_delete() {
        let dir = scratch_dir();
        let queue = DirQueue::new(&dir).with_wait_time(1);

        let url = queue.queue_url("events").await.expect("queue url");
        std::fs::write(PathBuf::from(&url).join("msg-1"), "payload").expect("write message");

        let messages = queue.receive_messages(&url).await.expect("receive");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "payload");

        queue
            .delete_message(&url, &messages[0].receipt_handle)
            .await
            .expect("delete");

        let messages = queue.receive_messages(&url).await.expect("receive");
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_dir_queue_requires_name() {
        let queue = DirQueue::new(scratch_dir());
        let err = queue.queue_url("").await.err();
        assert!(matches!(err, Some(QueueError::MissingQueueName)));
    }

    #[tokio::test]
    async fn test_dir_queue_reoffers_expired_claims() {
        let dir = scratch_dir();
        // zero wait keeps the test fast; visibility floors at one second
        let mut queue = DirQueue::new(&dir).with_wait_time(0);
        queue.visibility_timeout = Duration::from_millis(0);

        let url = queue.queue_url("events").await.expect("queue url");
        std::fs::write(
            PathBuf::from(&url).join(format!("msg-1{}", CLAIMED_SUFFIX)),
            "payload",
        )
        .expect("write claimed message");

        let messages = queue.receive_messages(&url).await.expect("receive");
        assert_eq!(messages.len(), 1);
    }
}
