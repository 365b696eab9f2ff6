//! Long-polling watcher for an external message queue
//!
//! The watcher continuously receives messages from a queue and fans them out
//! through an embedded [`SubscriptionManager`], acknowledging each message
//! after delivery. The queue is at-least-once: duplicate delivery is
//! possible and downstream consumers are expected to be idempotent.

use crate::subscriptions::SubscriptionManager;
use crate::tasks::{TaskGuard, WaitGroup};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Default long-poll wait window, seconds
pub const DEFAULT_WAIT_TIME_SECS: u64 = 10;

/// Visibility timeout derived from a wait window: half the wait, minimum one
/// second.
pub fn visibility_timeout_secs(wait_time_secs: u64) -> u64 {
    (wait_time_secs / 2).max(1)
}

/// A raw message received from the queue
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Message payload
    pub body: String,
    /// Opaque handle used to acknowledge the message
    pub receipt_handle: String,
}

/// Queue watcher errors
#[derive(Debug)]
pub enum QueueError {
    /// No queue name was provided
    MissingQueueName,
    /// The named queue does not exist
    QueueNotFound(String),
    /// Error reported by the queue backend
    Api(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::MissingQueueName => write!(f, "queue name missing"),
            QueueError::QueueNotFound(name) => write!(f, "queue not found: {}", name),
            QueueError::Api(e) => write!(f, "queue API error: {}", e),
        }
    }
}

impl std::error::Error for QueueError {}

/// Interface to an external message queue service
#[async_trait]
pub trait QueueApi: Send + Sync {
    /// Resolve a queue name to the URL used by the other calls
    async fn queue_url(&self, queue_name: &str) -> Result<String, QueueError>;

    /// Receive available messages, waiting up to the backend's long-poll
    /// window. Returns an empty vector when no messages arrived in time.
    async fn receive_messages(&self, queue_url: &str) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge (delete) the message with the provided receipt handle
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str)
        -> Result<(), QueueError>;
}

/// Watches a message queue and forwards received messages to subscribers
pub struct QueueWatcher {
    subscriptions: Arc<SubscriptionManager<QueueMessage>>,
}

impl QueueWatcher {
    /// Create a watcher for the named queue. Resolving the queue URL happens
    /// here, so a missing queue fails construction rather than the poll loop.
    /// The poll loop and the embedded eviction task each hold a guard from
    /// the provided wait group.
    pub async fn new(
        api: Arc<dyn QueueApi>,
        queue_name: &str,
        shutdown_rx: watch::Receiver<bool>,
        tasks: &WaitGroup,
    ) -> Result<Arc<Self>, QueueError> {
        if queue_name.is_empty() {
            return Err(QueueError::MissingQueueName);
        }

        let queue_url = api.queue_url(queue_name).await?;

        let subscriptions = Arc::new(SubscriptionManager::new(shutdown_rx.clone(), tasks.guard()));

        info!(queue = queue_name, url = %queue_url, "watching queue");

        tokio::spawn(poll_loop(
            api,
            queue_url,
            Arc::clone(&subscriptions),
            shutdown_rx,
            tasks.guard(),
        ));

        Ok(Arc::new(Self { subscriptions }))
    }

    /// Register a subscription for raw queue messages
    pub fn subscribe(&self) -> mpsc::Receiver<QueueMessage> {
        self.subscriptions.subscribe()
    }
}

async fn poll_loop(
    api: Arc<dyn QueueApi>,
    queue_url: String,
    subscriptions: Arc<SubscriptionManager<QueueMessage>>,
    mut shutdown_rx: watch::Receiver<bool>,
    _guard: TaskGuard,
) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            received = api.receive_messages(&queue_url) => match received {
                Ok(messages) => {
                    for message in messages {
                        subscriptions.publish(message.clone()).await;

                        if let Err(e) = api.delete_message(&queue_url, &message.receipt_handle).await {
                            debug!(url = %queue_url, error = %e, "deleting message");
                        }
                    }
                }
                Err(e) => {
                    // transient; the next receive retries
                    debug!(url = %queue_url, error = %e, "receiving messages");
                }
            },
        }
    }
}

/// Decode a queue notification envelope of the form
/// `{"Message": "<json-encoded inner payload>"}`. Some publishers deliver
/// the inner payload already decoded; both shapes are accepted. Returns
/// `None` when the body does not parse.
pub fn decode_envelope(body: &str) -> Option<Value> {
    let outer: Value = serde_json::from_str(body).ok()?;

    match outer.get("Message") {
        Some(Value::String(inner)) => serde_json::from_str(inner).ok(),
        Some(inner @ Value::Object(_)) => Some(inner.clone()),
        _ => None,
    }
}

/// Extract a list of names from the provided field of a decoded envelope
pub fn decode_names(body: &str, field: &str) -> Vec<String> {
    let Some(payload) = decode_envelope(body) else {
        return Vec::new();
    };

    match payload.get(field) {
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct QueueApiMock {
        messages: Mutex<Vec<QueueMessage>>,
        deleted: Mutex<Vec<String>>,
        fail_queue_url: bool,
    }

    impl QueueApiMock {
        fn push(&self, body: &str, receipt: &str) {
            self.messages.lock().push(QueueMessage {
                body: body.to_string(),
                receipt_handle: receipt.to_string(),
            });
        }
    }

    #[async_trait]
    impl QueueApi for QueueApiMock {
        async fn queue_url(&self, queue_name: &str) -> Result<String, QueueError> {
            if self.fail_queue_url {
                return Err(QueueError::QueueNotFound(queue_name.to_string()));
            }
            Ok(format!("mock://{}", queue_name))
        }

        async fn receive_messages(
            &self,
            _queue_url: &str,
        ) -> Result<Vec<QueueMessage>, QueueError> {
            let drained: Vec<QueueMessage> = self.messages.lock().drain(..).collect();
            if drained.is_empty() {
                // long poll: do not spin when the queue is empty
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Ok(drained)
        }

        async fn delete_message(
            &self,
            _queue_url: &str,
            receipt_handle: &str,
        ) -> Result<(), QueueError> {
            self.deleted.lock().push(receipt_handle.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_watcher_requires_queue_name() {
        let (_tx, rx) = watch::channel(false);
        let api = Arc::new(QueueApiMock::default());

        let err = QueueWatcher::new(api, "", rx, &WaitGroup::new()).await.err();
        assert!(matches!(err, Some(QueueError::MissingQueueName)));
    }

    #[tokio::test]
    async fn test_watcher_fails_on_unknown_queue() {
        let (_tx, rx) = watch::channel(false);
        let api = Arc::new(QueueApiMock {
            fail_queue_url: true,
            ..Default::default()
        });

        let err = QueueWatcher::new(api, "events", rx, &WaitGroup::new()).await.err();
        assert!(matches!(err, Some(QueueError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_watcher_delivers_and_acknowledges() {
        let (_tx, rx) = watch::channel(false);
        let api = Arc::new(QueueApiMock::default());

        let watcher = QueueWatcher::new(
            Arc::clone(&api) as Arc<dyn QueueApi>,
            "events",
            rx,
            &WaitGroup::new(),
        )
        .await
        .expect("watcher");
        let mut sub = watcher.subscribe();

        api.push("payload", "r-1");

        let message = sub.recv().await.expect("message");
        assert_eq!(message.body, "payload");

        // the message is acknowledged after delivery
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(api.deleted.lock().as_slice(), ["r-1".to_string()]);
    }

    #[tokio::test]
    async fn test_watcher_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let api = Arc::new(QueueApiMock::default());
        let tasks = WaitGroup::new();

        let _watcher = QueueWatcher::new(api, "events", rx, &tasks)
            .await
            .expect("watcher");

        tx.send(true).expect("shutdown receiver alive");

        let waited =
            tokio::time::timeout(std::time::Duration::from_secs(1), tasks.wait()).await;
        assert!(waited.is_ok());
    }

    #[test]
    fn test_visibility_timeout_derivation() {
        assert_eq!(visibility_timeout_secs(10), 5);
        assert_eq!(visibility_timeout_secs(1), 1);
        assert_eq!(visibility_timeout_secs(0), 1);
    }

    #[test]
    fn test_decode_envelope_stringified() {
        let body = r#"{"Message":"{\"Services\":[\"s1\",\"s2\"]}"}"#;
        assert_eq!(decode_names(body, "Services"), ["s1", "s2"]);
    }

    #[test]
    fn test_decode_envelope_already_decoded() {
        let body = r#"{"Message":{"Frontends":["f1"]}}"#;
        assert_eq!(decode_names(body, "Frontends"), ["f1"]);
    }

    #[test]
    fn test_decode_envelope_garbage_is_dropped() {
        assert!(decode_names("not json", "Services").is_empty());
        assert!(decode_names(r#"{"Other":1}"#, "Services").is_empty());
        assert!(decode_names(r#"{"Message":"not json"}"#, "Services").is_empty());
    }
}
