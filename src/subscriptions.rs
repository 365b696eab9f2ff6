//! Event fan-out to a dynamic set of subscribers
//!
//! Every subscriber gets its own channel with a single-slot buffer. Publish
//! delivers to all subscribers concurrently and returns once every delivery
//! has either been accepted or timed out. A subscriber that does not accept
//! an event within the publish timeout is evicted: its entry is removed and
//! its channel closed, so a slow or absent reader never blocks publishing
//! beyond the timeout. Dropped events are not retried; consumers are
//! expected to treat catalog polling as the source of truth.

use crate::tasks::TaskGuard;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// Default time a subscriber gets to accept a published event
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the internal cancellation queue used to serialize evictions
const CANCELLATION_QUEUE_DEPTH: usize = 10;

type Subscriptions<T> = Arc<RwLock<HashMap<String, mpsc::Sender<T>>>>;

/// Manages a set of subscriptions and publishes events to them
pub struct SubscriptionManager<T> {
    subscriptions: Subscriptions<T>,
    publish_timeout: Duration,
    cancellations: mpsc::Sender<String>,
}

impl<T: Clone + Send + 'static> SubscriptionManager<T> {
    /// Create a new manager tied to the provided shutdown signal. All open
    /// subscriptions are closed when the signal fires; the guard is held by
    /// the eviction task until then.
    pub fn new(shutdown_rx: watch::Receiver<bool>, guard: TaskGuard) -> Self {
        Self::with_publish_timeout(shutdown_rx, DEFAULT_PUBLISH_TIMEOUT, guard)
    }

    pub fn with_publish_timeout(
        shutdown_rx: watch::Receiver<bool>,
        publish_timeout: Duration,
        guard: TaskGuard,
    ) -> Self {
        let subscriptions: Subscriptions<T> = Arc::new(RwLock::new(HashMap::new()));
        let (cancel_tx, cancel_rx) = mpsc::channel(CANCELLATION_QUEUE_DEPTH);

        tokio::spawn(process_cancellations(
            Arc::clone(&subscriptions),
            cancel_rx,
            shutdown_rx,
            guard,
        ));

        Self {
            subscriptions,
            publish_timeout,
            cancellations: cancel_tx,
        }
    }

    /// Register a new subscription and return the channel through which
    /// events will be received.
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(1);
        let id = Uuid::new_v4().to_string();

        self.subscriptions.write().insert(id, tx);

        rx
    }

    /// Publish an event to all subscribers. Every subscriber has the
    /// configured publish timeout to accept the event; one that does not is
    /// scheduled for eviction. Returns after every delivery has resolved.
    pub async fn publish(&self, event: T) {
        let targets: Vec<(String, mpsc::Sender<T>)> = self
            .subscriptions
            .read()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();

        let deliveries = targets.into_iter().map(|(id, tx)| {
            let event = event.clone();
            let cancellations = self.cancellations.clone();
            let publish_timeout = self.publish_timeout;

            async move {
                match tokio::time::timeout(publish_timeout, tx.send(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        // receiver gone or too slow
                        debug!(subscription = %id, "evicting subscriber");
                        let _ = cancellations.send(id).await;
                    }
                }
            }
        });

        futures::future::join_all(deliveries).await;
    }

    /// Number of currently registered subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

/// Serializes evictions into a single writer so that publishers and readers
/// never take the write lock themselves. Clears all subscriptions when the
/// shutdown signal fires.
async fn process_cancellations<T>(
    subscriptions: Subscriptions<T>,
    mut cancel_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    _guard: TaskGuard,
) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            subscriptions.write().clear();
            return;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    subscriptions.write().clear();
                    return;
                }
            }
            id = cancel_rx.recv() => match id {
                Some(id) => {
                    // removing the entry drops the sender, closing the channel
                    subscriptions.write().remove(&id);
                }
                None => return,
            },
        }
    }
}
