use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::Result;

/// The `workflows` queue message format (§6): consumers must tolerate
/// duplicate delivery, which is why the claiming compare-and-swap in
/// [`crate::engine::storage::CatalogStore::claim`] exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub execution_id: Uuid,
    pub article_id: Uuid,
    pub config_version: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Named FIFO queues backed by an external broker (§2.2); the engine
/// consumes from a dedicated `workflows` queue. `dequeue` long-polls,
/// one of the suspension points that carries the worker's cancellation
/// token (§5).
#[async_trait::async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, message: TriggerMessage) -> Result<()>;
    async fn dequeue(&self) -> Result<Option<TriggerMessage>>;
}

/// In-process channel-backed queue for tests and single-process
/// deployments, giving dev/test parity with the NATS-backed production
/// queue.
pub struct InMemoryWorkQueue {
    sender: tokio::sync::mpsc::UnboundedSender<TriggerMessage>,
    receiver: Mutex<tokio::sync::mpsc::UnboundedReceiver<TriggerMessage>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        Self { sender, receiver: Mutex::new(receiver) }
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, message: TriggerMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|e| crate::EngineError::Queue(e.to_string()))
    }

    async fn dequeue(&self) -> Result<Option<TriggerMessage>> {
        Ok(self.receiver.lock().await.recv().await)
    }
}

/// `workflows` queue backed by core NATS pub/sub (§2.2). A production
/// deployment would prefer JetStream for at-least-once redelivery
/// semantics; this client keeps to the simpler subject-based core API.
pub struct NatsWorkQueue {
    client: async_nats::Client,
    subject: String,
    subscriber: Mutex<async_nats::Subscriber>,
}

impl NatsWorkQueue {
    pub async fn connect(nats_url: &str, subject: impl Into<String>) -> Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| crate::EngineError::Queue(e.to_string()))?;
        let subject = subject.into();
        let subscriber = client
            .subscribe(subject.clone())
            .await
            .map_err(|e| crate::EngineError::Queue(e.to_string()))?;
        Ok(Self { client, subject, subscriber: Mutex::new(subscriber) })
    }
}

#[async_trait::async_trait]
impl WorkQueue for NatsWorkQueue {
    async fn enqueue(&self, message: TriggerMessage) -> Result<()> {
        let payload = serde_json::to_vec(&message)?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| crate::EngineError::Queue(e.to_string()))
    }

    async fn dequeue(&self) -> Result<Option<TriggerMessage>> {
        use futures::StreamExt;
        let mut subscriber = self.subscriber.lock().await;
        match subscriber.next().await {
            Some(msg) => {
                let parsed: TriggerMessage = serde_json::from_slice(&msg.payload)?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_queue_round_trips_a_message() {
        let queue = InMemoryWorkQueue::new();
        let message = TriggerMessage {
            execution_id: Uuid::new_v4(),
            article_id: Uuid::new_v4(),
            config_version: 1,
            enqueued_at: Utc::now(),
        };
        queue.enqueue(message.clone()).await.unwrap();
        let received = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(received.execution_id, message.execution_id);
    }
}
