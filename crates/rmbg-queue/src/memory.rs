//! In-memory queue: one FIFO per queue name, leases tracked in place.

use crate::QueueConfig;
use async_trait::async_trait;
use rmbg_types::{Delivery, JobDescriptor, JobQueue, QueueError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

struct Message {
    descriptor: JobDescriptor,
    visible_at: Instant,
    receipt: Option<String>,
    attempt: u32,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    heartbeats: HashMap<String, Instant>,
}

/// In-memory JobQueue for a single process (tests, embedded runs). Not durable.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    config: QueueConfig,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    async fn try_lease(&self, queue: &str) -> Option<Delivery> {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let messages = guard.queues.get_mut(queue)?;
        let msg = messages.iter_mut().find(|m| m.visible_at <= now)?;
        let receipt = Uuid::new_v4().to_string();
        if msg.receipt.is_some() {
            tracing::warn!(
                task_id = %msg.descriptor.task_id,
                attempt = msg.attempt + 1,
                "lease expired, redelivering message"
            );
        }
        msg.receipt = Some(receipt.clone());
        msg.visible_at = now + self.config.visibility_timeout;
        msg.attempt += 1;
        Some(Delivery {
            queue: queue.to_string(),
            receipt,
            attempt: msg.attempt,
            descriptor: msg.descriptor.clone(),
        })
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, queue: &str, descriptor: &JobDescriptor) -> Result<(), QueueError> {
        {
            let mut guard = self.state.lock().await;
            guard
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(Message {
                    descriptor: descriptor.clone(),
                    visible_at: Instant::now(),
                    receipt: None,
                    attempt: 0,
                });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Delivery, QueueError> {
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_lease(queue).await {
                return Ok(delivery);
            }
            let _ = tokio::time::timeout(self.config.poll_interval, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut guard = self.state.lock().await;
        let Some(messages) = guard.queues.get_mut(&delivery.queue) else {
            return Ok(false);
        };
        let pos = messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(delivery.receipt.as_str()));
        match pos {
            Some(i) => {
                messages.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let guard = self.state.lock().await;
        Ok(guard.queues.get(queue).map(|q| q.len()).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn heartbeat(&self, worker: &str) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        guard.heartbeats.insert(worker.to_string(), Instant::now());
        Ok(())
    }

    async fn live_workers(&self, within: Duration) -> Result<usize, QueueError> {
        let guard = self.state.lock().await;
        let now = Instant::now();
        Ok(guard
            .heartbeats
            .values()
            .filter(|seen| now.duration_since(**seen) <= within)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InMemoryQueue {
        InMemoryQueue::new(QueueConfig {
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
        })
    }

    fn descriptor(name: &str) -> JobDescriptor {
        JobDescriptor::new(format!("/tmp/{}", name), Some(name.to_string()), None)
    }

    #[tokio::test]
    async fn fifo_per_queue_and_single_consumer() {
        let q = queue();
        let a = descriptor("a.png");
        let b = descriptor("b.png");
        q.enqueue("gpu", &a).await.unwrap();
        q.enqueue("gpu", &b).await.unwrap();
        q.enqueue("other", &descriptor("c.png")).await.unwrap();

        let first = q.dequeue("gpu").await.unwrap();
        let second = q.dequeue("gpu").await.unwrap();
        assert_eq!(first.descriptor.task_id, a.task_id);
        assert_eq!(second.descriptor.task_id, b.task_id);
        assert_eq!(first.attempt, 1);

        // Both are leased: nothing else is visible on "gpu".
        let third = tokio::time::timeout(Duration::from_millis(50), q.dequeue("gpu")).await;
        assert!(third.is_err());

        assert!(q.ack(&first).await.unwrap());
        assert!(!q.ack(&first).await.unwrap());
        assert_eq!(q.depth("gpu").await.unwrap(), 1);
        assert_eq!(q.depth("other").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_lease_is_redelivered() {
        let q = queue();
        let a = descriptor("a.png");
        q.enqueue("gpu", &a).await.unwrap();

        let lost = q.dequeue("gpu").await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let again = q.dequeue("gpu").await.unwrap();
        assert_eq!(again.descriptor.task_id, a.task_id);
        assert_eq!(again.attempt, 2);
        assert_ne!(again.receipt, lost.receipt);

        // The stale consumer can no longer acknowledge.
        assert!(!q.ack(&lost).await.unwrap());
        assert!(q.ack(&again).await.unwrap());
        assert_eq!(q.depth("gpu").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let q = queue();
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue("gpu").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let a = descriptor("late.png");
        q.enqueue("gpu", &a).await.unwrap();
        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.descriptor.task_id, a.task_id);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_expire() {
        let q = queue();
        q.heartbeat("worker-0").await.unwrap();
        q.heartbeat("worker-1").await.unwrap();
        assert_eq!(q.live_workers(Duration::from_secs(10)).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(5)).await;
        q.heartbeat("worker-1").await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(q.live_workers(Duration::from_secs(10)).await.unwrap(), 1);
    }
}
