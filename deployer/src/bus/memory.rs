//! In-process event bus

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::bus::{Delivery, EventBusExt};
use crate::errors::PlatformError;

/// Bus options
#[derive(Debug, Clone)]
pub struct Options {
    /// Redelivery delay for unacknowledged messages
    pub visibility_timeout: Duration,

    /// Messages received this many times without an ack are dead-lettered
    pub max_receive_count: u32,

    /// Upper bound on how long an idle `receive` sleeps between checks
    pub idle_poll_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            max_receive_count: 20,
            idle_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Message {
    id: u64,
    body: String,
    receive_count: u32,
    /// `(receipt, visible_again_at)` while handed out
    in_flight: Option<(u64, Instant)>,
}

/// Messages of one topic, grouped by ordering key
#[derive(Default)]
struct TopicQueue {
    groups: HashMap<String, VecDeque<Message>>,
    /// Ordering keys in first-publish order, for fair scanning
    keys: Vec<String>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, TopicQueue>,
    dead: Vec<(String, String)>,
    next_id: u64,
    next_receipt: u64,
}

/// Event bus held in process memory
pub struct MemoryEventBus {
    options: Options,
    inner: Mutex<Inner>,
    notify: Notify,
}

enum Poll {
    Ready(Delivery),
    Wait(Option<Instant>),
}

impl MemoryEventBus {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Unacknowledged messages on `topic`
    pub async fn pending(&self, topic: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .topics
            .get(topic)
            .map(|t| t.groups.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Bodies of dead-lettered messages on `topic`
    pub async fn dead_letters(&self, topic: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .dead
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body.clone())
            .collect()
    }

    fn poll(&self, inner: &mut Inner, topic: &str, now: Instant) -> Poll {
        let visibility = self.options.visibility_timeout;
        let max_receives = self.options.max_receive_count;

        inner.next_receipt += 1;
        let receipt = inner.next_receipt;

        let Some(queue) = inner.topics.get_mut(topic) else {
            return Poll::Wait(None);
        };

        let mut wake_at: Option<Instant> = None;
        let mut dead = Vec::new();
        let mut ready = None;

        for key in queue.keys.iter() {
            let Some(group) = queue.groups.get_mut(key) else {
                continue;
            };

            // Poison messages block their group; move them aside
            while let Some(head) = group.front() {
                let expired = head.in_flight.map(|(_, at)| at <= now).unwrap_or(true);
                if expired && head.receive_count >= max_receives {
                    if let Some(message) = group.pop_front() {
                        dead.push(message.body);
                    }
                } else {
                    break;
                }
            }

            let Some(head) = group.front_mut() else {
                continue;
            };

            match head.in_flight {
                Some((_, visible_at)) if visible_at > now => {
                    wake_at = Some(wake_at.map_or(visible_at, |w| w.min(visible_at)));
                }
                _ => {
                    head.receive_count += 1;
                    head.in_flight = Some((receipt, now + visibility));
                    ready = Some(Delivery {
                        message_id: head.id,
                        topic: topic.to_string(),
                        ordering_key: key.clone(),
                        body: head.body.clone(),
                        receive_count: head.receive_count,
                        receipt,
                    });
                    break;
                }
            }
        }

        queue.groups.retain(|_, group| !group.is_empty());
        let groups = &queue.groups;
        queue.keys.retain(|key| groups.contains_key(key));

        for body in dead {
            error!(topic = %topic, "Message exceeded max receives, dead-lettered");
            inner.dead.push((topic.to_string(), body));
        }

        match ready {
            Some(delivery) => {
                // Rotate so other ordering keys get a turn
                if let Some(queue) = inner.topics.get_mut(topic) {
                    if let Some(pos) = queue.keys.iter().position(|k| *k == delivery.ordering_key) {
                        let key = queue.keys.remove(pos);
                        queue.keys.push(key);
                    }
                }
                Poll::Ready(delivery)
            }
            None => Poll::Wait(wake_at),
        }
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

#[async_trait]
impl EventBusExt for MemoryEventBus {
    async fn publish(&self, topic: &str, ordering_key: &str, body: String) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;

        let queue = inner.topics.entry(topic.to_string()).or_default();
        if !queue.groups.contains_key(ordering_key) {
            queue.keys.push(ordering_key.to_string());
        }
        queue
            .groups
            .entry(ordering_key.to_string())
            .or_default()
            .push_back(Message {
                id,
                body,
                receive_count: 0,
                in_flight: None,
            });
        drop(inner);

        debug!(topic = %topic, ordering_key = %ordering_key, message_id = id, "Message published");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, topic: &str) -> Result<Delivery, PlatformError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut inner = self.inner.lock().await;
                match self.poll(&mut inner, topic, Instant::now()) {
                    Poll::Ready(delivery) => return Ok(delivery),
                    Poll::Wait(wake_at) => wake_at,
                }
            };

            let max_wait = Instant::now() + self.options.idle_poll_interval;
            let wake_at = wake_at.map(|t| t.min(max_wait)).unwrap_or(max_wait);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        let group = inner
            .topics
            .get_mut(&delivery.topic)
            .and_then(|t| t.groups.get_mut(&delivery.ordering_key));

        let Some(group) = group else {
            return Err(PlatformError::BusError(format!(
                "Message {} already acknowledged",
                delivery.message_id
            )));
        };

        match group.front() {
            Some(head)
                if head.id == delivery.message_id
                    && head.in_flight.map(|(r, _)| r) == Some(delivery.receipt) =>
            {
                group.pop_front();
            }
            _ => {
                return Err(PlatformError::BusError(format!(
                    "Receipt for message {} is stale",
                    delivery.message_id
                )));
            }
        }
        drop(inner);

        self.notify.notify_waiters();
        Ok(())
    }
}
