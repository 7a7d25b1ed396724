//! Event bus
//!
//! Ordered-per-key pub/sub. Messages sharing an ordering key are delivered one
//! at a time in publish order; a message stays in flight until acknowledged and
//! is redelivered once its visibility window lapses.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use tracing::debug;
use veren_domain::DomainEvent;

use crate::errors::PlatformError;

/// Topic carrying every deployment event
pub const DEPLOYMENT_EVENTS: &str = "deployment-events";

/// A received message awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: u64,
    pub topic: String,
    pub ordering_key: String,
    pub body: String,
    /// Times this message has been handed out, this delivery included
    pub receive_count: u32,
    pub receipt: u64,
}

#[async_trait]
pub trait EventBusExt: Send + Sync {
    async fn publish(&self, topic: &str, ordering_key: &str, body: String) -> Result<(), PlatformError>;

    /// Wait for the next deliverable message on `topic`.
    async fn receive(&self, topic: &str) -> Result<Delivery, PlatformError>;

    /// Delete a handled message. Unacknowledged messages are redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), PlatformError>;
}

/// Stream of deliveries on `topic`
pub fn subscribe(
    bus: Arc<dyn EventBusExt>,
    topic: impl Into<String>,
) -> impl Stream<Item = Result<Delivery, PlatformError>> {
    stream::unfold((bus, topic.into()), |(bus, topic)| async move {
        let next = bus.receive(&topic).await;
        Some((next, (bus, topic)))
    })
}

/// Encodes domain events onto one bus topic
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn EventBusExt>,
    topic: String,
}

impl Publisher {
    pub fn new(bus: Arc<dyn EventBusExt>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    pub async fn publish(&self, event: &DomainEvent) -> Result<(), PlatformError> {
        let body = event.to_json()?;
        self.bus.publish(&self.topic, event.ordering_key(), body).await?;
        debug!(
            deployment_id = %event.deployment_id,
            event_type = %event.kind.type_name(),
            "Event published"
        );
        Ok(())
    }
}
