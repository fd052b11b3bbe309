//! Operation queue
//!
//! Durable, at-least-once delivery with manual acknowledgement. Every worker
//! of an intent joins the same durable group, so each message goes to one
//! live worker; a message that is never acknowledged comes back once the
//! ack window lapses, flagged as redelivered.
//!
//! Two backends: [`NatsQueue`] over JetStream for real deployments, and
//! [`MemoryQueue`] for tests and single-process runs.

mod memory;
mod nats;

use async_trait::async_trait;
use stratus_common::Result;

use crate::envelope::{Envelope, Intent};

pub use memory::MemoryQueue;
pub use nats::NatsQueue;

/// Publish and subscribe by intent
#[async_trait]
pub trait Queue: Send + Sync {
    /// Publish an envelope on the intent's topic
    async fn publish(&self, intent: Intent, envelope: &Envelope) -> Result<()>;

    /// Join the intent's durable group
    async fn subscribe(&self, intent: Intent) -> Result<Box<dyn Subscription>>;
}

/// One worker's membership in a durable group
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message; `None` once the queue is closed
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

/// Settles a delivered message with the backend
#[async_trait]
pub trait Acker: Send + Sync {
    /// The message is done; never deliver it again
    async fn ack(&self) -> Result<()>;

    /// The message can never be processed; drop it without redelivery
    async fn term(&self) -> Result<()>;
}

/// A received message
///
/// Dropping a delivery without settling it leaves the message in flight, and
/// the backend redelivers it later.
pub struct Delivery {
    /// Raw payload
    pub payload: Vec<u8>,
    /// True if an earlier delivery was never acknowledged
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    /// Wrap a payload with the handle that settles it
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    /// Acknowledge
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Drop without redelivery
    pub async fn term(&self) -> Result<()> {
        self.acker.term().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
