//! Stratus operator - runs cluster operations from a durable queue
//!
//! A caller records an [`Operation`](stratus_common::resources::Operation)
//! in the store and publishes its ID on the topic of its [`Intent`]. Workers
//! in this crate pick the message up, settle it per the intent's delivery
//! rules, and drive [`stratus_cluster::ClusterLifecycle`] to completion.
//!
//! - [`envelope`]: intents and the message payload
//! - [`queue`]: the queue capability, over JetStream or in memory
//! - [`consumer`]: delivery handling and the worker loop
//! - [`progress`]: per-operation log streams and the NATS log mirror feed
//! - [`config`]: command line flags

#![deny(missing_docs)]

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod progress;
pub mod queue;

pub use config::{Cli, Commands, ConsumerConfig, EnqueueArgs, RunArgs, StoreBackend};
pub use consumer::{OperationConsumer, Outcome};
pub use envelope::{Envelope, Intent};
pub use progress::{ProgressEvent, ProgressHub, ProgressLayer};
pub use queue::{Delivery, MemoryQueue, NatsQueue, Queue, Subscription};
