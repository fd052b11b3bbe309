//! JetStream backend
//!
//! One stream with work-queue retention covers every intent under
//! `<prefix>.<topic>`. Each intent gets a durable pull consumer named after
//! its group, with explicit acks, so the group survives restarts and an
//! unacknowledged message is redelivered once `ack_wait` lapses.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, AckKind};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use stratus_common::{Error, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Acker, Delivery, Queue, Subscription};
use crate::config::ConsumerConfig;
use crate::envelope::{Envelope, Intent};
use crate::progress::ProgressHub;

/// Queue over a NATS JetStream stream
pub struct NatsQueue {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: jetstream::stream::Stream,
    subject_prefix: String,
    ack_wait: Duration,
}

impl NatsQueue {
    /// Connect and make sure the stream exists
    pub async fn connect(config: &ConsumerConfig) -> Result<Self> {
        let client = async_nats::connect(&config.nats_url)
            .await
            .map_err(|e| Error::queue(&config.nats_url, format!("failed to connect: {e}")))?;
        info!(url = %config.nats_url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream.clone(),
                subjects: vec![format!("{}.>", config.subject_prefix)],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::queue(&config.stream, format!("failed to create stream: {e}")))?;
        info!(stream = %config.stream, "JetStream stream ready");

        Ok(Self {
            client,
            jetstream,
            stream,
            subject_prefix: config.subject_prefix.clone(),
            ack_wait: config.ack_wait,
        })
    }

    fn subject(&self, intent: Intent) -> String {
        format!("{}.{}", self.subject_prefix, intent.topic())
    }

    /// Forward progress events to `<cluster>-<owner>` on core NATS
    ///
    /// Runs until the hub is dropped. Publish failures are logged and skipped.
    pub fn mirror_progress(&self, hub: &ProgressHub) -> JoinHandle<()> {
        let client = self.client.clone();
        let mut events = hub.all();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Log mirror fell behind");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(subject) = event.mirror_subject() else {
                    continue;
                };
                let payload = match serde_json::to_vec(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode progress event");
                        continue;
                    }
                };
                if let Err(e) = client.publish(subject, payload.into()).await {
                    warn!(error = %e, "Failed to mirror progress event");
                }
            }
        })
    }
}

#[async_trait]
impl Queue for NatsQueue {
    async fn publish(&self, intent: Intent, envelope: &Envelope) -> Result<()> {
        let subject = self.subject(intent);
        self.jetstream
            .publish(subject.clone(), envelope.encode()?.into())
            .await
            .map_err(|e| Error::queue(&subject, e.to_string()))?
            .await
            .map_err(|e| Error::queue(&subject, format!("publish not acknowledged: {e}")))?;
        debug!(subject = %subject, operation_id = %envelope.operation_id, "Published envelope");
        Ok(())
    }

    async fn subscribe(&self, intent: Intent) -> Result<Box<dyn Subscription>> {
        let group = intent.group();
        let consumer: jetstream::consumer::Consumer<pull::Config> = self
            .stream
            .get_or_create_consumer(
                group,
                pull::Config {
                    durable_name: Some(group.to_string()),
                    filter_subject: self.subject(intent),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::queue(group, format!("failed to create consumer: {e}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::queue(group, format!("failed to open message stream: {e}")))?;
        debug!(group, "Joined durable group");

        Ok(Box::new(NatsSubscription {
            group,
            messages: messages.boxed(),
        }))
    }
}

type MessageStream =
    BoxStream<'static, std::result::Result<jetstream::Message, pull::MessagesError>>;

struct NatsSubscription {
    group: &'static str,
    messages: MessageStream,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let message = match self.messages.next().await {
            Some(message) => message.map_err(|e| Error::queue(self.group, e.to_string()))?,
            None => return Ok(None),
        };
        let redelivered = message.info().map(|info| info.delivered > 1).unwrap_or(false);
        Ok(Some(Delivery::new(
            message.payload.to_vec(),
            redelivered,
            Box::new(NatsAcker {
                group: self.group,
                message,
            }),
        )))
    }
}

struct NatsAcker {
    group: &'static str,
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| Error::queue(self.group, format!("ack failed: {e}")))
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| Error::queue(self.group, format!("term failed: {e}")))
    }
}
