//! Live progress per operation
//!
//! [`ProgressLayer`] is a tracing layer: every event emitted inside a span
//! that carries an `operation_id` field becomes a [`ProgressEvent`] on the
//! [`ProgressHub`]. Callers subscribe by operation ID; the hub also keeps a
//! feed of everything for the NATS log mirror.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Events buffered per subscriber before the oldest are dropped
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// One log line of an operation
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Operation the event belongs to
    pub operation_id: String,
    /// Cluster being worked on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    /// Owner of the cluster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Correlation code handed to the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Log level
    pub level: String,
    /// Emitting module
    pub target: String,
    /// Log message
    pub message: String,
    /// Remaining event fields
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Subject the log mirror publishes to, when cluster and owner are known
    pub fn mirror_subject(&self) -> Option<String> {
        match (&self.cluster, &self.owner) {
            (Some(cluster), Some(owner)) => Some(format!("{cluster}-{owner}")),
            _ => None,
        }
    }
}

/// Per-operation broadcast channels
pub struct ProgressHub {
    operations: DashMap<String, broadcast::Sender<ProgressEvent>>,
    all: broadcast::Sender<ProgressEvent>,
    capacity: usize,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_CAPACITY)
    }
}

impl ProgressHub {
    /// A hub buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        Self {
            operations: DashMap::new(),
            all,
            capacity,
        }
    }

    /// Follow one operation
    ///
    /// Only events emitted after subscribing are received. The receiver
    /// reports closed once the operation finishes.
    pub fn subscribe(&self, operation_id: &str) -> broadcast::Receiver<ProgressEvent> {
        self.operations
            .entry(operation_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Follow every operation
    pub fn all(&self) -> broadcast::Receiver<ProgressEvent> {
        self.all.subscribe()
    }

    /// Hand an event to its operation's subscribers and to the full feed
    pub fn publish(&self, event: ProgressEvent) {
        if let Some(sender) = self.operations.get(&event.operation_id) {
            // No receivers left is fine
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    /// Close an operation's channel
    pub fn finish(&self, operation_id: &str) {
        self.operations.remove(operation_id);
    }

    /// Operations someone is following
    pub fn watched(&self) -> usize {
        self.operations.len()
    }
}

/// Tracing layer feeding a [`ProgressHub`]
pub struct ProgressLayer {
    hub: Arc<ProgressHub>,
}

impl ProgressLayer {
    /// Publish captured events to `hub`
    pub fn new(hub: Arc<ProgressHub>) -> Self {
        Self { hub }
    }
}

/// Correlation fields found on a span
#[derive(Clone, Debug, Default)]
struct Correlation {
    operation_id: Option<String>,
    cluster: Option<String>,
    owner: Option<String>,
    code: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.operation_id.is_none()
            && self.cluster.is_none()
            && self.owner.is_none()
            && self.code.is_none()
    }

    /// Fill gaps from an outer span; inner values win
    fn inherit(&mut self, outer: &Correlation) {
        fn fill(slot: &mut Option<String>, value: &Option<String>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }
        fill(&mut self.operation_id, &outer.operation_id);
        fill(&mut self.cluster, &outer.cluster);
        fill(&mut self.owner, &outer.owner);
        fill(&mut self.code, &outer.code);
    }

    fn set(&mut self, field: &Field, value: String) {
        match field.name() {
            "operation_id" => self.operation_id = Some(value),
            "cluster" => self.cluster = Some(value),
            "owner" => self.owner = Some(value),
            "code" => self.code = Some(value),
            _ => {}
        }
    }
}

impl Visit for Correlation {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set(field, format!("{value:?}"));
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

impl<S> Layer<S> for ProgressLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut correlation = Correlation::default();
        attrs.record(&mut correlation);
        if correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(correlation);
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(correlation) = extensions.get_mut::<Correlation>() {
            values.record(correlation);
            return;
        }
        let mut correlation = Correlation::default();
        values.record(&mut correlation);
        if !correlation.is_empty() {
            extensions.insert(correlation);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let mut correlation = Correlation::default();
        for span in scope {
            if let Some(found) = span.extensions().get::<Correlation>() {
                correlation.inherit(found);
            }
        }
        let Some(operation_id) = correlation.operation_id else {
            return;
        };

        let mut fields = EventFields::default();
        event.record(&mut fields);
        let metadata = event.metadata();
        self.hub.publish(ProgressEvent {
            operation_id,
            cluster: correlation.cluster,
            owner: correlation.owner,
            code: correlation.code,
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: fields.message,
            fields: fields.fields,
            timestamp: Utc::now(),
        });
    }
}
