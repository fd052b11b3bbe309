//! In-process queue
//!
//! Behaves like a durable group: a delivered message stays in flight until it
//! is settled. [`MemoryQueue::expire_in_flight`] plays the part of the ack
//! window lapsing, or of a worker crashing, and puts unsettled messages back
//! at the head of their topic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use stratus_common::Result;
use tokio::sync::Notify;
use tracing::debug;

use super::{Acker, Delivery, Queue, Subscription};
use crate::envelope::{Envelope, Intent};

#[derive(Clone)]
struct Message {
    id: u64,
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Default)]
struct State {
    next_id: u64,
    ready: HashMap<Intent, VecDeque<Message>>,
    in_flight: HashMap<u64, (Intent, Message)>,
    acked: HashMap<Intent, usize>,
    terminated: HashMap<Intent, usize>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// Queue held in memory; clones share state
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    /// An empty, open queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a raw payload, valid or not
    pub fn publish_raw(&self, intent: Intent, payload: impl Into<Vec<u8>>) {
        {
            let mut state = self.inner.state.lock();
            state.next_id += 1;
            let message = Message {
                id: state.next_id,
                payload: payload.into(),
                deliveries: 0,
            };
            state.ready.entry(intent).or_default().push_back(message);
        }
        self.inner.notify.notify_waiters();
    }

    /// Put every unsettled message back for redelivery
    pub fn expire_in_flight(&self) -> usize {
        let expired = {
            let mut state = self.inner.state.lock();
            let mut in_flight: Vec<(Intent, Message)> =
                state.in_flight.drain().map(|(_, entry)| entry).collect();
            in_flight.sort_by_key(|(_, m)| std::cmp::Reverse(m.id));
            let count = in_flight.len();
            for (intent, message) in in_flight {
                state.ready.entry(intent).or_default().push_front(message);
            }
            count
        };
        if expired > 0 {
            debug!(expired, "Returned unacknowledged messages to the queue");
            self.inner.notify.notify_waiters();
        }
        expired
    }

    /// Stop every subscription once its topic is drained
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Messages waiting for a worker
    pub fn pending(&self, intent: Intent) -> usize {
        self.inner
            .state
            .lock()
            .ready
            .get(&intent)
            .map_or(0, VecDeque::len)
    }

    /// Messages delivered but not settled
    pub fn in_flight(&self, intent: Intent) -> usize {
        self.inner
            .state
            .lock()
            .in_flight
            .values()
            .filter(|(i, _)| *i == intent)
            .count()
    }

    /// Messages acknowledged
    pub fn acked(&self, intent: Intent) -> usize {
        self.inner.state.lock().acked.get(&intent).copied().unwrap_or(0)
    }

    /// Messages dropped as unprocessable
    pub fn terminated(&self, intent: Intent) -> usize {
        self.inner
            .state
            .lock()
            .terminated
            .get(&intent)
            .copied()
            .unwrap_or(0)
    }

    fn take(&self, intent: Intent) -> Option<Delivery> {
        let mut state = self.inner.state.lock();
        let mut message = state.ready.get_mut(&intent)?.pop_front()?;
        message.deliveries += 1;
        let delivery = Delivery::new(
            message.payload.clone(),
            message.deliveries > 1,
            Box::new(MemoryAcker {
                inner: self.inner.clone(),
                id: message.id,
            }),
        );
        state.in_flight.insert(message.id, (intent, message));
        Some(delivery)
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, intent: Intent, envelope: &Envelope) -> Result<()> {
        self.publish_raw(intent, envelope.encode()?);
        Ok(())
    }

    async fn subscribe(&self, intent: Intent) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(MemorySubscription {
            queue: self.clone(),
            intent,
        }))
    }
}

struct MemorySubscription {
    queue: MemoryQueue,
    intent: Intent,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            // Registered before checking so a publish in between is not missed
            let notified = self.queue.inner.notify.notified();
            if let Some(delivery) = self.queue.take(self.intent) {
                return Ok(Some(delivery));
            }
            if self.queue.is_closed() {
                return Ok(None);
            }
            notified.await;
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    id: u64,
}

impl MemoryAcker {
    fn settle(&self, terminated: bool) {
        let mut state = self.inner.state.lock();
        if let Some((intent, _)) = state.in_flight.remove(&self.id) {
            let counter = if terminated {
                &mut state.terminated
            } else {
                &mut state.acked
            };
            *counter.entry(intent).or_default() += 1;
        }
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(false);
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        self.settle(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: A worker that dies before acking gets the message back
    #[tokio::test]
    async fn story_unacked_message_is_redelivered() {
        let queue = MemoryQueue::new();
        queue
            .publish(Intent::CreateCluster, &Envelope::new("op-1"))
            .await
            .unwrap();
        let mut sub = queue.subscribe(Intent::CreateCluster).await.unwrap();

        let first = sub.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(queue.in_flight(Intent::CreateCluster), 1);
        drop(first);

        assert_eq!(queue.expire_in_flight(), 1);
        let second = sub.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(Envelope::decode(&second.payload).unwrap().operation_id(), Some("op-1"));

        second.ack().await.unwrap();
        assert_eq!(queue.in_flight(Intent::CreateCluster), 0);
        assert_eq!(queue.acked(Intent::CreateCluster), 1);
        assert_eq!(queue.expire_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_topics_are_separate() {
        let queue = MemoryQueue::new();
        queue.publish_raw(Intent::DeleteCluster, "x");
        assert_eq!(queue.pending(Intent::DeleteCluster), 1);
        assert_eq!(queue.pending(Intent::CreateCluster), 0);
    }

    #[tokio::test]
    async fn test_term_drops_without_redelivery() {
        let queue = MemoryQueue::new();
        queue.publish_raw(Intent::RetryCluster, "garbage");
        let mut sub = queue.subscribe(Intent::RetryCluster).await.unwrap();
        sub.next().await.unwrap().unwrap().term().await.unwrap();

        assert_eq!(queue.terminated(Intent::RetryCluster), 1);
        assert_eq!(queue.expire_in_flight(), 0);
        assert_eq!(queue.pending(Intent::RetryCluster), 0);
    }

    #[tokio::test]
    async fn test_expired_messages_keep_their_order() {
        let queue = MemoryQueue::new();
        queue.publish_raw(Intent::CreateCluster, "a");
        queue.publish_raw(Intent::CreateCluster, "b");
        let mut sub = queue.subscribe(Intent::CreateCluster).await.unwrap();
        sub.next().await.unwrap().unwrap();
        sub.next().await.unwrap().unwrap();

        queue.expire_in_flight();
        assert_eq!(sub.next().await.unwrap().unwrap().payload, b"a");
        assert_eq!(sub.next().await.unwrap().unwrap().payload, b"b");
    }

    #[tokio::test]
    async fn test_waiting_subscriber_wakes_on_publish() {
        let queue = MemoryQueue::new();
        let mut sub = queue.subscribe(Intent::CreateCluster).await.unwrap();
        let waiter = tokio::spawn(async move { sub.next().await.unwrap().map(|d| d.payload) });

        tokio::task::yield_now().await;
        queue.publish_raw(Intent::CreateCluster, "late");
        assert_eq!(waiter.await.unwrap(), Some(b"late".to_vec()));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let queue = MemoryQueue::new();
        let mut sub = queue.subscribe(Intent::DeleteCluster).await.unwrap();
        queue.close();
        assert!(sub.next().await.unwrap().is_none());
    }
}
