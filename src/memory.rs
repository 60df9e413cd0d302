// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local stand-in for RabbitMQ implementing [`BrokerChannel`]. It
//! follows the broker semantics publishers and listeners rely on: direct
//! routing with exact key match, idempotent declarations that fail when the
//! flags differ, manual acknowledgment with per-delivery tags, requeue with
//! the redelivered flag, and dead-lettering through the queue's
//! `x-dead-letter-exchange`.
//!
//! Prefetch limits are accepted but not enforced. Nothing is persisted; the
//! `durable` flags are only recorded so they can be inspected.
//!
//! ```rust,ignore
//! let broker = InMemoryBroker::new();
//! let publisher = Publisher::<UserCreated>::new(broker.channel());
//! let mut listener = Listener::<UserCreated, _>::new(broker.channel(), "mailer", handler);
//! listener.listen().await?;
//! publisher.publish(&data).await?;
//! ```

use crate::{
    channel::{BrokerChannel, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, MessageProperties},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Snapshot of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub durable: bool,
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Messages delivered and not yet settled.
    pub unacked: usize,
    pub consumers: usize,
    /// Rejected messages routed to the dead letter exchange.
    pub dead_lettered: usize,
    /// Rejected messages dropped for lack of a dead letter exchange.
    pub discarded: usize,
}

#[derive(Debug, Clone)]
struct Pending {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    data: Vec<u8>,
}

/// A registered consumer. Once `cancelled` is set its stream ends without
/// yielding the deliveries still buffered in the channel.
struct Consumer {
    tx: mpsc::UnboundedSender<Delivery>,
    cancelled: Arc<AtomicBool>,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Pending>,
    unacked: HashMap<u64, Pending>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    dead_lettered: usize,
    discarded: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    /// Delivery tag -> queue holding the unacked delivery.
    in_flight: HashMap<u64, String>,
    next_tag: u64,
}

/// Shared broker state. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// A channel on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates an empty broker: no exchange, queue or binding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a channel on the broker.
    pub fn channel(&self) -> Arc<InMemoryChannel> {
        Arc::new(InMemoryChannel {
            state: self.state.clone(),
        })
    }

    /// Definition of a declared exchange.
    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        lock(&self.state).exchanges.get(name).cloned()
    }

    /// Snapshot of a declared queue.
    pub fn queue(&self, name: &str) -> Option<QueueInfo> {
        lock(&self.state).queues.get(name).map(|q| QueueInfo {
            durable: q.def.durable,
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            consumers: q.consumers.len(),
            dead_lettered: q.dead_lettered,
            discarded: q.discarded,
        })
    }

    /// Cancels every consumer. Unacked messages go back to the head of their
    /// queue, flagged redelivered, and the delivery streams end right away:
    /// deliveries a stream had buffered but not yielded yet are dropped, so a
    /// message is only seen again through a later consumer.
    ///
    /// A handler still running at close time settles a message that is
    /// already back in the queue; its ack or nack fails.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        let state = &mut *state;

        for queue in state.queues.values_mut() {
            for consumer in queue.consumers.drain(..) {
                consumer.cancelled.store(true, Ordering::Release);
            }

            let mut tags: Vec<u64> = queue.unacked.keys().copied().collect();
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(mut pending) = queue.unacked.remove(&tag) {
                    pending.redelivered = true;
                    queue.ready.push_front(pending);
                }
                state.in_flight.remove(&tag);
            }
        }

        debug!("in-memory broker closed");
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Enqueues `pending` on every queue bound to `exchange` with `routing_key`.
/// Returns the number of queues that received it.
fn route(state: &mut BrokerState, exchange: &str, routing_key: &str, pending: Pending) -> usize {
    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|b| b.exchange_name == exchange && b.routing_key == routing_key)
        .map(|b| b.queue_name.clone())
        .collect();

    for name in &targets {
        if let Some(queue) = state.queues.get_mut(name) {
            queue.ready.push_back(pending.clone());
        }
        dispatch(state, name);
    }

    targets.len()
}

/// Pushes ready messages to the queue's consumers, round robin.
fn dispatch(state: &mut BrokerState, queue_name: &str) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    while !queue.consumers.is_empty() {
        let Some(pending) = queue.ready.pop_front() else {
            break;
        };

        let idx = queue.next_consumer % queue.consumers.len();
        state.next_tag += 1;
        let tag = state.next_tag;

        let delivery = Delivery {
            delivery_tag: tag,
            exchange: pending.exchange.clone(),
            routing_key: pending.routing_key.clone(),
            redelivered: pending.redelivered,
            properties: pending.properties.clone(),
            data: pending.data.clone(),
        };

        if queue.consumers[idx].tx.send(delivery).is_err() {
            queue.consumers.remove(idx);
            queue.ready.push_front(pending);
            continue;
        }

        queue.next_consumer = idx + 1;
        queue.unacked.insert(tag, pending);
        state.in_flight.insert(tag, queue_name.to_owned());
    }
}

impl InMemoryChannel {
    fn settle(&self, delivery_tag: u64) -> Option<(String, Pending)> {
        let mut state = lock(&self.state);
        let queue_name = state.in_flight.remove(&delivery_tag)?;
        let pending = state.queues.get_mut(&queue_name)?.unacked.remove(&delivery_tag)?;
        Some((queue_name, pending))
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);

        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                warn!(name = def.name.as_str(), "exchange redeclared with different flags");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);

        match state.queues.get(&def.name) {
            Some(existing) if existing.def != *def => {
                warn!(name = def.name.as_str(), "queue redeclared with different flags");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        consumers: vec![],
                        next_consumer: 0,
                        dead_lettered: 0,
                        discarded: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }

        Ok(())
    }

    async fn qos(&self, _prefetch: u16) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);

        match state.exchanges.get(exchange) {
            None => {
                return Err(AmqpError::PublishingError(format!(
                    "no exchange `{}`",
                    exchange
                )))
            }
            Some(def) if def.internal => {
                return Err(AmqpError::PublishingError(format!(
                    "exchange `{}` is internal",
                    exchange
                )))
            }
            _ => {}
        }

        let pending = Pending {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: properties.clone(),
            data: payload.to_vec(),
        };

        if route(&mut state, exchange, routing_key, pending) == 0 {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        {
            let mut state = lock(&self.state);
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            };
            q.consumers.push(Consumer {
                tx,
                cancelled: cancelled.clone(),
            });
            dispatch(&mut state, queue);
        }

        Ok(stream::unfold((rx, cancelled), |(mut rx, cancelled)| async move {
            match rx.recv().await {
                Some(_) if cancelled.load(Ordering::Acquire) => None,
                Some(delivery) => Some((Ok(delivery), (rx, cancelled))),
                None => None,
            }
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settle(delivery_tag)
            .map(|_| ())
            .ok_or(AmqpError::AckMessageError)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let (queue_name, mut pending) = self
            .settle(delivery_tag)
            .ok_or(AmqpError::NackMessageError)?;

        let mut state = lock(&self.state);
        let state = &mut *state;

        if requeue {
            pending.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_front(pending);
            }
            dispatch(state, &queue_name);
            return Ok(());
        }

        let dlx = state
            .queues
            .get(&queue_name)
            .and_then(|q| q.def.dead_letter_exchange.clone())
            .filter(|dlx| state.exchanges.contains_key(dlx));

        let dead_lettered = match dlx {
            Some(dlx) => {
                let routing_key = pending.routing_key.clone();
                route(state, &dlx, &routing_key, pending);
                true
            }
            None => false,
        };

        if let Some(queue) = state.queues.get_mut(&queue_name) {
            if dead_lettered {
                queue.dead_lettered += 1;
            } else {
                queue.discarded += 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(broker: &InMemoryBroker, queue: QueueDefinition, key: &str) {
        let channel = broker.channel();
        channel
            .declare_exchange(&ExchangeDefinition::new("users").durable())
            .await
            .unwrap();
        channel.declare_queue(&queue).await.unwrap();
        channel
            .bind_queue(&QueueBinding::new(queue.name()).exchange("users").routing_key(key))
            .await
            .unwrap();
    }

    async fn publish(channel: &InMemoryChannel, key: &str, body: &[u8]) {
        channel
            .publish("users", key, body, &MessageProperties::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn redeclaring_with_same_flags_is_idempotent() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        let def = ExchangeDefinition::new("users").durable();

        channel.declare_exchange(&def).await.unwrap();
        channel.declare_exchange(&def).await.unwrap();
        assert!(broker.exchange("users").unwrap().is_durable());

        let err = channel
            .declare_exchange(&ExchangeDefinition::new("users"))
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::DeclareExchangeError("users".to_owned()));
    }

    #[tokio::test]
    async fn conflicting_queue_declaration_fails() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();

        channel
            .declare_queue(&QueueDefinition::new("mailer").durable())
            .await
            .unwrap();
        let err = channel
            .declare_queue(&QueueDefinition::new("mailer"))
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::DeclareQueueError("mailer".to_owned()));
    }

    #[tokio::test]
    async fn binding_requires_both_ends() {
        let broker = InMemoryBroker::new();
        let err = broker
            .channel()
            .bind_queue(&QueueBinding::new("mailer").exchange("users").routing_key("user:created"))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::BindingExchangeToQueueError(_, _)));
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();
        let err = broker
            .channel()
            .publish("nowhere", "user:created", b"{}", &MessageProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::PublishingError(_)));
    }

    #[tokio::test]
    async fn routes_on_exact_key_only() {
        let broker = InMemoryBroker::new();
        setup(&broker, QueueDefinition::new("mailer").durable(), "user:created").await;

        let channel = broker.channel();
        publish(&channel, "user:deleted", b"{}").await;
        publish(&channel, "user:created", b"{}").await;

        let info = broker.queue("mailer").unwrap();
        assert!(info.durable);
        assert_eq!(info.ready, 1);
    }

    #[tokio::test]
    async fn ack_and_requeue_track_deliveries() {
        let broker = InMemoryBroker::new();
        setup(&broker, QueueDefinition::new("mailer").durable(), "user:created").await;

        let channel = broker.channel();
        publish(&channel, "user:created", b"first").await;
        publish(&channel, "user:created", b"second").await;

        let mut deliveries = channel.consume("mailer", "test").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"first");
        assert_eq!(second.data, b"second");
        assert_eq!(broker.queue("mailer").unwrap().unacked, 2);

        channel.ack(first.delivery_tag).await.unwrap();
        assert_eq!(
            channel.ack(first.delivery_tag).await,
            Err(AmqpError::AckMessageError)
        );

        channel.nack(second.delivery_tag, true).await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.data, b"second");
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, second.delivery_tag);

        channel.ack(again.delivery_tag).await.unwrap();
        let info = broker.queue("mailer").unwrap();
        assert_eq!((info.ready, info.unacked), (0, 0));
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered_when_configured() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        channel
            .declare_exchange(&ExchangeDefinition::new("users-dlx").durable())
            .await
            .unwrap();
        setup(
            &broker,
            QueueDefinition::new("mailer").durable().dead_letter_exchange("users-dlx"),
            "user:created",
        )
        .await;
        channel
            .declare_queue(&QueueDefinition::new("mailer-dlq").durable())
            .await
            .unwrap();
        channel
            .bind_queue(
                &QueueBinding::new("mailer-dlq")
                    .exchange("users-dlx")
                    .routing_key("user:created"),
            )
            .await
            .unwrap();

        publish(&channel, "user:created", b"poison").await;
        let mut deliveries = channel.consume("mailer", "test").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue("mailer").unwrap().dead_lettered, 1);
        assert_eq!(broker.queue("mailer-dlq").unwrap().ready, 1);
    }

    #[tokio::test]
    async fn rejected_messages_without_dlx_are_discarded() {
        let broker = InMemoryBroker::new();
        setup(&broker, QueueDefinition::new("mailer").durable(), "user:created").await;

        let channel = broker.channel();
        publish(&channel, "user:created", b"poison").await;
        let mut deliveries = channel.consume("mailer", "test").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        let info = broker.queue("mailer").unwrap();
        assert_eq!((info.ready, info.unacked, info.discarded), (0, 0, 1));
    }

    #[tokio::test]
    async fn close_ends_streams_and_returns_unacked() {
        let broker = InMemoryBroker::new();
        setup(&broker, QueueDefinition::new("mailer").durable(), "user:created").await;

        let channel = broker.channel();
        publish(&channel, "user:created", b"pending").await;
        let mut deliveries = channel.consume("mailer", "test").await.unwrap();
        deliveries.next().await.unwrap().unwrap();

        broker.close();
        assert!(deliveries.next().await.is_none());

        let info = broker.queue("mailer").unwrap();
        assert_eq!((info.ready, info.unacked, info.consumers), (1, 0, 0));
    }

    #[tokio::test]
    async fn close_drops_buffered_deliveries() {
        let broker = InMemoryBroker::new();
        setup(&broker, QueueDefinition::new("mailer").durable(), "user:created").await;

        let channel = broker.channel();
        let mut deliveries = channel.consume("mailer", "test").await.unwrap();
        publish(&channel, "user:created", b"first").await;
        publish(&channel, "user:created", b"second").await;

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"first");

        broker.close();
        assert!(deliveries.next().await.is_none());
        assert_eq!(
            channel.ack(first.delivery_tag).await,
            Err(AmqpError::AckMessageError)
        );

        let mut again = channel.consume("mailer", "next").await.unwrap();
        let first = again.next().await.unwrap().unwrap();
        let second = again.next().await.unwrap().unwrap();
        assert_eq!((first.data.as_slice(), first.redelivered), (&b"first"[..], true));
        assert_eq!((second.data.as_slice(), second.redelivered), (&b"second"[..], true));
    }
}
