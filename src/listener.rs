// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Listener
//!
//! A [`Listener`] consumes one [`Event`] from a durable queue bound to the
//! event's exchange and subject, and feeds every delivery to a [`Handler`].
//!
//! `listen` declares the topology, registers the consumer and spawns the
//! consumption loop on the tokio runtime. It returns as soon as the consumer
//! is registered. The loop runs until the channel's delivery stream closes,
//! which only happens when the host closes the channel or the connection.
//!
//! Handlers own acknowledgment: a handler calls [`Message::ack`] (or
//! [`Message::nack`]) when it is done. Listeners built with
//! [`AckMode::AutoOnSuccess`] ack on the handler's behalf when it returns
//! `Ok` without settling. Any handler error, panic or undecodable body gets
//! the message rejected; the loop carries on with the next delivery.

use crate::{
    channel::BrokerChannel,
    consumer::consume,
    errors::{AmqpError, HandlerError},
    event::Event,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::global;
use std::{marker::PhantomData, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Per-event message handler.
#[async_trait]
pub trait Handler<E: Event>: Send + Sync + 'static {
    /// Processes one decoded payload.
    ///
    /// Returning an error rejects the message unless the handler already
    /// settled it.
    async fn on_message(&self, data: E::Data, message: &Message) -> Result<(), HandlerError>;
}

/// Who acknowledges a message after a successful handler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// The handler settles every message itself.
    #[default]
    Manual,
    /// Messages the handler left unsettled are acked once it returns `Ok`.
    AutoOnSuccess,
}

/// Consumption settings of a [`Listener`].
///
/// The defaults leave acknowledgment to the handler, requeue messages whose
/// handler failed and keep the broker's prefetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Unacknowledged deliveries allowed in flight; broker default if unset.
    pub prefetch: Option<u16>,
    /// Who acknowledges a message the handler left unsettled.
    pub ack_mode: AckMode,
    /// Requeue messages whose handler failed. Undecodable messages are never
    /// requeued.
    pub requeue_on_failure: bool,
    /// Defaults to `<queue>-<uuid>`.
    pub consumer_tag: Option<String>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        ListenerOptions {
            prefetch: None,
            ack_mode: AckMode::Manual,
            requeue_on_failure: true,
            consumer_tag: None,
        }
    }
}

/// Lifecycle of a listener. `Consuming` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Nothing declared yet.
    Unbound,
    /// Exchange, queue and binding declared; no consumer registered.
    Bound,
    /// The consumption loop is running.
    Consuming,
}

/// Listener of the events of type `E`, dispatching to `H`.
pub struct Listener<E: Event, H: Handler<E>> {
    channel: Arc<dyn BrokerChannel>,
    queue: QueueDefinition,
    handler: Arc<H>,
    options: ListenerOptions,
    state: ListenerState,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event, H: Handler<E>> Listener<E, H> {
    /// Creates a listener consuming from the durable queue `queue` over a
    /// channel owned by the caller.
    ///
    /// # Parameters
    /// * `channel` - Channel shared with the host
    /// * `queue` - Name of the queue, declared durable on `listen`
    /// * `handler` - Handler receiving every decoded payload
    pub fn new(channel: Arc<dyn BrokerChannel>, queue: &str, handler: H) -> Self {
        Listener {
            channel,
            queue: QueueDefinition::new(queue).durable(),
            handler: Arc::new(handler),
            options: ListenerOptions::default(),
            state: ListenerState::Unbound,
            _event: PhantomData,
        }
    }

    /// Replaces the consumption settings.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_options(mut self, options: ListenerOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the queue definition. The queue is declared durable
    /// regardless of the definition's flag.
    pub fn with_queue(mut self, queue: QueueDefinition) -> Self {
        self.queue = queue.durable();
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Name of the queue the listener consumes from.
    pub fn queue(&self) -> &str {
        &self.queue.name
    }

    /// Declares and binds the queue, registers the consumer and spawns the
    /// consumption loop.
    ///
    /// Setup failures are logged and returned; the listener stays in the
    /// state it reached and the caller can retry or abort. Only a consuming
    /// listener refuses to listen again.
    ///
    /// # Returns
    /// Handle of the spawned loop, finishing once the delivery stream closes
    pub async fn listen(&mut self) -> Result<JoinHandle<()>, AmqpError> {
        if self.state == ListenerState::Consuming {
            return Err(AmqpError::AlreadyListening(self.queue.name.clone()));
        }

        self.bind().await?;
        self.state = ListenerState::Bound;

        if let Some(prefetch) = self.options.prefetch {
            self.channel.qos(prefetch).await?;
        }

        let consumer_tag = self
            .options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.queue.name, Uuid::new_v4()));

        let mut deliveries = self
            .channel
            .consume(&self.queue.name, &consumer_tag)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to register the consumer");
                err
            })?;
        self.state = ListenerState::Consuming;

        info!(
            queue = self.queue.name.as_str(),
            exchange = E::EXCHANGE,
            routing_key = E::SUBJECT.as_str(),
            consumer_tag = consumer_tag.as_str(),
            "listening"
        );

        let channel = self.channel.clone();
        let handler = self.handler.clone();
        let options = self.options.clone();
        let queue = self.queue.name.clone();

        Ok(tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        match consume::<E, H>(
                            &tracer,
                            delivery,
                            handler.as_ref(),
                            channel.clone(),
                            &options,
                        )
                        .await
                        {
                            Ok(outcome) => debug!(?outcome, "message dispatched"),
                            Err(err) => error!(error = err.to_string(), "error consume msg"),
                        }
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            info!(queue = queue.as_str(), "delivery stream closed");
        }))
    }

    async fn bind(&self) -> Result<(), AmqpError> {
        // Declaring the exchange here too keeps the bind from failing when no
        // publisher has run yet.
        self.channel
            .declare_exchange(&ExchangeDefinition::new(E::EXCHANGE).durable())
            .await?;

        self.channel.declare_queue(&self.queue).await?;

        self.channel
            .bind_queue(
                &QueueBinding::new(&self.queue.name)
                    .exchange(E::EXCHANGE)
                    .routing_key(E::SUBJECT.as_str()),
            )
            .await?;

        debug!(queue = self.queue.name.as_str(), "queue bound");

        Ok(())
    }
}
