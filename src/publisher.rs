// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! A [`Publisher`] is bound to one [`Event`] and emits its payloads to the
//! event's durable direct exchange under the event's subject.
//!
//! Publishing is fire-and-forget with respect to the broker: there is no
//! publisher-confirm handshake, so a message accepted by the channel can
//! still be lost before the broker persists it. Failures on the way to the
//! channel are logged and returned.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    event::{self, Event, JSON_CONTENT_TYPE},
    exchange::ExchangeDefinition,
    message::MessageProperties,
    otel,
};
use opentelemetry::Context;
use std::{marker::PhantomData, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Publisher of the events of type `E`.
pub struct Publisher<E: Event> {
    channel: Arc<dyn BrokerChannel>,
    exchange: ExchangeDefinition,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event> Publisher<E> {
    /// Creates a publisher over a channel owned by the caller.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Publisher {
            channel,
            exchange: ExchangeDefinition::new(E::EXCHANGE).durable(),
            _event: PhantomData,
        }
    }

    /// Publishes `data` with the current trace context.
    pub async fn publish(&self, data: &E::Data) -> Result<(), AmqpError> {
        self.publish_with_context(&Context::current(), data).await
    }

    /// Publishes `data`, propagating `ctx` in the message headers.
    ///
    /// The exchange is declared on every call; the declaration is idempotent.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the headers
    /// * `data` - Event payload, sent as JSON
    ///
    /// # Returns
    /// `Ok` once the channel accepted the message, or the declaration,
    /// encoding or publishing error
    pub async fn publish_with_context(
        &self,
        ctx: &Context,
        data: &E::Data,
    ) -> Result<(), AmqpError> {
        self.channel.declare_exchange(&self.exchange).await?;

        let payload = event::encode::<E>(data).map_err(|err| {
            error!(error = err.to_string(), "error encoding message");
            err
        })?;

        let mut properties = MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            message_id: Some(Uuid::new_v4().to_string()),
            kind: Some(E::SUBJECT.to_string()),
            persistent: true,
            ..Default::default()
        };
        otel::inject(ctx, &mut properties.headers);

        self.channel
            .publish(E::EXCHANGE, E::SUBJECT.as_str(), &payload, &properties)
            .await?;

        debug!(
            exchange = E::EXCHANGE,
            routing_key = E::SUBJECT.as_str(),
            "message published"
        );

        Ok(())
    }
}
