// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! [`BrokerChannel`] is the capability publishers and listeners are built on:
//! the handful of AMQP operations they need, behind a trait so the same code
//! runs against a `lapin` channel or the in-memory broker.
//!
//! Channels are always supplied by the caller. The helpers at the bottom of
//! this module open the connection and channels once at process startup; the
//! host owns them and shares them with every publisher and listener.

use crate::{
    config::RabbitMQConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, MessageProperties},
    queue::{QueueArgument, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
#[cfg(test)]
use mockall::automock;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// AMQP delivery mode for messages persisted to disk
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Stream of deliveries produced by a registered consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Channel operations used by publishers and listeners.
///
/// Declarations are idempotent: declaring an existing exchange or queue with
/// the same flags succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a direct exchange.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries per consumer.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Hands a message to the channel. Returns once the channel accepted it,
    /// without waiting for a broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Registers a consumer with manual acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl BrokerChannel for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .exchange_declare(
                &def.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), prefetch, "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(from_lapin_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|_| AmqpError::NackMessageError)
    }
}

/// Queue declaration arguments as an AMQP field table.
fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();
    for (key, value) in def.arguments() {
        let value = match value {
            QueueArgument::Int(v) => AMQPValue::LongInt(LongInt::from(v)),
            QueueArgument::Str(v) => AMQPValue::LongString(LongString::from(v)),
        };
        args.insert(ShortString::from(key), value);
    }

    FieldTable::from(args)
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in &props.headers {
        headers.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }

    let mut basic = BasicProperties::default().with_headers(FieldTable::from(headers));

    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }

    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.as_str()));
    }

    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.as_str()));
    }

    if props.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    basic
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(props),
        data: delivery.data,
    }
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers: props.headers().as_ref().map(string_headers).unwrap_or_default(),
    }
}

/// Only string headers are carried over; trace context is always a string.
fn string_headers(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                .ok()
                .map(|v| (key.to_string(), v.to_owned())),
            AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
            _ => None,
        })
        .collect()
}

/// Opens the connection to RabbitMQ and a first channel on it.
///
/// No retry is attempted: a failure is returned to the caller, who decides
/// whether to abort the process.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    let channel = create_channel(&conn).await?;

    Ok((Arc::new(conn), channel))
}

/// Opens one more channel on an established connection, typically one per
/// publisher or listener.
pub async fn create_channel(conn: &Connection) -> Result<Arc<Channel>, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(Arc::new(c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
