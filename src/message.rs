// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries and Messages
//!
//! A [`Delivery`] is what the broker pushes to a consumer: the body plus the
//! metadata needed to settle it. A [`Message`] wraps a delivery together with
//! the channel it came from, so a handler can acknowledge or reject it.
//!
//! A message is settled exactly once. Further `ack`/`nack`/`reject` calls
//! fail with [`AmqpError::AlreadySettled`] and never reach the broker, since
//! RabbitMQ closes the channel on a double acknowledgment.

use crate::{channel::BrokerChannel, errors::AmqpError};
use opentelemetry::Context;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::error;

/// Message properties carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// AMQP `type` property, set to the event subject.
    pub kind: Option<String>,
    /// Delivery mode 2 when true.
    pub persistent: bool,
    /// String headers, trace context included.
    pub headers: BTreeMap<String, String>,
}

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

/// A delivery handed to an event handler.
pub struct Message {
    delivery: Delivery,
    channel: Arc<dyn BrokerChannel>,
    settled: AtomicBool,
    ctx: Context,
}

impl Message {
    pub(crate) fn new(delivery: Delivery, channel: Arc<dyn BrokerChannel>, ctx: Context) -> Self {
        Message {
            delivery,
            channel,
            settled: AtomicBool::new(false),
            ctx,
        }
    }

    /// The delivery as received from the broker.
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Channel-scoped tag identifying the delivery when settling it.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    /// Routing key the message was published with, the event subject.
    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    /// True when the broker delivered this message before without it being
    /// acknowledged.
    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// Raw JSON body.
    pub fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    /// Trace context extracted from the message headers.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// True once `ack`, `nack` or `reject` was called.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Acknowledges the message, removing it from the queue.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.settle()?;

        self.channel.ack(self.delivery.delivery_tag).await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack msg");
            err
        })
    }

    /// Negatively acknowledges the message. With `requeue` the broker
    /// delivers it again, otherwise it is dead-lettered or dropped.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle()?;

        self.channel
            .nack(self.delivery.delivery_tag, requeue)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                err
            })
    }

    /// Rejects the message without requeueing it.
    pub async fn reject(&self) -> Result<(), AmqpError> {
        self.nack(false).await
    }

    fn settle(&self) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(AmqpError::AlreadySettled(self.delivery.delivery_tag));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockBrokerChannel;

    fn delivery(tag: u64, data: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: "users".to_owned(),
            routing_key: "user:created".to_owned(),
            redelivered: false,
            properties: MessageProperties::default(),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn ack_settles_once() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .withf(|tag| *tag == 7)
            .times(1)
            .returning(|_| Ok(()));

        let msg = Message::new(delivery(7, b"{}"), Arc::new(channel), Context::new());
        assert!(!msg.is_settled());

        msg.ack().await.unwrap();
        assert!(msg.is_settled());

        assert_eq!(msg.ack().await, Err(AmqpError::AlreadySettled(7)));
        assert_eq!(msg.reject().await, Err(AmqpError::AlreadySettled(7)));
    }

    #[tokio::test]
    async fn reject_does_not_requeue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .withf(|tag, requeue| *tag == 3 && !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let msg = Message::new(delivery(3, b"{}"), Arc::new(channel), Context::new());
        msg.reject().await.unwrap();
        assert!(msg.is_settled());
    }

    #[tokio::test]
    async fn broker_failure_still_counts_as_settled() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError));

        let msg = Message::new(delivery(1, b"{}"), Arc::new(channel), Context::new());
        assert_eq!(msg.ack().await, Err(AmqpError::AckMessageError));
        assert!(msg.is_settled());
    }
}
