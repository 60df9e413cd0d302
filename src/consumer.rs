// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch
//!
//! Decode-and-dispatch step of the consumption loop. Each delivery is decoded
//! into the event payload, handed to the handler and settled according to
//! the outcome. A failing delivery is rejected and reported through the
//! returned [`Outcome`]; it never stops the loop.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    event::{self, Event},
    listener::{AckMode, Handler, ListenerOptions},
    message::{Delivery, Message},
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// How a delivery left the dispatch step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The handler acked or rejected the message itself.
    Settled,
    /// The handler succeeded and the message was acked on its behalf.
    AutoAcked,
    /// The handler succeeded without settling the message. It stays
    /// unacknowledged until the channel closes.
    Unsettled,
    /// The message was negatively acknowledged by the loop.
    Rejected { requeue: bool, reason: String },
}

/// Decodes, dispatches and settles one delivery.
///
/// Errors are only returned when the broker refused the ack or nack; the
/// caller logs them and keeps consuming.
pub(crate) async fn consume<E, H>(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: &H,
    channel: Arc<dyn BrokerChannel>,
    options: &ListenerOptions,
) -> Result<Outcome, AmqpError>
where
    E: Event,
    H: Handler<E>,
{
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, E::SUBJECT.as_str());

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key, delivery.exchange,
    );

    let data = match event::decode::<E>(&delivery.data) {
        Ok(data) => data,
        Err(err) => {
            error!(
                error = err.to_string(),
                delivery_tag = delivery.delivery_tag,
                "error decoding message, rejecting"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("malformed payload"),
            });

            // Poison message: requeueing would only deliver it again.
            channel
                .nack(delivery.delivery_tag, false)
                .await
                .map_err(|e| {
                    error!(error = e.to_string(), "error whiling nack msg");
                    e
                })?;

            return Ok(Outcome::Rejected {
                requeue: false,
                reason: err.to_string(),
            });
        }
    };

    let msg = Message::new(delivery, channel, ctx);

    let result = match AssertUnwindSafe(handler.on_message(data, &msg))
        .catch_unwind()
        .await
    {
        Ok(result) => result.map_err(|err| err.to_string()),
        Err(_) => Err("handler panicked".to_owned()),
    };

    match result {
        Ok(()) if msg.is_settled() => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Ok(Outcome::Settled)
        }
        Ok(()) => match options.ack_mode {
            AckMode::AutoOnSuccess => {
                msg.ack().await.map_err(|e| {
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    e
                })?;
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Ok(Outcome::AutoAcked)
            }
            AckMode::Manual => {
                warn!(
                    delivery_tag = msg.delivery_tag(),
                    "handler returned without settling the message"
                );
                span.set_status(Status::Ok);
                Ok(Outcome::Unsettled)
            }
        },
        Err(reason) if msg.is_settled() => {
            warn!(error = reason.as_str(), "handler failed after settling the message");
            span.set_status(Status::Error {
                description: Cow::from(reason),
            });
            Ok(Outcome::Settled)
        }
        Err(reason) => {
            let requeue = options.requeue_on_failure;
            error!(error = reason.as_str(), requeue, "error whiling handling msg");

            span.set_status(Status::Error {
                description: Cow::from(reason.clone()),
            });

            msg.nack(requeue).await.map_err(|e| {
                span.record_error(&e);
                e
            })?;

            Ok(Outcome::Rejected { requeue, reason })
        }
    }
}
