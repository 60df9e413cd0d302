// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` covers everything that can go wrong between this crate and the
//! broker: configuration, declarations, publishing, payload encoding and
//! message settlement. `HandlerError` is what event handlers return to the
//! consumption loop when they could not process a message.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid broker configuration value
    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error handing a message to the channel
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing a payload
    #[error("failure to encode payload `{0}`")]
    EncodingError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The message was already acked or rejected
    #[error("message `{0}` was already settled")]
    AlreadySettled(u64),

    /// `listen` was called on a listener that is already consuming
    #[error("listener for queue `{0}` is already consuming")]
    AlreadyListening(String),

    /// Error on the delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Error returned by an event handler.
///
/// Any error makes the consumption loop reject the message unless the
/// handler already settled it.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Application failure described by the handler
    #[error("{0}")]
    Failed(String),

    /// Broker operation failed inside the handler, typically an ack
    #[error(transparent)]
    Amqp(#[from] AmqpError),
}

impl HandlerError {
    /// Builds a [`HandlerError::Failed`] from any message.
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}
