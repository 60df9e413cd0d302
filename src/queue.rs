// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders describing the queue a listener consumes from and the binding
//! that attaches it to an event's exchange.

use std::collections::BTreeMap;

/// Queue argument used to set the per-message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument used to cap the number of ready messages
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Queue argument naming the exchange rejected messages are dead-lettered to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// Value of a queue declaration argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueArgument {
    Int(i32),
    Str(String),
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name and no flags set.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message TTL. Expired messages are removed from the queue.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of ready messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Rejected messages that are not requeued are routed to `exchange`,
    /// keeping their original routing key.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the queue survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Declaration arguments derived from the optional settings.
    pub fn arguments(&self) -> BTreeMap<String, QueueArgument> {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), QueueArgument::Int(ttl));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), QueueArgument::Int(max));
        }

        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                QueueArgument::Str(dlx.clone()),
            );
        }

        args
    }
}

/// Binding of a queue to an exchange under a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for the given queue with an empty exchange and
    /// routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange the queue is bound to.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the binding key. On a direct exchange only messages published
    /// with exactly this routing key reach the queue.
    ///
    /// # Parameters
    /// * `key` - The binding key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
