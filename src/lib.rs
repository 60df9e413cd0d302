// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Typed publish/subscribe over RabbitMQ direct exchanges.
//!
//! An [`Event`](event::Event) names an exchange, a subject and a payload
//! type. [`Publisher`](publisher::Publisher) and
//! [`Listener`](listener::Listener) are generic over it and run on a
//! [`BrokerChannel`](channel::BrokerChannel) supplied by the caller.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod errors;
pub mod event;
pub mod events;
pub mod exchange;
pub mod listener;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
