// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Every event is published through a direct exchange: the routing key has to
//! match the binding key exactly. This module only describes the exchange;
//! declaring it is the job of the [`BrokerChannel`](crate::channel::BrokerChannel).

/// Definition of a direct exchange with its declaration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non durable, direct exchange definition.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            internal: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Name of the exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the exchange survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags() {
        let def = ExchangeDefinition::new("users").durable();
        assert_eq!(def.name(), "users");
        assert!(def.is_durable());
        assert!(!def.delete);
        assert!(!def.internal);

        let def = def.delete().internal();
        assert!(def.delete);
        assert!(def.internal);
    }
}
