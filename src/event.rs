// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Contract
//!
//! An [`Event`] fixes the exchange, the routing key and the payload shape of
//! one kind of message. [`Publisher`](crate::publisher::Publisher) and
//! [`Listener`](crate::listener::Listener) are generic over it, so both ends
//! of a stream always agree on where messages go.
//!
//! The payload travels as the plain JSON encoding of `Data`, without any
//! envelope.

use crate::{errors::AmqpError, events::Subject};
use serde::{de::DeserializeOwned, Serialize};

/// Content type attached to every published payload
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Type-level description of one event stream.
pub trait Event: Send + Sync + 'static {
    /// Name of the direct exchange the event is published to.
    const EXCHANGE: &'static str;

    /// Routing key of the event.
    const SUBJECT: Subject;

    /// Payload shape. Opaque to the framework beyond JSON encoding.
    type Data: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Encodes a payload into its wire representation.
pub fn encode<E: Event>(data: &E::Data) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(data).map_err(|err| AmqpError::EncodingError(err.to_string()))
}

/// Decodes a message body into the event payload.
pub fn decode<E: Event>(body: &[u8]) -> Result<E::Data, AmqpError> {
    serde_json::from_slice(body).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{UserCreated, UserCreatedData};

    #[test]
    fn decodes_what_was_encoded() {
        let data = UserCreatedData {
            id: "u1".to_owned(),
            email: "a@b.com".to_owned(),
            full_name: "A B".to_owned(),
            user_name: "ab".to_owned(),
        };

        let body = encode::<UserCreated>(&data).unwrap();
        assert_eq!(decode::<UserCreated>(&body).unwrap(), data);
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        let err = decode::<UserCreated>(b"not json").unwrap_err();
        assert!(matches!(err, AmqpError::ParsePayloadError(_)));
    }

    #[test]
    fn missing_fields_are_a_parse_error() {
        let err = decode::<UserCreated>(br#"{"id":"u1"}"#).unwrap_err();
        assert!(matches!(err, AmqpError::ParsePayloadError(_)));
    }
}
