// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types
//!
//! Values flowing through the publish engine: outbound application messages,
//! broker confirmations, and messages the broker returned as unroutable.

use crate::{codec::Codec, errors::AmqpError};
use lapin::message::BasicReturnMessage;
use serde::Serialize;

/// Default content type for binary payloads
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// A message handed to a producer for publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Per-message routing key; only honoured by Routing/Topic variants.
    pub routing_key: Option<String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// Creates a message with an `application/octet-stream` body and no routing key.
    ///
    /// # Parameters
    /// * `body` - The raw payload
    ///
    /// # Returns
    /// A message ready for a producer's outbound stream
    pub fn new(body: impl Into<Vec<u8>>) -> OutboundMessage {
        OutboundMessage {
            routing_key: None,
            content_type: OCTET_STREAM_CONTENT_TYPE.to_owned(),
            body: body.into(),
        }
    }

    /// Encodes `value` with `codec`, taking the codec's content type.
    pub fn encode<C, T>(codec: &C, value: &T) -> Result<OutboundMessage, AmqpError>
    where
        C: Codec,
        T: Serialize + ?Sized,
    {
        Ok(OutboundMessage {
            routing_key: None,
            content_type: codec.content_type().to_owned(),
            body: codec.marshal(value)?,
        })
    }

    /// Sets the per-message routing key used by Routing/Topic producers.
    ///
    /// # Parameters
    /// * `key` - Routing key; an empty key falls back to the topology's static key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Overrides the content type reported in the message properties.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub(crate) fn key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or_default()
    }
}

/// A message the broker could not route and sent back (requires `mandatory`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub body: Vec<u8>,
}

impl From<BasicReturnMessage> for ReturnedMessage {
    fn from(msg: BasicReturnMessage) -> Self {
        ReturnedMessage {
            exchange: msg.delivery.exchange.to_string(),
            routing_key: msg.delivery.routing_key.to_string(),
            reply_code: msg.reply_code,
            reply_text: msg.reply_text.to_string(),
            body: msg.delivery.data,
        }
    }
}

/// The broker's verdict on one published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub ack: bool,
    pub returned: Option<ReturnedMessage>,
}

impl Confirmation {
    /// A positive acknowledgment.
    pub fn ack() -> Confirmation {
        Confirmation {
            ack: true,
            returned: None,
        }
    }

    /// A negative acknowledgment; the engine logs it and moves on.
    pub fn nack() -> Confirmation {
        Confirmation {
            ack: false,
            returned: None,
        }
    }
}

impl From<lapin::publisher_confirm::Confirmation> for Confirmation {
    fn from(confirmation: lapin::publisher_confirm::Confirmation) -> Self {
        use lapin::publisher_confirm::Confirmation as Lapin;

        match confirmation {
            Lapin::Ack(returned) => Confirmation {
                ack: true,
                returned: returned.map(|msg| ReturnedMessage::from(*msg)),
            },
            Lapin::Nack(returned) => Confirmation {
                ack: false,
                returned: returned.map(|msg| ReturnedMessage::from(*msg)),
            },
            Lapin::NotRequested => Confirmation::ack(),
        }
    }
}
