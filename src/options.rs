// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer and Consumer Options
//!
//! Per-engine flags carried by a topology descriptor alongside the broker
//! entities.

use lapin::{
    options::BasicConsumeOptions,
    types::{AMQPValue, FieldTable, ShortString},
};
use std::collections::BTreeMap;

/// Options applied when registering a consumer on a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerOptions {
    pub(crate) tag: String,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_local: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ConsumerOptions {
    /// Creates options with a broker-generated tag and manual acknowledgment.
    pub fn new() -> ConsumerOptions {
        ConsumerOptions::default()
    }

    /// Sets the consumer tag. An empty tag lets the broker generate one.
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    /// Deliveries are acknowledged by the broker on send; handlers must not ack.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Makes this the only consumer allowed on the queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Do not deliver messages published on this same connection.
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    /// Registers the consumer without waiting for the broker's reply.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds a single consumer argument, e.g. `x-priority`.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// The configured tag; empty when the broker picks one.
    pub fn consumer_tag(&self) -> &str {
        &self.tag
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub(crate) fn basic_consume_options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: self.no_local,
            no_ack: self.auto_ack,
            exclusive: self.exclusive,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// Options applied to every message a producer publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerOptions {
    pub(crate) routing_key: String,
    pub(crate) tag: String,
    pub(crate) mandatory: bool,
}

impl ProducerOptions {
    /// Creates options with no key override, no tag and `mandatory` off.
    pub fn new() -> ProducerOptions {
        ProducerOptions::default()
    }

    /// Overrides the binding routing key as the static key of Routing/Topic producers.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Sets the producer tag, cancelled on the channel when the producer is.
    ///
    /// # Parameters
    /// * `tag` - The tag; empty means none
    ///
    /// # Returns
    /// Self for method chaining
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    /// Ask the broker to return messages that could not be routed to any queue.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }
}
