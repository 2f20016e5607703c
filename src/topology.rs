// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Descriptors
//!
//! A [`Topology`] bundles everything an engine needs to know about the broker
//! entities it works with: the exchange, the queue, the binding between them and
//! the producer/consumer options, together with the [`Variant`] it was built for.
//!
//! Descriptors are assembled with [`TopologyBuilder`] and validated when built,
//! before any channel exists. A built `Topology` has no mutators: a channel
//! established against it always sees the same configuration.
//!
//! The descriptor also knows how to declare itself: the declaration steps each
//! variant performs before publishing or consuming live here.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    model::{self, Variant},
    options::{ConsumerOptions, ProducerOptions},
    queue::{BindingDefinition, QueueDefinition},
};
use std::fmt;
use tracing::{debug, error};

/// The side of the conversation a descriptor was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// Incrementally assembles a [`Topology`].
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding: BindingDefinition,
    consumer: ConsumerOptions,
    producer: ProducerOptions,
}

impl TopologyBuilder {
    /// Creates an empty builder; every entity starts from its defaults.
    pub fn new() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Sets the exchange definition.
    ///
    /// Ignored by Simple and Work, which publish through the default exchange.
    ///
    /// # Parameters
    /// * `def` - The exchange to declare
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchange = def;
        self
    }

    /// Sets the queue definition.
    ///
    /// Exchange-based variants replace it with an exclusive, broker-named queue.
    ///
    /// # Parameters
    /// * `def` - The queue to declare
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queue = def;
        self
    }

    /// Sets the binding between queue and exchange.
    ///
    /// # Parameters
    /// * `def` - The binding; its key doubles as the producer's static key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn binding(mut self, def: BindingDefinition) -> Self {
        self.binding = def;
        self
    }

    /// Sets the options used when the topology backs a consumer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn consumer_options(mut self, opts: ConsumerOptions) -> Self {
        self.consumer = opts;
        self
    }

    /// Sets the options used when the topology backs a producer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn producer_options(mut self, opts: ProducerOptions) -> Self {
        self.producer = opts;
        self
    }

    /// Applies the variant's defaults and validates the result for a producer.
    pub fn build_producer(self, variant: Variant) -> Result<Topology, AmqpError> {
        self.build(variant, Role::Producer)
    }

    /// Applies the variant's defaults and validates the result for a consumer.
    ///
    /// Dynamic variants only exist on the producing side and are rejected.
    pub fn build_consumer(self, variant: Variant) -> Result<Topology, AmqpError> {
        self.build(variant, Role::Consumer)
    }

    fn build(self, variant: Variant, role: Role) -> Result<Topology, AmqpError> {
        let topology = self.with_variant_defaults(variant).freeze(variant, role);
        topology.validate()?;
        Ok(topology)
    }

    /// Variant defaults win over caller options.
    fn with_variant_defaults(mut self, variant: Variant) -> Self {
        match variant.capabilities().exchange_kind {
            None => {
                self.exchange.name = String::new();
                self.exchange.kind = ExchangeKind::Direct;
                self.binding.routing_key = String::new();
            }
            Some(kind) => {
                self.queue.name = String::new();
                self.queue.exclusive = true;
                self.exchange.durable = true;
                self.exchange.kind = kind;
                if variant == Variant::Publish {
                    self.binding.routing_key = String::new();
                }
            }
        }
        self
    }

    fn freeze(self, variant: Variant, role: Role) -> Topology {
        Topology {
            variant,
            role,
            exchange: self.exchange,
            queue: self.queue,
            binding: self.binding,
            consumer: self.consumer,
            producer: self.producer,
        }
    }
}

/// A validated, immutable topology descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    variant: Variant,
    role: Role,
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding: BindingDefinition,
    consumer: ConsumerOptions,
    producer: ProducerOptions,
}

impl Topology {
    /// The messaging model the descriptor was built for.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Whether the descriptor backs a producer or a consumer.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The exchange to declare, with the variant's kind and durability applied.
    ///
    /// # Returns
    /// An unnamed definition for the default-exchange variants
    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    /// The queue to declare. Exchange-based variants leave its name empty so the
    /// broker generates one.
    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn binding(&self) -> &BindingDefinition {
        &self.binding
    }

    pub fn consumer_options(&self) -> &ConsumerOptions {
        &self.consumer
    }

    pub fn producer_options(&self) -> &ProducerOptions {
        &self.producer
    }

    /// Key used by Routing/Topic producers when a message carries none.
    pub fn static_key(&self) -> &str {
        if self.producer.routing_key.is_empty() {
            &self.binding.routing_key
        } else {
            &self.producer.routing_key
        }
    }

    /// Destination key for a message carrying `per_message_key`.
    pub fn resolve_key(&self, per_message_key: &str) -> String {
        model::resolve(
            self.variant,
            self.static_key(),
            &self.queue.name,
            per_message_key,
        )
    }

    fn validate(&self) -> Result<(), AmqpError> {
        let caps = self.variant.capabilities();
        let invalid = |what: &str| {
            let msg = format!("{} {}: {}", self.role, self.variant, what);
            error!(reason = msg.as_str(), "invalid topology");
            Err(AmqpError::InvalidTopology(msg))
        };

        if self.role == Role::Consumer && !caps.consumable {
            return invalid("no consumer exists for this model");
        }
        // both ends must agree on the name out of band, so no server-generated names
        if caps.requires_queue_name && self.queue.name.is_empty() {
            return invalid("the queue name must be specified");
        }
        if caps.requires_exchange_name && self.exchange.name.is_empty() {
            return invalid("the exchange name must be specified");
        }
        if caps.requires_binding_key && self.binding.routing_key.is_empty() {
            return invalid("the binding routing key must be specified");
        }

        Ok(())
    }

    /// Declares what a producer of this variant needs before publishing.
    pub(crate) async fn install_producer<C>(&self, channel: &C) -> Result<(), AmqpError>
    where
        C: AmqpChannel + ?Sized,
    {
        if self.variant.uses_default_exchange() {
            channel.declare_queue(&self.queue).await?;
        } else {
            channel.declare_exchange(&self.exchange).await?;
        }

        debug!(model = %self.variant, "producer topology installed");
        Ok(())
    }

    /// Declares what a consumer of this variant needs and returns the name of
    /// the queue to consume, which the broker generates for exchange variants.
    pub(crate) async fn install_consumer<C>(&self, channel: &C) -> Result<String, AmqpError>
    where
        C: AmqpChannel + ?Sized,
    {
        if self.variant.uses_default_exchange() {
            let queue = channel.declare_queue(&self.queue).await?;
            debug!(model = %self.variant, queue = queue.as_str(), "consumer topology installed");
            return Ok(queue);
        }

        channel.declare_exchange(&self.exchange).await?;
        let queue = channel.declare_queue(&self.queue).await?;
        channel
            .bind_queue(&queue, &self.exchange.name, &self.binding)
            .await?;

        debug!(model = %self.variant, queue = queue.as_str(), "consumer topology installed");
        Ok(queue)
    }
}
