// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # rabbitmq-kit
//!
//! Ready-made RabbitMQ messaging models on top of lapin: point-to-point and
//! work queues, fanout broadcast, direct routing and topic routing (static or
//! per-message keys). A [`RabbitMQ`] connection hands out [`Producer`]s, which
//! publish with one unconfirmed message at a time and a one-shot retry, and
//! [`Consumer`]s, which feed deliveries to a handler in order.

mod lifecycle;
mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod model;
pub mod options;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use config::AmqpConfig;
pub use connection::{ConnectionFault, LifecycleState, RabbitMQ};
pub use consumer::Consumer;
pub use errors::AmqpError;
pub use message::{Confirmation, OutboundMessage, ReturnedMessage};
pub use model::{resolve, Variant};
pub use otel::extract_context;
pub use publisher::{Producer, RETRY_DELAY};
pub use topology::{Topology, TopologyBuilder};
