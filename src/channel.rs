// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Operations
//!
//! The channel primitives the publish engine and the consumption loop rely on,
//! expressed as the [`AmqpChannel`] trait and implemented for `lapin::Channel`.
//! Each engine exclusively owns one channel for its whole life.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Confirmation, OutboundMessage},
    options::ConsumerOptions,
    otel::RabbitMQTracePropagator,
    queue::{BindingDefinition, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt, TryStreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicCancelOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::{global, Context};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Reply code sent when a channel is closed on purpose
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// The broker's eventual verdict on a published message.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Inbound deliveries of one consumer registration.
pub type DeliveryStream<D> = BoxStream<'static, Result<D, AmqpError>>;

/// A registered consumer: the tag the broker knows it by and its deliveries.
pub struct ConsumerStream<D> {
    pub tag: String,
    pub deliveries: DeliveryStream<D>,
}

/// Channel primitives used by the engines.
#[cfg_attr(test, automock(type Delivery = Vec<u8>;))]
#[async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    /// The inbound delivery handed to consumer handlers.
    type Delivery: Send + 'static;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns its name, generated by the broker when
    /// the definition leaves it empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingDefinition,
    ) -> Result<(), AmqpError>;

    /// Enables publisher confirms; fails if the broker does not support them.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Transmits one message. An `Err` is a transport failure; the broker's
    /// verdict arrives through the returned future.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        msg: &OutboundMessage,
    ) -> Result<PendingConfirm, AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumerOptions,
    ) -> Result<ConsumerStream<Self::Delivery>, AmqpError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Cancels the broker-side consumer registered under `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl AmqpChannel for Channel {
    type Delivery = Delivery;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().to_string())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingDefinition,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, binding.routing_key
        );

        match self
            .queue_bind(
                queue,
                exchange,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                binding.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        Channel::confirm_select(self, ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConfirmationError(err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        msg: &OutboundMessage,
    ) -> Result<PendingConfirm, AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(
                &Context::current(),
                &mut RabbitMQTracePropagator::new(&mut headers),
            )
        });

        let confirm = self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory,
                },
                &msg.body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(msg.content_type.clone()))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?;

        Ok(async move {
            confirm
                .await
                .map(Confirmation::from)
                .map_err(|err| AmqpError::ConfirmationError(err.to_string()))
        }
        .boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumerOptions,
    ) -> Result<ConsumerStream<Delivery>, AmqpError> {
        let consumer = self
            .basic_consume(
                queue,
                &opts.tag,
                opts.basic_consume_options(),
                opts.arguments(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(ConsumerStream {
            tag: consumer.tag().to_string(),
            deliveries: consumer
                .map_err(|err| AmqpError::ConsumerError(err.to_string()))
                .boxed(),
        })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| match AmqpError::from(&err) {
                AmqpError::ChannelStateError => AmqpError::ChannelStateError,
                _ => AmqpError::CancelConsumerError(consumer_tag.to_owned()),
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Channel::close(self, AMQP_REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| match AmqpError::from(&err) {
                AmqpError::ChannelStateError => AmqpError::ChannelStateError,
                _ => AmqpError::CloseChannelError(err.to_string()),
            })
    }
}

/// Releases an engine's channel: cancels its consumer registration, if any,
/// then closes it. A channel already in error state counts as released.
pub(crate) async fn release_channel<C: AmqpChannel + ?Sized>(
    channel: &C,
    consumer_tag: Option<&str>,
) -> Result<(), AmqpError> {
    if let Some(tag) = consumer_tag.filter(|tag| !tag.is_empty()) {
        match channel.cancel(tag).await {
            Err(err) if err.is_benign_on_release() => {
                warn!(tag, "consumer already gone while cancelling");
            }
            Err(err) => {
                error!(error = err.to_string(), tag, "failure to cancel consumer");
                return Err(err);
            }
            Ok(()) => debug!(tag, "consumer cancelled"),
        }
    }

    match channel.close().await {
        Err(err) if err.is_benign_on_release() => {
            warn!("channel already closed");
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to close channel");
            Err(err)
        }
        Ok(()) => {
            debug!("channel closed");
            Ok(())
        }
    }
}
