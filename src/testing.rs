// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory channel used by the engine tests.

use crate::{
    channel::{AmqpChannel, ConsumerStream, PendingConfirm},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    lifecycle::lock,
    message::{Confirmation, OutboundMessage, ReturnedMessage},
    options::ConsumerOptions,
    queue::{BindingDefinition, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, FutureExt, StreamExt};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;

type DeliveryResult = Result<Vec<u8>, AmqpError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub published: Vec<Published>,
    pub attempts: usize,
    pub outstanding: usize,
    pub max_outstanding: usize,
    /// Number of upcoming publishes that fail at the transport.
    pub fail_next: usize,
    /// 1-based attempt numbers that fail at the transport.
    pub fail_attempts: Vec<usize>,
    pub confirms_unsupported: bool,
    pub nack: bool,
    pub return_unroutable: bool,
    /// Confirmations resolve as if the channel went away.
    pub confirm_source_closed: bool,
    pub confirm_delays: VecDeque<Duration>,
    pub exchanges: Vec<String>,
    pub queues: Vec<String>,
    pub bindings: Vec<(String, String, String)>,
    pub consumed: Vec<String>,
    pub prefetch: Option<u16>,
    pub cancels: Vec<String>,
    pub closes: usize,
}

#[derive(Clone)]
pub(crate) struct FakeChannel {
    pub state: Arc<Mutex<FakeState>>,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<DeliveryResult>>>>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<DeliveryResult>>>>,
}

impl FakeChannel {
    pub fn new() -> FakeChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        FakeChannel {
            state: Arc::default(),
            sender: Arc::new(Mutex::new(Some(tx))),
            receiver: Arc::new(Mutex::new(Some(rx))),
        }
    }

    pub fn with(self, setup: impl FnOnce(&mut FakeState)) -> FakeChannel {
        setup(&mut lock(&self.state));
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        lock(&self.state)
    }

    pub fn deliver(&self, body: &[u8]) {
        if let Some(tx) = lock(&self.sender).as_ref() {
            let _ = tx.send(Ok(body.to_vec()));
        }
    }

    pub fn deliver_error(&self) {
        if let Some(tx) = lock(&self.sender).as_ref() {
            let _ = tx.send(Err(AmqpError::ConsumerError("stream".to_owned())));
        }
    }

    /// Ends the delivery stream, as the broker does when the consumer goes away.
    pub fn end_deliveries(&self) {
        lock(&self.sender).take();
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    type Delivery = Vec<u8>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.state().exchanges.push(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.state();
        let name = if def.name().is_empty() {
            format!("amq.gen-{}", state.queues.len())
        } else {
            def.name().to_owned()
        };
        state.queues.push(name.clone());
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingDefinition,
    ) -> Result<(), AmqpError> {
        self.state().bindings.push((
            queue.to_owned(),
            exchange.to_owned(),
            binding.key().to_owned(),
        ));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        if self.state().confirms_unsupported {
            return Err(AmqpError::ConfirmationError("not supported".to_owned()));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _mandatory: bool,
        msg: &OutboundMessage,
    ) -> Result<PendingConfirm, AmqpError> {
        let mut state = self.state();
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(AmqpError::PublishingError);
        }
        if state.fail_attempts.contains(&state.attempts) {
            return Err(AmqpError::PublishingError);
        }

        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: msg.body.clone(),
        });

        if state.confirms_unsupported {
            return Ok(async { Ok(Confirmation::ack()) }.boxed());
        }

        state.outstanding += 1;
        state.max_outstanding = state.max_outstanding.max(state.outstanding);

        let delay = state.confirm_delays.pop_front().unwrap_or_default();
        let closed = state.confirm_source_closed;
        let confirmation = Confirmation {
            ack: !state.nack,
            returned: state.return_unroutable.then(|| ReturnedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                reply_code: 312,
                reply_text: "NO_ROUTE".to_owned(),
                body: msg.body.clone(),
            }),
        };
        let shared = self.state.clone();

        Ok(async move {
            tokio::time::sleep(delay).await;
            lock(&shared).outstanding -= 1;
            if closed {
                return Err(AmqpError::ConfirmationError("channel closed".to_owned()));
            }
            Ok(confirmation)
        }
        .boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumerOptions,
    ) -> Result<ConsumerStream<Vec<u8>>, AmqpError> {
        self.state().consumed.push(queue.to_owned());
        let rx = lock(&self.receiver)
            .take()
            .ok_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()))?;

        let tag = if opts.consumer_tag().is_empty() {
            "ctag-1".to_owned()
        } else {
            opts.consumer_tag().to_owned()
        };

        Ok(ConsumerStream {
            tag,
            deliveries: stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
        })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.state().prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.state().cancels.push(consumer_tag.to_owned());
        self.end_deliveries();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state().closes += 1;
        self.end_deliveries();
        Ok(())
    }
}
