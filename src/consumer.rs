// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Consumption Loop
//!
//! A [`Consumer`] declares its topology on its own channel, registers a broker
//! consumer and hands every delivery to a user handler, one at a time and in
//! arrival order. Acknowledging is the handler's job unless the consumer options
//! request auto-ack.
//!
//! The loop ends when the delivery stream ends, which is what cancelling the
//! consumer or closing its channel causes.

use crate::{
    channel::{release_channel, AmqpChannel},
    errors::AmqpError,
    lifecycle::{lock, CompletionSignal, EngineGuard, Latch, Outcome},
    model::Variant,
    topology::{Role, Topology},
};
use futures_util::StreamExt;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};
use tracing::{debug, error, info, warn};

/// Consumes deliveries for one topology over one exclusively owned channel.
pub struct Consumer<C: AmqpChannel> {
    channel: C,
    topology: Topology,
    done: CompletionSignal,
    cancelled: Latch<Outcome>,
    released: Latch<Outcome>,
    cancel_requested: AtomicBool,
    tag: Mutex<Option<String>>,
    registration: Mutex<Option<EngineGuard>>,
}

impl<C: AmqpChannel> Consumer<C> {
    /// Creates a consumer; `topology` must have been built with
    /// [`TopologyBuilder::build_consumer`](crate::topology::TopologyBuilder::build_consumer).
    pub fn new(channel: C, topology: Topology) -> Result<Consumer<C>, AmqpError> {
        if topology.role() != Role::Consumer {
            return Err(AmqpError::InvalidTopology(format!(
                "{} topology used for a consumer",
                topology.role()
            )));
        }

        Ok(Consumer {
            channel,
            topology,
            done: CompletionSignal::new(),
            cancelled: Latch::new(),
            released: Latch::new(),
            cancel_requested: AtomicBool::new(false),
            tag: Mutex::new(None),
            registration: Mutex::new(None),
        })
    }

    pub(crate) fn with_guard(self, guard: EngineGuard) -> Self {
        *lock(&self.registration) = Some(guard);
        self
    }

    /// The messaging model this consumer was built for.
    pub fn variant(&self) -> Variant {
        self.topology.variant()
    }

    /// The topology declared when consuming starts.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The tag the broker registered this consumer under, once consuming.
    pub fn consumer_tag(&self) -> Option<String> {
        lock(&self.tag).clone()
    }

    /// Sets how many unacknowledged deliveries the broker may push to this
    /// consumer's channel.
    pub async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel.qos(prefetch_count).await?;
        debug!(prefetch_count, "qos configured");
        Ok(())
    }

    /// Runs the loop until the delivery stream ends.
    ///
    /// `handler` is awaited for each delivery before the next one is taken.
    /// Errors surfaced by the stream itself are logged and skipped.
    pub async fn consume<F, Fut>(&self, mut handler: F) -> Result<(), AmqpError>
    where
        F: FnMut(C::Delivery) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let Some(done) = self.done.begin() else {
            return Err(if self.cancel_requested.load(Ordering::SeqCst) {
                AmqpError::EngineCancelled
            } else {
                error!("consumer already ran");
                AmqpError::InternalError
            });
        };

        let outcome = self.drain(&mut handler).await;
        if let Err(err) = &outcome {
            error!(error = err.to_string(), model = %self.variant(), "consumer stopped");
        }

        let _ = done.send(outcome.clone());
        outcome
    }

    async fn drain<F, Fut>(&self, handler: &mut F) -> Result<(), AmqpError>
    where
        F: FnMut(C::Delivery) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let queue = self.topology.install_consumer(&self.channel).await?;
        let stream = self
            .channel
            .consume(&queue, self.topology.consumer_options())
            .await?;

        info!(queue = queue.as_str(), tag = stream.tag.as_str(), "consuming");
        *lock(&self.tag) = Some(stream.tag);

        let mut deliveries = stream.deliveries;
        let mut handled: u64 = 0;
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => {
                    handler(delivery).await;
                    handled += 1;
                }
                Err(err) => warn!(error = err.to_string(), "skipping failed delivery"),
            }
        }

        debug!(queue = queue.as_str(), handled, "delivery stream closed");
        Ok(())
    }

    /// Stops consuming and releases the channel, once.
    ///
    /// Cancels the broker consumer (when one was registered) and closes the
    /// channel, which ends the delivery stream, then waits for the loop to
    /// finish its current delivery. Returns the release error if there was one,
    /// otherwise the loop's own outcome. Later calls return the first outcome.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.cancelled
            .run(|| async {
                self.cancel_requested.store(true, Ordering::SeqCst);
                self.done.abandon();

                let tag = lock(&self.tag).clone();
                let released = self
                    .released
                    .run(|| release_channel(&self.channel, tag.as_deref()))
                    .await;
                let outcome = self.done.wait().await;

                lock(&self.registration).take();

                info!(model = %self.variant(), "consumer cancelled");
                released.and(outcome)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        exchange::ExchangeDefinition,
        options::ConsumerOptions,
        queue::{BindingDefinition, QueueDefinition},
        testing::FakeChannel,
        topology::TopologyBuilder,
    };
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn work_topology() -> Topology {
        TopologyBuilder::new()
            .queue(QueueDefinition::new("jobs"))
            .consumer_options(ConsumerOptions::new().tag("worker-1"))
            .build_consumer(Variant::Work)
            .unwrap()
    }

    #[tokio::test]
    async fn handles_deliveries_in_arrival_order() {
        let channel = FakeChannel::new();
        for body in ["a", "b", "c"] {
            channel.deliver(body.as_bytes());
        }
        channel.deliver_error();
        channel.deliver(b"d");
        channel.end_deliveries();

        let consumer = Consumer::new(channel.clone(), work_topology()).unwrap();
        let mut seen = Vec::new();
        let outcome = consumer
            .consume(|delivery| {
                seen.push(delivery);
                async {}
            })
            .await;

        assert_eq!(outcome, Ok(()));
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(channel.state().consumed, vec!["jobs"]);
        assert_eq!(consumer.consumer_tag().as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn handler_runs_one_delivery_at_a_time() {
        let channel = FakeChannel::new();
        for i in 0..5u8 {
            channel.deliver(&[i]);
        }
        channel.end_deliveries();

        let consumer = Consumer::new(channel, work_topology()).unwrap();
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let outcome = consumer
            .consume(|_| {
                let active = active.clone();
                async move {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::task::yield_now().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await;

        assert_eq!(outcome, Ok(()));
    }

    #[tokio::test]
    async fn exchange_models_bind_a_generated_queue() {
        let topology = TopologyBuilder::new()
            .exchange(ExchangeDefinition::new("logs"))
            .binding(BindingDefinition::new("*.error"))
            .build_consumer(Variant::Topic)
            .unwrap();
        let channel = FakeChannel::new();
        channel.end_deliveries();

        let consumer = Consumer::new(channel.clone(), topology).unwrap();
        assert_eq!(consumer.consume(|_| async {}).await, Ok(()));

        let state = channel.state();
        assert_eq!(state.exchanges, vec!["logs"]);
        assert_eq!(
            state.bindings,
            vec![("amq.gen-0".to_owned(), "logs".to_owned(), "*.error".to_owned())]
        );
        assert_eq!(state.consumed, vec!["amq.gen-0"]);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_loop() {
        let channel = FakeChannel::new();
        let consumer = Arc::new(Consumer::new(channel.clone(), work_topology()).unwrap());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let running = tokio::spawn({
            let consumer = consumer.clone();
            async move {
                consumer
                    .consume(move |delivery| {
                        let _ = seen_tx.send(delivery);
                        async {}
                    })
                    .await
            }
        });

        channel.deliver(b"first");
        assert_eq!(seen_rx.recv().await, Some(b"first".to_vec()));

        assert_eq!(consumer.cancel().await, Ok(()));
        assert_eq!(running.await.unwrap(), Ok(()));

        let state = channel.state();
        assert_eq!(state.cancels, vec!["worker-1"]);
        assert_eq!(state.closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_dropped_mid_delivery_releases_once_on_retry() {
        let channel = FakeChannel::new();
        let consumer = Arc::new(Consumer::new(channel.clone(), work_topology()).unwrap());

        let gate = Arc::new(tokio::sync::Notify::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let running = tokio::spawn({
            let consumer = consumer.clone();
            let gate = gate.clone();
            async move {
                consumer
                    .consume(move |delivery| {
                        let _ = seen_tx.send(delivery);
                        let gate = gate.clone();
                        async move { gate.notified().await }
                    })
                    .await
            }
        });

        channel.deliver(b"slow");
        assert_eq!(seen_rx.recv().await, Some(b"slow".to_vec()));

        let impatient =
            tokio::time::timeout(std::time::Duration::from_millis(50), consumer.cancel()).await;
        assert!(impatient.is_err());
        assert_eq!(channel.state().closes, 1);

        gate.notify_one();
        assert_eq!(running.await.unwrap(), Ok(()));

        assert_eq!(consumer.cancel().await, Ok(()));
        let state = channel.state();
        assert_eq!(state.cancels, vec!["worker-1"]);
        assert_eq!(state.closes, 1);
    }

    #[tokio::test]
    async fn cancel_before_consume_skips_the_tag() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_cancel().never();
        channel.expect_close().times(1).returning(|| Ok(()));
        channel.expect_consume().never();
        let consumer = Consumer::new(channel, work_topology()).unwrap();

        assert_eq!(consumer.cancel().await, Ok(()));
        assert_eq!(consumer.cancel().await, Ok(()));
        assert_eq!(
            consumer.consume(|_| async {}).await,
            Err(AmqpError::EngineCancelled)
        );
    }

    #[tokio::test]
    async fn concurrent_cancels_share_one_outcome() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_close()
            .times(1)
            .returning(|| Err(AmqpError::CloseChannelError("io".to_owned())));
        let consumer = Arc::new(Consumer::new(channel, work_topology()).unwrap());

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let consumer = consumer.clone();
                tokio::spawn(async move { consumer.cancel().await })
            })
            .collect();

        for call in calls {
            assert_eq!(
                call.await.unwrap(),
                Err(AmqpError::CloseChannelError("io".to_owned()))
            );
        }
    }

    #[tokio::test]
    async fn registration_failure_is_the_loop_outcome() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_consume()
            .returning(|queue, _| Err(AmqpError::BindingConsumerError(queue.to_owned())));
        channel.expect_close().returning(|| Ok(()));
        let consumer = Consumer::new(channel, work_topology()).unwrap();

        let err = Err(AmqpError::BindingConsumerError("jobs".to_owned()));
        assert_eq!(consumer.consume(|_| async {}).await, err);
        assert_eq!(consumer.cancel().await, err);
    }

    #[tokio::test]
    async fn qos_reaches_the_channel() {
        let channel = FakeChannel::new();
        let consumer = Consumer::new(channel.clone(), work_topology()).unwrap();

        consumer.qos(10).await.unwrap();
        assert_eq!(channel.state().prefetch, Some(10));
    }

    #[test]
    fn producer_topologies_are_rejected() {
        let topology = TopologyBuilder::new()
            .queue(QueueDefinition::new("jobs"))
            .build_producer(Variant::Work)
            .unwrap();

        assert!(Consumer::new(FakeChannel::new(), topology).is_err());
    }
}
