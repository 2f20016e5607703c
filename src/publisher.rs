// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reliable Publish Engine
//!
//! A [`Producer`] drains an outbound `mpsc` stream of [`OutboundMessage`]s onto
//! its channel, one message at a time:
//!
//! - a message read from the stream is parked in a single-slot pending lane, and
//!   the stream is not read again until the broker confirmed that message;
//! - the destination key is resolved from the topology's [`Variant`];
//! - a transport failure is retried once, after [`RETRY_DELAY`]; a second
//!   consecutive failure ends the engine with [`AmqpError::PublishingError`].
//!   A successful retry resumes normal publishing, and a later failure gets its
//!   own single retry;
//! - a negative acknowledgment is logged, never resent.
//!
//! Throughput is therefore bounded by the confirmation round trip. Run several
//! producers over distinct channels for more.
//!
//! When the broker does not support publisher confirms the engine keeps going
//! without them, re-reading the stream as soon as a message was transmitted.

use crate::{
    channel::{release_channel, AmqpChannel, PendingConfirm},
    errors::AmqpError,
    lifecycle::{lock, CompletionSignal, EngineGuard, Latch, Outcome},
    message::{Confirmation, OutboundMessage, ReturnedMessage},
    model::Variant,
    topology::{Role, Topology},
};
use futures_util::future::OptionFuture;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Pause before the single retry of a message that failed to transmit.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A message admitted from the outbound stream.
struct Attempt {
    msg: OutboundMessage,
    retried: bool,
}

/// Publishes messages for one topology over one exclusively owned channel.
pub struct Producer<C: AmqpChannel> {
    channel: C,
    topology: Topology,
    done: CompletionSignal,
    cancelled: Latch<Outcome>,
    released: Latch<Outcome>,
    cancel_requested: AtomicBool,
    returns: Mutex<Option<mpsc::UnboundedSender<ReturnedMessage>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<EngineGuard>>,
}

impl<C: AmqpChannel> Producer<C> {
    /// Creates a producer; `topology` must have been built with
    /// [`TopologyBuilder::build_producer`](crate::topology::TopologyBuilder::build_producer).
    pub fn new(channel: C, topology: Topology) -> Result<Producer<C>, AmqpError> {
        if topology.role() != Role::Producer {
            return Err(AmqpError::InvalidTopology(format!(
                "{} topology used for a producer",
                topology.role()
            )));
        }

        Ok(Producer {
            channel,
            topology,
            done: CompletionSignal::new(),
            cancelled: Latch::new(),
            released: Latch::new(),
            cancel_requested: AtomicBool::new(false),
            returns: Mutex::new(None),
            listener: Mutex::new(None),
            registration: Mutex::new(None),
        })
    }

    pub(crate) fn with_guard(self, guard: EngineGuard) -> Self {
        *lock(&self.registration) = Some(guard);
        self
    }

    /// The messaging model this producer was built for.
    ///
    /// # Returns
    /// The topology's [`Variant`], which decides how routing keys are resolved
    pub fn variant(&self) -> Variant {
        self.topology.variant()
    }

    /// The topology declared before the first message is published.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declares the producer topology, then publishes every message received
    /// on `outbound` in order until the stream closes.
    ///
    /// An engine runs once: a second call, or a call after [`Producer::cancel`],
    /// fails without touching the channel.
    pub async fn publish(
        &self,
        mut outbound: mpsc::Receiver<OutboundMessage>,
    ) -> Result<(), AmqpError> {
        let Some(done) = self.done.begin() else {
            return Err(self.not_runnable());
        };

        let outcome = self.run(&mut outbound).await;
        if let Err(err) = &outcome {
            error!(error = err.to_string(), model = %self.variant(), "publish engine stopped");
        }

        let _ = done.send(outcome.clone());
        outcome
    }

    async fn run(
        &self,
        outbound: &mut mpsc::Receiver<OutboundMessage>,
    ) -> Result<(), AmqpError> {
        self.topology.install_producer(&self.channel).await?;

        let confirms = match self.channel.confirm_select().await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    "publisher confirms unavailable, publishing without them"
                );
                false
            }
        };

        let exchange = self.topology.exchange().name();
        let mandatory = self.topology.producer_options().is_mandatory();

        let (pending_tx, mut pending_rx) = mpsc::channel::<Attempt>(1);
        let mut inflight: Option<PendingConfirm> = None;
        let mut reading = true;
        let mut delivery_tag: u64 = 0;

        loop {
            tokio::select! {
                confirmed = OptionFuture::from(inflight.as_mut()), if inflight.is_some() => {
                    inflight = None;
                    match confirmed {
                        Some(Ok(confirmation)) => {
                            self.on_confirmation(delivery_tag, confirmation);
                            reading = true;
                        }
                        Some(Err(err)) => {
                            info!(error = err.to_string(), "confirmation source closed");
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
                attempt = pending_rx.recv() => {
                    let Some(attempt) = attempt else {
                        return Ok(());
                    };

                    let key = self.topology.resolve_key(attempt.msg.key());
                    match self
                        .channel
                        .publish(exchange, &key, mandatory, &attempt.msg)
                        .await
                    {
                        Ok(confirm) => {
                            delivery_tag += 1;
                            debug!(
                                delivery_tag,
                                exchange,
                                routing_key = key.as_str(),
                                "message published"
                            );
                            if confirms {
                                inflight = Some(confirm);
                            } else {
                                reading = true;
                            }
                        }
                        Err(err) if attempt.retried => {
                            error!(
                                error = err.to_string(),
                                routing_key = key.as_str(),
                                "retry failed, giving up"
                            );
                            return Err(AmqpError::PublishingError);
                        }
                        Err(err) => {
                            warn!(
                                error = err.to_string(),
                                routing_key = key.as_str(),
                                retry_in = ?RETRY_DELAY,
                                "failure to publish, retrying"
                            );
                            tokio::time::sleep(RETRY_DELAY).await;
                            pending_tx
                                .try_send(Attempt { msg: attempt.msg, retried: true })
                                .map_err(|_| AmqpError::InternalError)?;
                        }
                    }
                }
                msg = outbound.recv(), if reading => {
                    let Some(msg) = msg else {
                        debug!(published = delivery_tag, "outbound stream closed");
                        return Ok(());
                    };

                    reading = false;
                    pending_tx
                        .try_send(Attempt { msg, retried: false })
                        .map_err(|_| AmqpError::InternalError)?;
                }
            }
        }
    }

    fn on_confirmation(&self, delivery_tag: u64, confirmation: Confirmation) {
        if let Some(returned) = confirmation.returned {
            warn!(
                delivery_tag,
                reply_code = returned.reply_code,
                reply_text = returned.reply_text.as_str(),
                "message returned as unroutable"
            );
            if let Some(tx) = lock(&self.returns).as_ref() {
                let _ = tx.send(returned);
            }
        }

        if !confirmation.ack {
            error!(delivery_tag, "message was nacked by the broker");
        }
    }

    /// Attaches a listener for messages the broker returns as unroutable.
    ///
    /// Returns are only emitted for mandatory publishes. The handler runs on its
    /// own task; a panic inside it is logged and the listener keeps going. The
    /// task ends when the producer is cancelled or dropped. Must be called from
    /// within a tokio runtime.
    pub fn notify_return<F>(&self, mut handler: F)
    where
        F: FnMut(ReturnedMessage) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ReturnedMessage>();

        let listener = tokio::spawn(async move {
            while let Some(returned) = rx.recv().await {
                let reply_code = returned.reply_code;
                if catch_unwind(AssertUnwindSafe(|| handler(returned))).is_err() {
                    error!(reply_code, "return handler panicked");
                }
            }
        });

        *lock(&self.returns) = Some(tx);
        if let Some(previous) = lock(&self.listener).replace(listener) {
            previous.abort();
        }
    }

    /// Stops the engine and releases its channel, once.
    ///
    /// Waits for a running [`Producer::publish`] to settle, then cancels the
    /// producer tag (if any) and closes the channel. Returns the release error
    /// if there was one, otherwise the engine's own outcome. Later calls
    /// return the first outcome.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.cancelled
            .run(|| async {
                self.cancel_requested.store(true, Ordering::SeqCst);
                self.done.abandon();
                let outcome = self.done.wait().await;

                let tag = &self.topology.producer_options().tag;
                let released = self
                    .released
                    .run(|| release_channel(&self.channel, Some(tag.as_str())))
                    .await;

                if let Some(listener) = lock(&self.listener).take() {
                    listener.abort();
                }
                lock(&self.returns).take();
                lock(&self.registration).take();

                info!(model = %self.variant(), "producer cancelled");
                released.and(outcome)
            })
            .await
    }

    fn not_runnable(&self) -> AmqpError {
        if self.cancel_requested.load(Ordering::SeqCst) {
            AmqpError::EngineCancelled
        } else {
            error!("publish engine already ran");
            AmqpError::InternalError
        }
    }
}

impl<C: AmqpChannel> Drop for Producer<C> {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}
