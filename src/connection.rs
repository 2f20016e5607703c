// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! [`RabbitMQ`] owns the broker connection shared by every engine. It connects
//! at most once, watches the connection for faults and flow-control blocking
//! while it is up, hands out producers and consumers on dedicated channels, and
//! closes the connection at most once, after every engine it handed out has
//! released its channel.
//!
//! A connection closed by the broker is reported, never re-established: the
//! fault is logged and kept for [`RabbitMQ::last_fault`].

use crate::{
    channel::AMQP_REPLY_SUCCESS,
    config::AmqpConfig,
    consumer::Consumer,
    errors::AmqpError,
    lifecycle::{lock, EngineTracker, Latch, Outcome},
    publisher::Producer,
    topology::Topology,
};
use async_trait::async_trait;
use lapin::{
    protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError},
    types::LongString,
    Channel, Connection, ConnectionProperties,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

/// How often the broker's flow-control state is sampled.
pub const BLOCKED_PROBE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a [`RabbitMQ`] is in its startup/shutdown sequence.
///
/// States only move forward: `Unstarted -> Started -> Closing -> Closed`, or
/// straight from `Unstarted` to `Closed` when shut down before startup.
pub enum LifecycleState {
    Unstarted,
    Started,
    Closing,
    Closed,
}

/// Why the broker connection failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFault {
    /// 404
    NotFound(String),
    /// 501
    FrameError(String),
    /// 320
    ConnectionForced(String),
    /// 504
    ChannelError(String),
    /// Any other protocol-level close.
    Protocol { code: u16, text: String },
    Io(String),
    Other(String),
}

impl ConnectionFault {
    /// The AMQP reply code behind the fault, if it came from the protocol.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            ConnectionFault::NotFound(_) => Some(404),
            ConnectionFault::FrameError(_) => Some(501),
            ConnectionFault::ConnectionForced(_) => Some(320),
            ConnectionFault::ChannelError(_) => Some(504),
            ConnectionFault::Protocol { code, .. } => Some(*code),
            ConnectionFault::Io(_) | ConnectionFault::Other(_) => None,
        }
    }
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionFault::NotFound(text) => write!(f, "not found: {text}"),
            ConnectionFault::FrameError(text) => write!(f, "frame error: {text}"),
            ConnectionFault::ConnectionForced(text) => write!(f, "connection forced: {text}"),
            ConnectionFault::ChannelError(text) => write!(f, "channel error: {text}"),
            ConnectionFault::Protocol { code, text } => write!(f, "protocol error {code}: {text}"),
            ConnectionFault::Io(text) => write!(f, "io error: {text}"),
            ConnectionFault::Other(text) => f.write_str(text),
        }
    }
}

impl From<&lapin::Error> for ConnectionFault {
    fn from(err: &lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(amqp) => {
                let text = amqp.get_message().to_string();
                match amqp.kind() {
                    AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => ConnectionFault::NotFound(text),
                    AMQPErrorKind::Hard(AMQPHardError::FRAMEERROR) => {
                        ConnectionFault::FrameError(text)
                    }
                    AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED) => {
                        ConnectionFault::ConnectionForced(text)
                    }
                    AMQPErrorKind::Hard(AMQPHardError::CHANNELERROR) => {
                        ConnectionFault::ChannelError(text)
                    }
                    _ => ConnectionFault::Protocol {
                        code: amqp.get_id(),
                        text,
                    },
                }
            }
            lapin::Error::IOError(io) => ConnectionFault::Io(io.to_string()),
            other => ConnectionFault::Other(other.to_string()),
        }
    }
}

/// The connection operations the lifecycle drives after startup.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait BrokerConnection: Send + Sync + 'static {
    async fn create_channel(&self) -> Result<Channel, AmqpError>;

    /// Closes with reply code 200. An already-closed connection yields
    /// [`AmqpError::ChannelStateError`].
    async fn close(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl BrokerConnection for Connection {
    async fn create_channel(&self) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        match Connection::create_channel(self).await {
            Ok(channel) => {
                debug!("channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match Connection::close(self, AMQP_REPLY_SUCCESS, "OK").await {
            Ok(()) => Ok(()),
            Err(err) => match AmqpError::from(&err) {
                AmqpError::ChannelStateError => Err(AmqpError::ChannelStateError),
                _ => Err(AmqpError::CloseConnectionError(err.to_string())),
            },
        }
    }
}

/// What the fault watcher has observed so far.
#[derive(Default)]
struct FaultLog {
    last: Mutex<Option<ConnectionFault>>,
    blocked: AtomicBool,
}

/// The shared broker connection and its lifecycle.
pub struct RabbitMQ {
    config: AmqpConfig,
    startup: Latch<Outcome>,
    shutdown: Latch<Outcome>,
    state: Mutex<LifecycleState>,
    conn: OnceLock<Box<dyn BrokerConnection>>,
    control: OnceLock<Channel>,
    closing: watch::Sender<bool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    engines: EngineTracker,
    faults: Arc<FaultLog>,
}

impl RabbitMQ {
    /// Creates an unstarted lifecycle for `config`. Nothing connects until
    /// [`RabbitMQ::startup`].
    ///
    /// # Parameters
    /// * `config` - Broker address and credentials
    ///
    /// # Returns
    /// A connection handle in [`LifecycleState::Unstarted`]
    pub fn new(config: AmqpConfig) -> RabbitMQ {
        RabbitMQ {
            config,
            startup: Latch::new(),
            shutdown: Latch::new(),
            state: Mutex::new(LifecycleState::Unstarted),
            conn: OnceLock::new(),
            control: OnceLock::new(),
            closing: watch::Sender::new(false),
            watcher: Mutex::new(None),
            engines: EngineTracker::new(),
            faults: Arc::default(),
        }
    }

    /// The configuration this connection was created with.
    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    ///
    /// # Returns
    /// A snapshot; a concurrent startup or shutdown may move it on right after
    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// The most recent fault reported for the connection.
    pub fn last_fault(&self) -> Option<ConnectionFault> {
        lock(&self.faults.last).clone()
    }

    /// Whether the broker is currently throttling this connection.
    pub fn is_blocked(&self) -> bool {
        self.faults.blocked.load(Ordering::SeqCst)
    }

    /// Connects to the broker, once. Later calls return the first outcome.
    ///
    /// Must not run concurrently with [`RabbitMQ::shutdown`].
    pub async fn startup(&self) -> Result<(), AmqpError> {
        self.startup
            .run(|| async {
                if self.state() != LifecycleState::Unstarted {
                    warn!("startup requested after shutdown");
                    return Err(AmqpError::ConnectionError(
                        "connection already shut down".to_owned(),
                    ));
                }
                self.dial().await
            })
            .await
    }

    async fn dial(&self) -> Result<(), AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.app_name.clone()));

        let conn = match Connection::connect_uri(self.config.uri(), options).await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
        };
        debug!("amqp connected");

        let control = BrokerConnection::create_channel(&conn).await?;

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        conn.on_error(move |err| {
            let _ = fault_tx.send(ConnectionFault::from(&err));
        });

        let status = conn.status().clone();
        let watcher = tokio::spawn(watch_faults(
            fault_rx,
            move || status.blocked(),
            self.closing.subscribe(),
            self.faults.clone(),
        ));

        *lock(&self.watcher) = Some(watcher);
        let _ = self.conn.set(Box::new(conn));
        let _ = self.control.set(control);
        *lock(&self.state) = LifecycleState::Started;

        info!(
            host = self.config.host.as_str(),
            port = self.config.port,
            vhost = self.config.vhost.as_str(),
            "rabbitmq connection started"
        );
        Ok(())
    }

    /// Closes the connection, once. Later calls return the first outcome.
    ///
    /// Stops the fault watcher, then waits until every producer and consumer
    /// obtained from this connection has been cancelled or dropped before
    /// closing. Shutting down a connection that never started is a no-op.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        self.shutdown
            .run(|| async {
                {
                    let mut state = lock(&self.state);
                    match *state {
                        LifecycleState::Unstarted | LifecycleState::Closed => {
                            *state = LifecycleState::Closed;
                            debug!("shutdown without a started connection");
                            return Ok(());
                        }
                        // Closing: an earlier shutdown was dropped midway
                        LifecycleState::Started | LifecycleState::Closing => {
                            *state = LifecycleState::Closing;
                        }
                    }
                }
                warn!("rabbitmq will shutdown...");

                self.closing.send_replace(true);
                let watcher = lock(&self.watcher).take();
                if let Some(watcher) = watcher {
                    if let Err(err) = watcher.await {
                        error!(error = err.to_string(), "fault watcher failed");
                    }
                }

                let live = self.engines.live();
                if live > 0 {
                    info!(engines = live, "waiting for engines to release their channels");
                }
                self.engines.wait_idle().await;

                let outcome = match self.conn.get() {
                    Some(conn) => close_connection(conn.as_ref()).await,
                    None => Ok(()),
                };

                *lock(&self.state) = LifecycleState::Closed;
                if outcome.is_ok() {
                    info!("rabbitmq shutdown ok");
                }
                outcome
            })
            .await
    }

    /// The channel opened alongside the connection, for ad-hoc operations.
    pub fn control_channel(&self) -> Result<&Channel, AmqpError> {
        self.started()?;
        self.control.get().ok_or(AmqpError::NotStarted)
    }

    /// Opens a dedicated channel and returns a producer for `topology`.
    ///
    /// The connection does not close until the producer is cancelled or dropped.
    pub async fn producer(&self, topology: Topology) -> Result<Producer<Channel>, AmqpError> {
        let channel = self.open_channel().await?;
        Ok(Producer::new(channel, topology)?.with_guard(self.engines.register()))
    }

    /// Opens a dedicated channel and returns a consumer for `topology`.
    ///
    /// The connection does not close until the consumer is cancelled or dropped.
    pub async fn consumer(&self, topology: Topology) -> Result<Consumer<Channel>, AmqpError> {
        let channel = self.open_channel().await?;
        Ok(Consumer::new(channel, topology)?.with_guard(self.engines.register()))
    }

    fn started(&self) -> Result<(), AmqpError> {
        match self.state() {
            LifecycleState::Started => Ok(()),
            LifecycleState::Unstarted => Err(AmqpError::NotStarted),
            LifecycleState::Closing | LifecycleState::Closed => Err(AmqpError::ChannelStateError),
        }
    }

    async fn open_channel(&self) -> Result<Channel, AmqpError> {
        self.started()?;
        let conn = self.conn.get().ok_or(AmqpError::NotStarted)?;
        conn.create_channel().await
    }
}

async fn close_connection(conn: &dyn BrokerConnection) -> Result<(), AmqpError> {
    match conn.close().await {
        Ok(()) => Ok(()),
        Err(err) if err.is_benign_on_release() => {
            warn!("connection already closed");
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), "rabbitmq shutdown error");
            Err(err)
        }
    }
}

/// Logs connection faults and blocked/unblocked transitions until shutdown.
async fn watch_faults<B>(
    mut faults: mpsc::UnboundedReceiver<ConnectionFault>,
    blocked: B,
    mut closing: watch::Receiver<bool>,
    log: Arc<FaultLog>,
) where
    B: Fn() -> bool + Send,
{
    let mut probe = tokio::time::interval(BLOCKED_PROBE_INTERVAL);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = closing.wait_for(|closing| *closing) => {
                warn!("fault watcher received shutdown, returning");
                return;
            }
            fault = faults.recv() => {
                let Some(fault) = fault else {
                    debug!("fault source dropped");
                    return;
                };
                error!(
                    code = fault.reply_code(),
                    fault = %fault,
                    "rabbitmq connection lost, not reconnecting"
                );
                *lock(&log.last) = Some(fault);
            }
            _ = probe.tick() => {
                let now = blocked();
                if log.blocked.swap(now, Ordering::SeqCst) != now {
                    if now {
                        warn!("connection blocked by the broker");
                    } else {
                        info!("connection unblocked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queue::QueueDefinition, topology::TopologyBuilder, Variant};
    use lapin::protocol::AMQPError;
    use std::sync::atomic::AtomicUsize;

    fn started_with(conn: MockBrokerConnection) -> RabbitMQ {
        let rabbit = RabbitMQ::new(AmqpConfig::default());
        let _ = rabbit.conn.set(Box::new(conn));
        *lock(&rabbit.state) = LifecycleState::Started;
        rabbit
    }

    fn counted_close(closes: &Arc<AtomicUsize>) -> MockBrokerConnection {
        let closes = closes.clone();
        let mut conn = MockBrokerConnection::new();
        conn.expect_close().times(1).returning(move || {
            closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        conn
    }

    fn protocol(kind: AMQPErrorKind, text: &str) -> lapin::Error {
        lapin::Error::ProtocolError(AMQPError::new(kind, text.into()))
    }

    #[test]
    fn faults_are_classified_by_reply_code() {
        let forced = ConnectionFault::from(&protocol(
            AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED),
            "CONNECTION_FORCED - broker forced connection closure",
        ));
        assert!(matches!(forced, ConnectionFault::ConnectionForced(_)));
        assert_eq!(forced.reply_code(), Some(320));

        let not_found = ConnectionFault::from(&protocol(
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND),
            "NOT_FOUND - no queue",
        ));
        assert_eq!(not_found.reply_code(), Some(404));

        let frame = ConnectionFault::from(&protocol(
            AMQPErrorKind::Hard(AMQPHardError::FRAMEERROR),
            "i/o timeout",
        ));
        assert_eq!(frame, ConnectionFault::FrameError("i/o timeout".to_owned()));

        let invalid = ConnectionFault::from(&protocol(
            AMQPErrorKind::Hard(AMQPHardError::COMMANDINVALID),
            "COMMAND_INVALID - unimplemented method",
        ));
        assert_eq!(invalid.reply_code(), Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_records_faults_and_blocking_until_shutdown() {
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = watch::channel(false);
        let blocked = Arc::new(AtomicBool::new(false));
        let log = Arc::new(FaultLog::default());

        let watcher = tokio::spawn(watch_faults(
            fault_rx,
            {
                let blocked = blocked.clone();
                move || blocked.load(Ordering::SeqCst)
            },
            closing_rx,
            log.clone(),
        ));

        fault_tx
            .send(ConnectionFault::ConnectionForced("shutdown".to_owned()))
            .unwrap();
        blocked.store(true, Ordering::SeqCst);
        tokio::time::sleep(BLOCKED_PROBE_INTERVAL * 2).await;

        assert_eq!(
            *lock(&log.last),
            Some(ConnectionFault::ConnectionForced("shutdown".to_owned()))
        );
        assert!(log.blocked.load(Ordering::SeqCst));

        blocked.store(false, Ordering::SeqCst);
        tokio::time::sleep(BLOCKED_PROBE_INTERVAL * 2).await;
        assert!(!log.blocked.load(Ordering::SeqCst));

        closing_tx.send_replace(true);
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_startup_is_a_no_op() {
        let rabbit = RabbitMQ::new(AmqpConfig::default());

        assert_eq!(rabbit.shutdown().await, Ok(()));
        assert_eq!(rabbit.shutdown().await, Ok(()));
        assert_eq!(rabbit.state(), LifecycleState::Closed);
        assert!(matches!(
            rabbit.startup().await,
            Err(AmqpError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn engines_require_a_started_connection() {
        let rabbit = RabbitMQ::new(AmqpConfig::default());
        let topology = TopologyBuilder::new()
            .queue(QueueDefinition::new("jobs"))
            .build_producer(Variant::Work)
            .unwrap();

        assert!(matches!(
            rabbit.producer(topology).await,
            Err(AmqpError::NotStarted)
        ));
        assert!(matches!(rabbit.control_channel(), Err(AmqpError::NotStarted)));
        assert_eq!(rabbit.last_fault(), None);
        assert!(!rabbit.is_blocked());
    }

    #[tokio::test]
    async fn shutdown_closes_once_after_every_engine_released() {
        let closes = Arc::new(AtomicUsize::new(0));
        let rabbit = Arc::new(started_with(counted_close(&closes)));
        let first = rabbit.engines.register();
        let second = rabbit.engines.register();

        let shutdowns: Vec<_> = (0..2)
            .map(|_| {
                let rabbit = rabbit.clone();
                tokio::spawn(async move { rabbit.shutdown().await })
            })
            .collect();
        while rabbit.state() != LifecycleState::Closing {
            tokio::task::yield_now().await;
        }

        drop(first);
        tokio::task::yield_now().await;
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert!(shutdowns.iter().all(|shutdown| !shutdown.is_finished()));

        drop(second);
        for shutdown in shutdowns {
            assert_eq!(shutdown.await.unwrap(), Ok(()));
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(rabbit.state(), LifecycleState::Closed);
        assert_eq!(rabbit.shutdown().await, Ok(()));
    }

    #[tokio::test]
    async fn already_closed_connection_shuts_down_cleanly() {
        let mut conn = MockBrokerConnection::new();
        conn.expect_close()
            .times(1)
            .returning(|| Err(AmqpError::ChannelStateError));
        let rabbit = started_with(conn);

        assert_eq!(rabbit.shutdown().await, Ok(()));
        assert_eq!(rabbit.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn close_failure_is_every_callers_outcome() {
        let mut conn = MockBrokerConnection::new();
        conn.expect_close()
            .times(1)
            .returning(|| Err(AmqpError::CloseConnectionError("io".to_owned())));
        let rabbit = started_with(conn);

        let failed = Err(AmqpError::CloseConnectionError("io".to_owned()));
        assert_eq!(rabbit.shutdown().await, failed);
        assert_eq!(rabbit.shutdown().await, failed);
        assert_eq!(rabbit.state(), LifecycleState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_dropped_while_draining_resumes_on_the_next_call() {
        let closes = Arc::new(AtomicUsize::new(0));
        let rabbit = started_with(counted_close(&closes));
        let engine = rabbit.engines.register();

        let impatient = tokio::time::timeout(Duration::from_millis(50), rabbit.shutdown()).await;
        assert!(impatient.is_err());
        assert_eq!(rabbit.state(), LifecycleState::Closing);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        drop(engine);
        assert_eq!(rabbit.shutdown().await, Ok(()));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
