// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Toolkit
//!
//! The `AmqpError` enum represents every failure the toolkit can surface:
//! topology validation, connection lifecycle, channel handling, declarations,
//! publishing, consuming and payload encoding.
//!
//! Errors are `Clone` because the idempotent lifecycle entry points
//! (startup, shutdown, cancel) hand the same outcome to every caller.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A topology descriptor is missing a field required by its variant
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Operation requires a started connection
    #[error("connection not started")]
    NotStarted,

    /// The engine was cancelled before it could run
    #[error("engine already cancelled")]
    EngineCancelled,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error closing the connection to the RabbitMQ server
    #[error("failure to close the connection: {0}")]
    CloseConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel or connection was already closed or in error state
    #[error("channel already in error state")]
    ChannelStateError,

    /// Error cancelling a consumer registration
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error closing a channel
    #[error("failure to close the channel: {0}")]
    CloseChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error enabling or awaiting publisher confirms
    #[error("failure to confirm: {0}")]
    ConfirmationError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error encoding a payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),
}

impl AmqpError {
    /// Whether this error means the resource was already gone.
    ///
    /// Releasing a channel or connection that is already closed is treated
    /// as a successful release.
    pub fn is_benign_on_release(&self) -> bool {
        matches!(self, AmqpError::ChannelStateError)
    }
}

impl From<&lapin::Error> for AmqpError {
    fn from(err: &lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                AmqpError::ChannelStateError
            }
            other => AmqpError::ConnectionError(other.to_string()),
        }
    }
}
