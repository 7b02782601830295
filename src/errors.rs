// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Ballot Broker
//!
//! `AmqpError` covers every failure the broker core can observe while talking
//! to RabbitMQ: connecting, declaring topology, publishing, consuming and
//! terminating deliveries. `HandlerError` is what a business handler returns
//! when it could not process a message, and `ConfigError` is raised while
//! loading the environment.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// There is no live session and none could be established
    #[error("no live channel available")]
    ChannelUnavailable,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error while checking whether an exchange or queue exists
    #[error("failure to inspect `{0}`: {1}")]
    InspectError(String, String),

    /// A queue an operation depends on is not declared on the broker
    #[error("queue `{0}` does not exist")]
    QueueNotFound(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively confirmed a publish
    #[error("publish to `{0}` was not confirmed by the broker")]
    PublishNotConfirmed(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error fetching a message with basic.get
    #[error("failure to get message from `{0}`: {1}")]
    GetMessageError(String, String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the error means the session underneath is no longer usable.
    pub fn is_channel_loss(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::ChannelUnavailable
                | AmqpError::AckMessageError(_)
                | AmqpError::RejectMessageError(_)
        )
    }
}

/// Error returned by a message handler.
///
/// The consumer treats any handler error as a business failure and rejects the
/// delivery without requeue; the handler owns its own domain error reporting.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError(msg.into())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        HandlerError(msg.to_owned())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError(err.to_string())
    }
}

/// Errors raised while loading broker configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is present but cannot be parsed
    #[error("invalid value for `{0}`: {1}")]
    Invalid(String, String),

    /// A configured name is empty
    #[error("`{0}` must not be empty")]
    Empty(String),
}
