// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstraction
//!
//! The connection manager, publisher, consumer and dead-letter reprocessor
//! never touch lapin directly. They talk to a [`Session`]: one transport
//! connection plus the single channel multiplexed over it. Sessions are
//! opened by a [`Connector`], which also wires the connection and channel
//! error callbacks to a [`LifecycleEvent`] sender owned by the connection
//! manager.
//!
//! The production implementation lives in [`crate::channel`].

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

/// Content type of every message published by the broker core
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode marking a message as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Identifies one session; a new id is handed out on every (re)connect.
pub type SessionId = u64;

/// Connection and channel state changes reported by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The transport connection failed (network error, missed heartbeats)
    ConnectionError { session: SessionId, reason: String },
    /// The broker closed the connection
    ConnectionClosed { session: SessionId },
    /// The channel failed; the connection may still be alive
    ChannelError { session: SessionId, reason: String },
}

impl LifecycleEvent {
    pub fn session(&self) -> SessionId {
        match self {
            LifecycleEvent::ConnectionError { session, .. }
            | LifecycleEvent::ConnectionClosed { session }
            | LifecycleEvent::ChannelError { session, .. } => *session,
        }
    }
}

/// A message on its way to an exchange.
#[derive(Debug, Clone)]
pub struct OutboundMessage<'m> {
    pub exchange: &'m str,
    pub routing_key: &'m str,
    pub payload: &'m [u8],
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
}

/// Terminates a delivery on the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// One message handed over by the broker.
///
/// Terminating a delivery with [`ack`](InboundDelivery::ack) or
/// [`reject`](InboundDelivery::reject) consumes it. A delivery dropped
/// unterminated is redelivered by the broker once its channel closes.
pub struct InboundDelivery {
    pub data: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub headers: BTreeMap<String, String>,
    acker: Box<dyn Acker>,
}

impl InboundDelivery {
    pub fn new(
        data: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        headers: BTreeMap<String, String>,
        acker: Box<dyn Acker>,
    ) -> Self {
        InboundDelivery {
            data,
            delivery_tag,
            redelivered,
            headers,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Acknowledges the delivery, handing it back on failure so that it can
    /// still be rejected.
    pub async fn try_ack(self) -> Result<(), (AmqpError, InboundDelivery)> {
        match self.acker.ack().await {
            Ok(()) => Ok(()),
            Err(err) => Err((err, self)),
        }
    }

    pub async fn reject(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Deliveries of one consumer; the stream ends when its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Opens sessions against a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection and its channel.
    ///
    /// Connection and channel failures observed afterwards are reported on
    /// `events`, tagged with `session`.
    async fn connect(
        &self,
        session: SessionId,
        events: UnboundedSender<LifecycleEvent>,
    ) -> Result<Arc<dyn Session>, AmqpError>;
}

/// A live connection with its single channel.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// Whether both the connection and the channel are still usable.
    fn is_open(&self) -> bool;

    /// Declares a durable direct exchange.
    ///
    /// Declarations are issued so that a refusal leaves the session open.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Checks for an exchange without creating it.
    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError>;

    /// Checks for a queue without creating it.
    async fn queue_exists(&self, name: &str) -> Result<bool, AmqpError>;

    /// Publishes a persistent JSON message, waiting for the broker
    /// confirmation when confirms are enabled.
    async fn publish(&self, message: OutboundMessage<'_>) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Fetches a single message without blocking; `None` when the queue is empty.
    ///
    /// Fetching from a missing queue is a channel error: the session is
    /// closed afterwards.
    async fn get(&self, queue: &str) -> Result<Option<InboundDelivery>, AmqpError>;

    /// Closes the channel, then the connection.
    async fn close(&self) -> Result<(), AmqpError>;
}
