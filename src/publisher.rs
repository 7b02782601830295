// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes ballot messages to an exchange with a routing key. The exchange
//! is checked before every publish; a missing exchange gets one recheck after
//! a short delay, which covers the window where another service is still
//! provisioning the topology.
//!
//! Publishing never returns an error: every failure is logged and reported as
//! `false`, leaving the retry decision to the caller.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    otel,
    transport::{OutboundMessage, Session},
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Name of the broker's default exchange, which routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

pub struct Publisher {
    manager: Arc<ConnectionManager>,
    recheck_delay: Duration,
}

impl Publisher {
    /// Creates a publisher sharing the sessions of `manager`.
    ///
    /// # Parameters
    /// * `manager` - Source of the live session for every publish
    /// * `recheck_delay` - How long to wait before checking a missing
    ///   exchange a second time
    ///
    /// # Returns
    /// A publisher that can be shared between tasks
    pub fn new(manager: Arc<ConnectionManager>, recheck_delay: Duration) -> Arc<Publisher> {
        Arc::new(Publisher {
            manager,
            recheck_delay,
        })
    }

    /// Serializes `message` to JSON and publishes it persistently.
    ///
    /// Returns `true` once the broker accepted the message (and confirmed it
    /// when publisher confirms are enabled).
    pub async fn publish<T>(&self, exchange: &str, routing_key: &str, message: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        let payload = match serde_json::to_vec(message) {
            Ok(p) => p,
            Err(err) => {
                error!(error = err.to_string(), exchange, routing_key, "error serializing message");
                return false;
            }
        };

        self.publish_raw(exchange, routing_key, &payload).await
    }

    /// Publishes an already encoded JSON payload.
    pub async fn publish_raw(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> bool {
        match self.try_publish(exchange, routing_key, payload).await {
            Ok(()) => {
                debug!(exchange, routing_key, "message published");
                true
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                false
            }
        }
    }

    async fn try_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let session = self.session_with_exchange(exchange).await?;

        let mut headers = BTreeMap::new();
        otel::inject_current(&mut headers);

        let message = OutboundMessage {
            exchange,
            routing_key,
            payload,
            message_id: Uuid::new_v4().to_string(),
            headers,
        };

        if let Err(err) = session.publish(message).await {
            if err.is_channel_loss() || !session.is_open() {
                self.manager.invalidate(session.id()).await;
            }
            return Err(err);
        }

        Ok(())
    }

    /// The live session, once `exchange` is known to exist on the broker.
    async fn session_with_exchange(&self, exchange: &str) -> Result<Arc<dyn Session>, AmqpError> {
        let session = self.manager.channel().await?;
        if exchange == DEFAULT_EXCHANGE || self.exchange_exists(&session, exchange).await? {
            return Ok(session);
        }

        warn!(
            exchange,
            delay = ?self.recheck_delay,
            "exchange not found, checking again"
        );
        tokio::time::sleep(self.recheck_delay).await;

        let session = self.manager.channel().await?;
        if self.exchange_exists(&session, exchange).await? {
            return Ok(session);
        }

        Err(AmqpError::InspectError(
            exchange.to_owned(),
            "exchange does not exist".to_owned(),
        ))
    }

    async fn exchange_exists(
        &self,
        session: &Arc<dyn Session>,
        exchange: &str,
    ) -> Result<bool, AmqpError> {
        let result = session.exchange_exists(exchange).await;
        if result.is_err() && !session.is_open() {
            self.manager.invalidate(session.id()).await;
        }
        result
    }
}
