// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Reprocessing
//!
//! Moves messages from a dead-letter queue back to the queue they came from
//! once the cause of their failure has been fixed. Messages are republished
//! byte for byte through the default exchange, so `target` is a queue name.
//! The broker silently drops a default-exchange publish to a queue that does
//! not exist, so `target` is checked before the first message is taken.

use crate::{
    connection::ConnectionManager, errors::AmqpError, publisher::DEFAULT_EXCHANGE,
    transport::{InboundDelivery, OutboundMessage},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct DeadLetterReprocessor {
    manager: Arc<ConnectionManager>,
}

impl DeadLetterReprocessor {
    /// Creates a reprocessor working on the sessions of `manager`.
    pub fn new(manager: Arc<ConnectionManager>) -> DeadLetterReprocessor {
        DeadLetterReprocessor { manager }
    }

    /// Moves up to `max_count` messages from `dlq` to `target`.
    ///
    /// Stops early when `dlq` is empty. A message that cannot be republished
    /// or acknowledged goes back to `dlq` and ends the batch.
    ///
    /// # Parameters
    /// * `dlq` - The dead-letter queue to drain
    /// * `target` - The queue to move messages to
    /// * `max_count` - Upper bound of messages moved in this batch
    ///
    /// # Returns
    /// How many messages were moved. Fails when no session can be obtained
    /// or when `target` does not exist, before any message is touched.
    pub async fn retry_dead_letter_messages(
        &self,
        dlq: &str,
        target: &str,
        max_count: usize,
    ) -> Result<usize, AmqpError> {
        let session = self.manager.channel().await?;

        match session.queue_exists(target).await {
            Ok(true) => {}
            Ok(false) => {
                error!(dlq, target, "target queue does not exist, nothing moved");
                return Err(AmqpError::QueueNotFound(target.to_owned()));
            }
            Err(err) => {
                if !session.is_open() {
                    self.manager.invalidate(session.id()).await;
                }
                return Err(err);
            }
        }

        let mut moved = 0;

        while moved < max_count {
            let delivery = match session.get(dlq).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(err) => {
                    error!(error = err.to_string(), dlq, "error fetching dead-lettered message");
                    break;
                }
            };

            let message = OutboundMessage {
                exchange: DEFAULT_EXCHANGE,
                routing_key: target,
                payload: &delivery.data,
                message_id: Uuid::new_v4().to_string(),
                headers: BTreeMap::new(),
            };

            if let Err(err) = session.publish(message).await {
                warn!(error = err.to_string(), dlq, target, "error republishing, returning message");
                return_to_dlq(dlq, delivery).await;
                break;
            }

            // the copy already sent to target stays there
            if let Err((err, delivery)) = delivery.try_ack().await {
                error!(error = err.to_string(), dlq, "error acknowledging dead-lettered message");
                return_to_dlq(dlq, delivery).await;
                break;
            }

            moved += 1;
        }

        if !session.is_open() {
            self.manager.invalidate(session.id()).await;
        }

        info!(dlq, target, moved, "dead-lettered messages moved");
        Ok(moved)
    }
}

async fn return_to_dlq(dlq: &str, delivery: InboundDelivery) {
    // with the channel gone the broker requeues the message by itself
    if let Err(err) = delivery.reject(true).await {
        error!(error = err.to_string(), dlq, "error returning message to the dlq");
    }
}
