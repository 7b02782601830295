// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module opens lapin connections and channels and exposes them as a
//! [`Session`]. Connection and channel error callbacks are forwarded as
//! [`LifecycleEvent`]s so that the connection manager can decide when to
//! reconnect.
//!
//! Topology declarations and existence checks each run on a throwaway
//! channel. The broker answers a failed declare (a passive declare of a
//! missing object, or arguments that differ from an existing queue) by
//! closing the channel it was issued on, and the session channel must
//! survive that.

use crate::{
    configs::BrokerConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Acker, Connector, DeliveryStream, InboundDelivery, LifecycleEvent, OutboundMessage,
        Session, SessionId, JSON_CONTENT_TYPE, PERSISTENT_DELIVERY_MODE,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin sessions against the configured broker.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    uri: String,
    connection_name: String,
    confirms: bool,
}

impl LapinConnector {
    pub fn new(cfg: &BrokerConfigs) -> LapinConnector {
        LapinConnector {
            uri: cfg.url.clone(),
            connection_name: cfg.app_name.clone(),
            confirms: cfg.publisher_confirms,
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        session: SessionId,
        events: UnboundedSender<LifecycleEvent>,
    ) -> Result<Arc<dyn Session>, AmqpError> {
        debug!(session, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
        };
        debug!(session, "amqp connected");

        let tx = events.clone();
        conn.on_error(move |err| {
            // a broker-initiated close arrives as a protocol error
            let event = match err {
                lapin::Error::ProtocolError(_) => LifecycleEvent::ConnectionClosed { session },
                other => LifecycleEvent::ConnectionError {
                    session,
                    reason: other.to_string(),
                },
            };
            let _ = tx.send(event);
        });

        debug!(session, "creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if let Err(close_err) = conn.close(REPLY_SUCCESS, "channel failure").await {
                    debug!(error = close_err.to_string(), "closing half-open connection");
                }
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        };

        let tx = events;
        channel.on_error(move |err| {
            let _ = tx.send(LifecycleEvent::ChannelError {
                session,
                reason: err.to_string(),
            });
        });

        if self.confirms {
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
            {
                error!(error = err.to_string(), "error enabling publisher confirms");
                let _ = conn.close(REPLY_SUCCESS, "channel failure").await;
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        }

        debug!(session, "channel created");
        Ok(Arc::new(LapinSession {
            id: session,
            connection: conn,
            channel,
        }))
    }
}

/// A lapin connection and the single channel opened on it.
pub struct LapinSession {
    id: SessionId,
    connection: Connection,
    channel: Channel,
}

impl LapinSession {
    /// A channel for a single operation the broker may answer by closing it.
    async fn scratch_channel(&self) -> lapin::Result<Channel> {
        self.connection.create_channel().await
    }

    async fn finish_check(
        &self,
        name: &str,
        scratch: Channel,
        result: lapin::Result<()>,
    ) -> Result<bool, AmqpError> {
        close_scratch(scratch).await;

        match result {
            Ok(()) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(AmqpError::InspectError(name.to_owned(), err.to_string())),
        }
    }
}

#[async_trait]
impl Session for LapinSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let declared = match self.scratch_channel().await {
            Ok(scratch) => {
                let result = scratch
                    .exchange_declare(
                        &def.name,
                        lapin::ExchangeKind::Direct,
                        ExchangeDeclareOptions {
                            passive: false,
                            durable: true,
                            auto_delete: false,
                            internal: false,
                            nowait: false,
                        },
                        FieldTable::default(),
                    )
                    .await;
                close_scratch(scratch).await;
                result
            }
            Err(err) => Err(err),
        };

        declared.map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            AmqpError::DeclareExchangeError(def.name.clone())
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let declared = match self.scratch_channel().await {
            Ok(scratch) => {
                let result = scratch
                    .queue_declare(
                        &def.name,
                        QueueDeclareOptions {
                            passive: false,
                            durable: true,
                            exclusive: false,
                            auto_delete: false,
                            nowait: false,
                        },
                        field_table(def.arguments()),
                    )
                    .await
                    .map(|_| ());
                close_scratch(scratch).await;
                result
            }
            Err(err) => Err(err),
        };

        declared.map_err(|err| {
            error!(error = err.to_string(), name = def.name, "error to declare the queue");
            AmqpError::DeclareQueueError(def.name.clone())
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let bound = match self.scratch_channel().await {
            Ok(scratch) => {
                let result = scratch
                    .queue_bind(
                        &binding.queue_name,
                        &binding.exchange_name,
                        &binding.routing_key,
                        QueueBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await;
                close_scratch(scratch).await;
                result
            }
            Err(err) => Err(err),
        };

        bound.map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        })
    }

    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError> {
        let scratch = self
            .scratch_channel()
            .await
            .map_err(|err| AmqpError::InspectError(name.to_owned(), err.to_string()))?;
        let result = scratch
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        self.finish_check(name, scratch, result).await
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, AmqpError> {
        let scratch = self
            .scratch_channel()
            .await
            .map_err(|err| AmqpError::InspectError(name.to_owned(), err.to_string()))?;
        let result = scratch
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ());

        self.finish_check(name, scratch, result).await
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> Result<(), AmqpError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(message.message_id))
            .with_headers(field_table(message.headers));

        let confirm = self
            .channel
            .basic_publish(
                message.exchange,
                message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishNotConfirmed(message.exchange.to_owned()));
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        if prefetch > 0 {
            self.channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
                .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))?;
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned(), err.to_string())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(inbound)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<InboundDelivery>, AmqpError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|err| AmqpError::GetMessageError(queue.to_owned(), err.to_string()))?;

        Ok(message.map(|msg| inbound(msg.delivery)))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut outcome = Ok(());

        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(REPLY_SUCCESS, "OK").await {
                warn!(error = err.to_string(), "error closing channel");
                outcome = Err(AmqpError::ChannelError(err.to_string()));
            }
        }

        if self.connection.status().connected() {
            if let Err(err) = self.connection.close(REPLY_SUCCESS, "OK").await {
                warn!(error = err.to_string(), "error closing connection");
                outcome = Err(AmqpError::ConnectionError(err.to_string()));
            }
        }

        outcome
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}

fn inbound(delivery: Delivery) -> InboundDelivery {
    let headers = string_headers(delivery.properties.headers().as_ref());

    InboundDelivery::new(
        delivery.data,
        delivery.delivery_tag,
        delivery.redelivered,
        headers,
        Box::new(LapinAcker(delivery.acker)),
    )
}

async fn close_scratch(channel: Channel) {
    // a channel the broker already closed needs no close handshake
    if channel.status().connected() {
        if let Err(err) = channel.close(REPLY_SUCCESS, "done").await {
            debug!(error = err.to_string(), "closing scratch channel");
        }
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp_err) => matches!(
            amqp_err.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)
        ),
        _ => false,
    }
}

fn field_table(values: BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        table.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
    table
}

fn string_headers(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = table else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(v) => Some((
                key.to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
            _ => None,
        })
        .collect()
}
