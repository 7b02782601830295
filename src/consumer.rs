// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A subscription decodes every delivery of a queue as JSON, hands it to a
//! [`MessageHandler`] and terminates it: ack on success, reject without
//! requeue on any failure so the broker dead-letters it.
//!
//! Subscriptions are permanent. Each one runs on its own task which sets the
//! consumer up, drains the delivery stream and goes back to setup whenever
//! the stream ends, which is how it re-arms after a reconnect. A queue that
//! does not exist yet is polled until it appears.

use crate::{
    connection::ConnectionManager,
    errors::{AmqpError, HandlerError},
    otel,
    transport::{DeliveryStream, InboundDelivery, Session},
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{
    borrow::Cow, future::Future, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Business logic invoked for every decoded message.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, message: T) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: T) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Where a subscription currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Waiting for a session, for the queue, or retrying after a setup error
    SettingUp,
    /// Registered on the broker and receiving deliveries
    Armed,
}

pub struct Consumer {
    manager: Arc<ConnectionManager>,
    retry_delay: Duration,
    prefetch: u16,
}

impl Consumer {
    /// Creates a consumer whose subscriptions share the sessions of `manager`.
    ///
    /// # Parameters
    /// * `manager` - Source of the live session, also told about sessions a
    ///   subscription found closed
    /// * `retry_delay` - Wait between setup attempts and between polls for a
    ///   queue that does not exist yet
    /// * `prefetch` - Unacknowledged deliveries allowed per subscription;
    ///   `0` leaves the broker default
    pub fn new(manager: Arc<ConnectionManager>, retry_delay: Duration, prefetch: u16) -> Consumer {
        Consumer {
            manager,
            retry_delay,
            prefetch,
        }
    }

    /// Subscribes `handler` to `queue` and returns immediately.
    ///
    /// The subscription never gives up: setup is retried every retry delay
    /// until it succeeds, and repeated after every loss of the channel.
    pub fn consume<T, H>(&self, queue: &str, handler: H) -> ConsumerHandle
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let (state_tx, state_rx) = watch::channel(ConsumerState::SettingUp);

        let subscription = Subscription {
            manager: self.manager.clone(),
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.clone(),
            retry_delay: self.retry_delay,
            prefetch: self.prefetch,
            handler,
            tracer: global::tracer("ballot-broker"),
            _message: PhantomData,
        };

        ConsumerHandle {
            queue: queue.to_owned(),
            consumer_tag,
            state: state_rx,
            task: tokio::spawn(subscription.run(state_tx)),
        }
    }
}

/// Caller-side view of a running subscription.
pub struct ConsumerHandle {
    queue: String,
    consumer_tag: String,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Waits until the subscription is armed.
    ///
    /// Returns `false` if the subscription task is gone.
    pub async fn wait_armed(&self) -> bool {
        let mut state = self.state.clone();
        let armed = state
            .wait_for(|s| *s == ConsumerState::Armed)
            .await
            .is_ok();
        armed
    }

    /// Stops the subscription. Unterminated deliveries go back to the broker
    /// once the channel closes.
    pub fn cancel(self) {
        self.task.abort();
    }
}

struct Subscription<T, H> {
    manager: Arc<ConnectionManager>,
    queue: String,
    consumer_tag: String,
    retry_delay: Duration,
    prefetch: u16,
    handler: H,
    tracer: BoxedTracer,
    _message: PhantomData<fn() -> T>,
}

impl<T, H> Subscription<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    async fn run(self, state: watch::Sender<ConsumerState>) {
        loop {
            state.send_replace(ConsumerState::SettingUp);

            let (session, stream) = match self.arm().await {
                Ok(Some(armed)) => armed,
                Ok(None) => {
                    info!(
                        queue = self.queue,
                        "queue does not exist yet, waiting for it"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = self.queue,
                        "error to set up the consumer"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            state.send_replace(ConsumerState::Armed);
            info!(
                queue = self.queue,
                consumer_tag = self.consumer_tag,
                "consumer armed"
            );

            self.drain(session, stream).await;
            warn!(queue = self.queue, "consumer lost its channel, setting up again");
        }
    }

    async fn arm(&self) -> Result<Option<(Arc<dyn Session>, DeliveryStream)>, AmqpError> {
        let session = self.manager.channel().await?;

        let exists = match session.queue_exists(&self.queue).await {
            Ok(exists) => exists,
            Err(err) => {
                self.release(&session).await;
                return Err(err);
            }
        };
        if !exists {
            return Ok(None);
        }

        match session
            .consume(&self.queue, &self.consumer_tag, self.prefetch)
            .await
        {
            Ok(stream) => Ok(Some((session, stream))),
            Err(err) => {
                self.release(&session).await;
                Err(err)
            }
        }
    }

    async fn drain(&self, session: Arc<dyn Session>, mut stream: DeliveryStream) {
        while let Some(next) = stream.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(err) => {
                    error!(error = err.to_string(), queue = self.queue, "consumer stream failed");
                    break;
                }
            };

            if let Err(err) = self.process(delivery).await {
                error!(
                    error = err.to_string(),
                    queue = self.queue,
                    "error to terminate the delivery"
                );
                self.manager.invalidate(session.id()).await;
                break;
            }
        }

        self.release(&session).await;
    }

    /// Runs the handler and terminates the delivery.
    async fn process(&self, delivery: InboundDelivery) -> Result<(), AmqpError> {
        let (_ctx, mut span) = otel::new_span(&delivery.headers, &self.tracer, &self.queue);

        debug!(
            queue = self.queue,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "received message"
        );

        match self.handle(&delivery.data).await {
            Ok(()) => {
                delivery.ack().await?;
                debug!(queue = self.queue, "message processed");
                Ok(())
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                warn!(
                    error = err.to_string(),
                    queue = self.queue,
                    "message processing failed, rejecting"
                );
                delivery.reject(false).await
            }
        }
    }

    async fn handle(&self, data: &[u8]) -> Result<(), HandlerError> {
        let message: T = serde_json::from_slice(data)?;

        AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::new("handler panicked")))
    }

    async fn release(&self, session: &Arc<dyn Session>) {
        if !session.is_open() {
            self.manager.invalidate(session.id()).await;
        }
    }
}
