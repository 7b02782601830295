// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types for defining RabbitMQ queues and their bindings to exchanges.
//! A queue may carry a dead-letter route: messages rejected without requeue
//! are forwarded by the broker to a dedicated `<queue>.dlq` queue, from
//! where an operator can move them back with the dead-letter reprocessor.

use std::collections::BTreeMap;

/// Queue argument naming the exchange rejected messages are forwarded to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Suffix appended to a queue name to form its dead-letter queue name
pub const DLQ_SUFFIX: &str = ".dlq";

/// Where rejected messages of a queue end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRoute {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

/// Definition of a durable RabbitMQ queue and its optional dead-letter route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) dead_letter: Option<DeadLetterRoute>,
}

impl QueueDefinition {
    /// Creates a new durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            dead_letter: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterRoute> {
        self.dead_letter.as_ref()
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// Rejected messages are routed through `exchange` with the routing key
    /// `<name>.dlq` into a durable queue of the same name.
    pub fn with_dlq(mut self, exchange: &str) -> Self {
        let dlq = format!("{}{}", self.name, DLQ_SUFFIX);
        self.dead_letter = Some(DeadLetterRoute {
            exchange: exchange.to_owned(),
            routing_key: dlq.clone(),
            queue: dlq,
        });
        self
    }

    /// Arguments sent with the queue declaration.
    pub(crate) fn arguments(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();

        if let Some(route) = &self.dead_letter {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                route.exchange.clone(),
            );
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                route.routing_key.clone(),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
