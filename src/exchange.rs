// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are where publishers send ballot messages; the broker forwards
//! them to bound queues by routing key. Definitions are owned values so a
//! topology can be kept for the life of the process and re-declared after
//! every reconnect.

/// Definition of a RabbitMQ exchange.
///
/// Every exchange of the ballot pipeline is a durable direct exchange, so the
/// name is the only thing that varies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
}

impl ExchangeDefinition {
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The default exchange is predeclared by the broker and cannot be
    /// declared again.
    pub(crate) fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}
