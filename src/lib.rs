// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ballot Broker
//!
//! RabbitMQ plumbing for the ballot processing pipeline: one managed
//! connection that heals itself, idempotent topology provisioning, publishing
//! with an exchange recheck, permanent consumer subscriptions with manual
//! acknowledgement, and recovery of dead-lettered messages.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;
