// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! A [`Topology`] describes the exchanges, queues and bindings the ballot
//! pipeline relies on. The connection manager installs it on every fresh
//! session, so all declarations are create-if-missing and installing twice
//! is harmless.
//!
//! Installation is best effort: a failed declaration is logged and recorded
//! in the returned [`ProvisionReport`], and the remaining declarations are
//! still issued.

use crate::{
    configs::BrokerConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::Session,
};
use std::collections::HashSet;
use tracing::{debug, error, warn};

/// Exchanges, queues and bindings to declare on the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

/// Outcome of one installation.
///
/// Installation never stops at the first error, so a report can hold
/// several failures next to a non-zero `declared` count. The connection
/// manager only logs it; callers installing a topology by hand can inspect
/// it to decide whether to retry.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Number of declarations and bindings the broker accepted
    pub declared: usize,
    /// One entry per refused declaration or binding, in issue order
    pub failures: Vec<AmqpError>,
}

impl ProvisionReport {
    /// Whether the broker accepted every declaration and binding.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, result: Result<(), AmqpError>) {
        match result {
            Ok(()) => self.declared += 1,
            Err(err) => self.failures.push(err),
        }
    }
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange; an exchange already present by name is replaced.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.retain(|e| e.name != def.name);
        self.exchanges.push(def);
        self
    }

    /// Adds a queue; a queue already present by name is replaced.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }

    /// The topology of the ballot processing pipeline.
    ///
    /// Every work queue is bound to the ballot processing exchange by its
    /// routing key and dead-letters into `<queue>.dlq` through the dead-letter
    /// exchange.
    pub fn ballot_pipeline(cfg: &BrokerConfigs) -> Topology {
        let exchange = &cfg.exchanges.ballot_processing;
        let dlx = &cfg.exchanges.dead_letter;

        let work = [
            (&cfg.queues.image_processing, &cfg.routing_keys.image_processing),
            (&cfg.queues.ocr_processing, &cfg.routing_keys.ocr_processing),
            (&cfg.queues.data_validation, &cfg.routing_keys.data_validation),
            (
                &cfg.queues.result_aggregation,
                &cfg.routing_keys.result_aggregation,
            ),
            (&cfg.queues.results, &cfg.routing_keys.results),
        ];

        let mut topology = Topology::new()
            .exchange(ExchangeDefinition::new(exchange))
            .exchange(ExchangeDefinition::new(&cfg.exchanges.notifications))
            .exchange(ExchangeDefinition::new(dlx));

        for (queue, key) in work {
            topology = topology
                .queue(QueueDefinition::new(queue).with_dlq(dlx))
                .queue_binding(QueueBinding::new(queue).exchange(exchange).routing_key(key));
        }

        topology
    }

    /// Declares everything on `session`.
    ///
    /// Exchanges come first (including dead-letter exchanges only referenced
    /// by a queue), then queues with their dead-letter queues, then bindings.
    /// A refused declaration does not close the session, so the remaining
    /// ones are still issued.
    ///
    /// # Parameters
    /// * `session` - A live session to declare on
    ///
    /// # Returns
    /// A [`ProvisionReport`] counting what was declared and listing every
    /// failure
    pub async fn install(&self, session: &dyn Session) -> ProvisionReport {
        let mut report = ProvisionReport::default();

        for exch in self.all_exchanges() {
            debug!("creating exchange: {}", exch.name);
            report.record(session.declare_exchange(&exch).await);
        }

        for def in &self.queues {
            if let Some(route) = def.dead_letter() {
                debug!("creating dlq: {}", route.queue);
                report.record(session.declare_queue(&QueueDefinition::new(&route.queue)).await);
            }

            debug!("creating queue: {}", def.name);
            report.record(session.declare_queue(def).await);
        }

        for binding in self.all_bindings() {
            debug!(
                queue = binding.queue_name,
                exchange = binding.exchange_name,
                routing_key = binding.routing_key,
                "binding queue"
            );
            report.record(session.bind_queue(&binding).await);
        }

        if report.is_complete() {
            debug!(declared = report.declared, "topology installed");
        } else {
            for failure in &report.failures {
                error!(error = failure.to_string(), "topology declaration failed");
            }
            warn!(
                failures = report.failures.len(),
                "topology partially installed"
            );
        }

        report
    }

    fn all_exchanges(&self) -> Vec<ExchangeDefinition> {
        let mut seen = HashSet::new();
        let mut all = vec![];

        let implied = self
            .queues
            .iter()
            .filter_map(|q| q.dead_letter())
            .map(|route| ExchangeDefinition::new(&route.exchange));

        for exch in self.exchanges.iter().cloned().chain(implied) {
            if exch.is_default() {
                continue;
            }
            if seen.insert(exch.name.clone()) {
                all.push(exch);
            }
        }

        all
    }

    fn all_bindings(&self) -> Vec<QueueBinding> {
        let dlq = self.queues.iter().filter_map(|q| q.dead_letter()).map(|route| {
            QueueBinding::new(&route.queue)
                .exchange(&route.exchange)
                .routing_key(&route.routing_key)
        });

        let mut all: Vec<QueueBinding> = vec![];
        for binding in self.queues_binding.iter().cloned().chain(dlq) {
            if binding.exchange_name.is_empty() || all.contains(&binding) {
                continue;
            }
            all.push(binding);
        }

        all
    }
}
