// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits for tests.
//!
//! It keeps just enough of AMQP 0-9-1 to exercise the broker core: direct
//! routing, manual acknowledgement with prefetch, dead-lettering on reject,
//! redelivery of unacknowledged messages when a session closes, and knobs to
//! inject connection, publish and ack failures.
//!
//! Soft errors behave as on a real broker. A `get` or `consume` on a missing
//! queue closes the session channel and reports a channel error. Declarations
//! run on their own short-lived channel, so a refused one leaves the session
//! open.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Acker, Connector, DeliveryStream, InboundDelivery, LifecycleEvent, OutboundMessage,
        Session, SessionId,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedSender};

/// A message as recorded by [`MemoryBroker::published`].
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct Message {
    data: Vec<u8>,
    headers: BTreeMap<String, String>,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    session: SessionId,
    prefetch: u16,
    tx: UnboundedSender<InboundDelivery>,
}

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    dead_letter: Option<(String, String)>,
}

struct Unacked {
    queue: String,
    message: Message,
    session: SessionId,
    consumer: Option<String>,
}

struct SessionSlot {
    open: bool,
    events: UnboundedSender<LifecycleEvent>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: BTreeMap<String, MemoryQueue>,
    bindings: Vec<(String, String, String)>,
    unacked: BTreeMap<u64, Unacked>,
    next_tag: u64,
    sessions: HashMap<SessionId, SessionSlot>,
    next_detached: u64,
    connect_attempts: usize,
    connections_opened: usize,
    fail_connects: usize,
    connect_delay: Duration,
    publish_count: usize,
    fail_publish_at: HashSet<usize>,
    fail_acks: usize,
    fail_declarations: HashSet<String>,
    drop_channel_on: HashSet<String>,
    refused_declarations: usize,
    exchange_checks: HashMap<String, usize>,
    published: Vec<PublishedRecord>,
}

impl BrokerState {
    fn is_open(&self, session: SessionId) -> bool {
        self.sessions.get(&session).is_some_and(|s| s.open)
    }

    fn ensure_open(&self, session: SessionId) -> Result<(), AmqpError> {
        if self.is_open(session) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }

    /// Routes a message; `Err` when the exchange does not exist.
    fn route(&mut self, exchange: &str, key: &str, message: Message) -> Result<(), AmqpError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![key.to_owned()]
        } else if self.exchanges.contains(exchange) {
            self.bindings
                .iter()
                .filter(|(_, e, k)| e == exchange && k == key)
                .map(|(q, _, _)| q.clone())
                .collect()
        } else {
            return Err(AmqpError::PublishingError(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
            }
        }

        Ok(())
    }

    fn dead_letter(&mut self, queue: &str, mut message: Message) {
        let route = self.queues.get(queue).and_then(|q| q.dead_letter.clone());
        if let Some((exchange, key)) = route {
            message.redelivered = false;
            let _ = self.route(&exchange, &key, message);
        }
    }

    fn requeue(&mut self, queue: &str, mut message: Message) {
        message.redelivered = true;
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_front(message);
        }
    }

    /// Closes the channel of `session` from the broker side and reports it.
    fn fail_channel(&mut self, session: SessionId, reason: &str) {
        if let Some(events) = self.close_session(session) {
            let _ = events.send(LifecycleEvent::ChannelError {
                session,
                reason: reason.to_owned(),
            });
        }
    }

    /// Checks a declaration of `name` against the injected failures.
    fn admit_declaration(&mut self, session: SessionId, name: &str) -> Result<(), AmqpError> {
        self.ensure_open(session)?;
        if self.drop_channel_on.remove(name) {
            self.fail_channel(session, "CHANNEL_ERROR - connection reset");
            return Err(AmqpError::ChannelError("channel closed".to_owned()));
        }
        if self.fail_declarations.contains(name) {
            self.refused_declarations += 1;
            return Err(AmqpError::ChannelError(format!(
                "PRECONDITION_FAILED - inequivalent arg for '{name}'"
            )));
        }
        Ok(())
    }

    /// Closes `session`, requeueing everything it left unacknowledged.
    fn close_session(&mut self, session: SessionId) -> Option<UnboundedSender<LifecycleEvent>> {
        let slot = self.sessions.get_mut(&session)?;
        if !slot.open {
            return None;
        }
        slot.open = false;
        let events = slot.events.clone();

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.session != session);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(&unacked.queue, unacked.message);
            }
        }

        Some(events)
    }
}

/// Shared handle to the in-memory broker; clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        let broker = MemoryBroker::default();
        broker.lock().next_detached = 10_000;
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect("broker state poisoned")
    }

    /// Opens a session outside of any connection manager.
    pub fn open_session(&self) -> Arc<dyn Session> {
        let id = {
            let mut st = self.lock();
            st.next_detached += 1;
            st.next_detached
        };
        let (events, _) = mpsc::unbounded_channel();
        self.open_session_for(id, events)
    }

    pub fn open_session_for(
        &self,
        id: SessionId,
        events: UnboundedSender<LifecycleEvent>,
    ) -> Arc<dyn Session> {
        let mut st = self.lock();
        st.connections_opened += 1;
        st.sessions.insert(id, SessionSlot { open: true, events });
        Arc::new(MemorySession {
            id,
            broker: self.clone(),
        })
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_connects = n;
    }

    /// Makes the `n`-th publish (counted from 1 over the broker lifetime) fail.
    pub fn fail_publish_number(&self, n: usize) {
        self.lock().fail_publish_at.insert(n);
    }

    /// Makes the next `n` acks fail, closing the channel they were sent on.
    pub fn fail_next_acks(&self, n: usize) {
        self.lock().fail_acks = n;
    }

    /// Makes every declaration of `name` fail, as a queue redeclared with
    /// different arguments does.
    pub fn fail_declarations_of(&self, name: &str) {
        self.lock().fail_declarations.insert(name.to_owned());
    }

    /// Makes the next declaration of `name` kill the session channel.
    pub fn drop_channel_on_declaration_of(&self, name: &str) {
        self.lock().drop_channel_on.insert(name.to_owned());
    }

    /// Closes the channel of `session` as the broker does after a channel
    /// exception.
    pub fn close_channel_of(&self, session: SessionId, reason: &str) {
        let mut st = self.lock();
        st.fail_channel(session, reason);
        self.dispatch(&mut st);
    }

    /// Declarations and bindings the broker refused.
    pub fn refused_declarations(&self) -> usize {
        self.lock().refused_declarations
    }

    /// Drops every open connection as if the broker went away.
    pub fn kill_connections(&self) {
        let notify = {
            let mut st = self.lock();
            let open: Vec<SessionId> = st
                .sessions
                .iter()
                .filter(|(_, s)| s.open)
                .map(|(id, _)| *id)
                .collect();
            open.into_iter()
                .filter_map(|id| st.close_session(id).map(|tx| (id, tx)))
                .collect::<Vec<_>>()
        };

        for (session, events) in notify {
            let _ = events.send(LifecycleEvent::ConnectionClosed { session });
        }
    }

    pub fn create_exchange(&self, name: &str) {
        self.lock().exchanges.insert(name.to_owned());
    }

    pub fn create_queue(&self, name: &str) {
        let mut st = self.lock();
        st.queues.entry(name.to_owned()).or_default();
        self.dispatch(&mut st);
    }

    pub fn bind(&self, queue: &str, exchange: &str, key: &str) {
        let binding = (queue.to_owned(), exchange.to_owned(), key.to_owned());
        let mut st = self.lock();
        if !st.bindings.contains(&binding) {
            st.bindings.push(binding);
        }
    }

    pub fn enqueue(&self, queue: &str, data: &[u8]) {
        let mut st = self.lock();
        if let Some(q) = st.queues.get_mut(queue) {
            q.ready.push_back(Message {
                data: data.to_vec(),
                headers: BTreeMap::new(),
                redelivered: false,
            });
        }
        self.dispatch(&mut st);
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Bodies of the ready messages of `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.data.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn exchange_checks(&self, name: &str) -> usize {
        self.lock().exchange_checks.get(name).copied().unwrap_or(0)
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.lock().published.clone()
    }

    fn delivery(&self, tag: u64, session: SessionId, message: &Message) -> InboundDelivery {
        InboundDelivery::new(
            message.data.clone(),
            tag,
            message.redelivered,
            message.headers.clone(),
            Box::new(MemoryAcker {
                broker: self.clone(),
                tag,
                session,
            }),
        )
    }

    /// Pushes ready messages to consumers with spare prefetch capacity.
    fn dispatch(&self, st: &mut BrokerState) {
        let names: Vec<String> = st.queues.keys().cloned().collect();

        for name in names {
            loop {
                let Some(queue) = st.queues.get_mut(&name) else {
                    break;
                };
                if queue.ready.is_empty() || queue.consumers.is_empty() {
                    break;
                }

                let n = queue.consumers.len();
                let chosen = (0..n).map(|i| (queue.next_consumer + i) % n).find(|idx| {
                    let c = &queue.consumers[*idx];
                    let in_flight = st
                        .unacked
                        .values()
                        .filter(|u| u.session == c.session && u.consumer.as_deref() == Some(&c.tag))
                        .count();
                    c.prefetch == 0 || in_flight < usize::from(c.prefetch)
                });
                let Some(idx) = chosen else {
                    break;
                };
                let Some(message) = queue.ready.pop_front() else {
                    break;
                };
                queue.next_consumer = (idx + 1) % n;

                st.next_tag += 1;
                let tag = st.next_tag;
                let consumer = &queue.consumers[idx];
                let delivery = self.delivery(tag, consumer.session, &message);

                if consumer.tx.send(delivery).is_err() {
                    queue.consumers.remove(idx);
                    queue.ready.push_front(message);
                    continue;
                }

                let unacked = Unacked {
                    queue: name.clone(),
                    message,
                    session: consumer.session,
                    consumer: Some(consumer.tag.clone()),
                };
                st.unacked.insert(tag, unacked);
            }
        }
    }

    fn terminate(&self, tag: u64, session: SessionId, requeue: Option<bool>) -> Result<(), String> {
        let mut st = self.lock();
        if !st.is_open(session) {
            return Err("channel closed".to_owned());
        }

        if requeue.is_none() && st.fail_acks > 0 {
            st.fail_acks -= 1;
            st.fail_channel(session, "PRECONDITION_FAILED - unknown delivery tag");
            self.dispatch(&mut st);
            return Err("channel closed by broker".to_owned());
        }

        let Some(unacked) = st.unacked.remove(&tag) else {
            return Err(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"));
        };

        match requeue {
            None => {}
            Some(true) => st.requeue(&unacked.queue, unacked.message),
            Some(false) => st.dead_letter(&unacked.queue, unacked.message),
        }

        self.dispatch(&mut st);
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        session: SessionId,
        events: UnboundedSender<LifecycleEvent>,
    ) -> Result<Arc<dyn Session>, AmqpError> {
        let delay = {
            let mut st = self.lock();
            st.connect_attempts += 1;
            st.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut st = self.lock();
            if st.fail_connects > 0 {
                st.fail_connects -= 1;
                return Err(AmqpError::ConnectionError("connection refused".to_owned()));
            }
        }

        Ok(self.open_session_for(session, events))
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    tag: u64,
    session: SessionId,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker
            .terminate(self.tag, self.session, None)
            .map_err(AmqpError::AckMessageError)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker
            .terminate(self.tag, self.session, Some(requeue))
            .map_err(AmqpError::RejectMessageError)
    }
}

struct MemorySession {
    id: SessionId,
    broker: MemoryBroker,
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker.lock().is_open(self.id)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        if st.admit_declaration(self.id, def.name()).is_err() {
            self.broker.dispatch(&mut st);
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }
        st.exchanges.insert(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        if st.admit_declaration(self.id, def.name()).is_err() {
            self.broker.dispatch(&mut st);
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }
        let queue = st.queues.entry(def.name().to_owned()).or_default();
        if queue.dead_letter.is_none() {
            queue.dead_letter = def
                .dead_letter()
                .map(|r| (r.exchange.clone(), r.routing_key.clone()));
        }
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        st.ensure_open(self.id)?;
        if !st.queues.contains_key(binding.queue_name())
            || !st.exchanges.contains(binding.exchange_name())
        {
            st.refused_declarations += 1;
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        let entry = (
            binding.queue_name().to_owned(),
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
        );
        if !st.bindings.contains(&entry) {
            st.bindings.push(entry);
        }
        Ok(())
    }

    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError> {
        let mut st = self.broker.lock();
        st.ensure_open(self.id)?;
        *st.exchange_checks.entry(name.to_owned()).or_default() += 1;
        Ok(st.exchanges.contains(name))
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, AmqpError> {
        let st = self.broker.lock();
        st.ensure_open(self.id)?;
        Ok(st.queues.contains_key(name))
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        st.ensure_open(self.id)?;

        st.publish_count += 1;
        let count = st.publish_count;
        if st.fail_publish_at.contains(&count) {
            return Err(AmqpError::PublishNotConfirmed(message.exchange.to_owned()));
        }

        st.route(
            message.exchange,
            message.routing_key,
            Message {
                data: message.payload.to_vec(),
                headers: message.headers.clone(),
                redelivered: false,
            },
        )?;
        st.published.push(PublishedRecord {
            exchange: message.exchange.to_owned(),
            routing_key: message.routing_key.to_owned(),
            payload: message.payload.to_vec(),
            message_id: message.message_id,
            headers: message.headers,
        });

        self.broker.dispatch(&mut st);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = self.broker.lock();
            st.ensure_open(self.id)?;
            if !st.queues.contains_key(queue) {
                st.fail_channel(self.id, "NOT_FOUND - no queue");
                self.broker.dispatch(&mut st);
                return Err(AmqpError::BindingConsumerError(
                    queue.to_owned(),
                    "NOT_FOUND".to_owned(),
                ));
            }
            if let Some(q) = st.queues.get_mut(queue) {
                q.consumers.push(ConsumerSlot {
                    tag: consumer_tag.to_owned(),
                    session: self.id,
                    prefetch,
                    tx,
                });
            }
            self.broker.dispatch(&mut st);
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<InboundDelivery>, AmqpError> {
        let mut st = self.broker.lock();
        st.ensure_open(self.id)?;

        if !st.queues.contains_key(queue) {
            st.fail_channel(self.id, "NOT_FOUND - no queue");
            self.broker.dispatch(&mut st);
            return Err(AmqpError::GetMessageError(
                queue.to_owned(),
                "NOT_FOUND".to_owned(),
            ));
        }
        let Some(message) = st.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };

        st.next_tag += 1;
        let tag = st.next_tag;
        let delivery = self.broker.delivery(tag, self.id, &message);
        st.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_owned(),
                message,
                session: self.id,
                consumer: None,
            },
        );

        Ok(Some(delivery))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        st.close_session(self.id);
        self.broker.dispatch(&mut st);
        Ok(())
    }
}
