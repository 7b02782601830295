// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! [`ConnectionManager`] owns the one broker session of the process. It opens
//! it, installs the topology on it, watches its lifecycle events and replaces
//! it after a failure. Publishers, consumers and the dead-letter reprocessor
//! never keep a session across operations; they ask the manager for the
//! current one every time.
//!
//! Reconnection uses a single fixed delay with no backoff. Connection-level
//! failures schedule a reconnect. Channel-level failures only move the state
//! to `Disconnected`; dependents find the session closed and report it back
//! through [`ConnectionManager::invalidate`], or the next
//! [`channel`](ConnectionManager::channel) call opens a fresh one.

use crate::{
    channel::LapinConnector,
    configs::BrokerConfigs,
    errors::AmqpError,
    topology::Topology,
    transport::{Connector, LifecycleEvent, Session, SessionId},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch, Mutex, Notify, RwLock,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Lifecycle of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type ReconnectTimer = (u64, JoinHandle<()>);

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    topology: Option<Topology>,
    reconnect_delay: Duration,
    session: RwLock<Option<Arc<dyn Session>>>,
    connecting: AtomicBool,
    connect_done: Notify,
    next_session: AtomicU64,
    timer: Mutex<Option<ReconnectTimer>>,
    timer_generation: AtomicU64,
    events: UnboundedSender<LifecycleEvent>,
    reconnect_due: UnboundedSender<u64>,
    state: watch::Sender<ConnectionState>,
}

/// Resets the single-flight flag even when a `connect` future is dropped
/// half way.
struct ConnectingGuard<'a>(&'a ConnectionManager);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.connecting.store(false, Ordering::SeqCst);
        self.0.connect_done.notify_waiters();
    }
}

impl ConnectionManager {
    /// Creates a manager and its supervisor task.
    ///
    /// Must be called from within a tokio runtime. Nothing is opened until
    /// [`connect`](Self::connect) or [`channel`](Self::channel) is called.
    pub fn new(
        cfg: &BrokerConfigs,
        connector: Arc<dyn Connector>,
        topology: Option<Topology>,
    ) -> Arc<ConnectionManager> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let manager = Arc::new(ConnectionManager {
            connector,
            topology,
            reconnect_delay: cfg.reconnect_delay,
            session: RwLock::new(None),
            connecting: AtomicBool::new(false),
            connect_done: Notify::new(),
            next_session: AtomicU64::new(0),
            timer: Mutex::new(None),
            timer_generation: AtomicU64::new(0),
            events: events_tx,
            reconnect_due: due_tx,
            state,
        });

        tokio::spawn(supervise(Arc::downgrade(&manager), events_rx, due_rx));

        manager
    }

    /// A lapin-backed manager provisioning the ballot pipeline topology.
    pub fn from_configs(cfg: &BrokerConfigs) -> Arc<ConnectionManager> {
        Self::new(
            cfg,
            Arc::new(LapinConnector::new(cfg)),
            Some(Topology::ballot_pipeline(cfg)),
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opens the session if none is live.
    ///
    /// Only one attempt runs at a time: callers arriving while an attempt is
    /// in flight wait for it instead of opening a second connection. A failed
    /// attempt schedules a background reconnect before the error is returned.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        if self.current().await.is_some() {
            return Ok(());
        }

        let notified = self.connect_done.notified();
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("connection attempt already in flight, waiting");
            notified.await;
            return match self.current().await {
                Some(_) => Ok(()),
                None => Err(AmqpError::ChannelUnavailable),
            };
        }
        let _guard = ConnectingGuard(self);

        // another attempt may have completed between the check and the swap
        if self.current().await.is_some() {
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Connecting);

        match self.open().await {
            Ok(session) => {
                self.cancel_timer().await;
                let id = session.id();
                let previous = self.session.write().await.replace(session);
                if let Some(previous) = previous {
                    close_in_background(previous);
                }
                self.state.send_replace(ConnectionState::Connected);
                info!(session = id, "connected to the broker");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect to the broker");
                self.schedule_reconnect().await;
                Err(err)
            }
        }
    }

    /// Drops the current session and arms the reconnect timer.
    ///
    /// A pending timer is replaced, so at most one reconnect is ever queued.
    pub async fn schedule_reconnect(&self) {
        let mut timer = self.timer.lock().await;
        if let Some((_, pending)) = timer.take() {
            pending.abort();
        }

        if let Some(previous) = self.session.write().await.take() {
            close_in_background(previous);
        }
        self.state.send_replace(ConnectionState::Disconnected);

        let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let due = self.reconnect_due.clone();
        let delay = self.reconnect_delay;

        warn!(delay = ?delay, "reconnect scheduled");

        *timer = Some((
            generation,
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = due.send(generation);
            }),
        ));
    }

    /// Cancels any pending reconnect and closes the session.
    pub async fn disconnect(&self) {
        self.cancel_timer().await;

        let previous = self.session.write().await.take();
        self.state.send_replace(ConnectionState::Disconnected);

        if let Some(session) = previous {
            if let Err(err) = session.close().await {
                warn!(error = err.to_string(), "error while closing the broker session");
            }
            info!(session = session.id(), "disconnected from the broker");
        }
    }

    /// The live session, connecting first when there is none.
    pub async fn channel(&self) -> Result<Arc<dyn Session>, AmqpError> {
        if let Some(session) = self.current().await {
            return Ok(session);
        }

        self.connect().await?;
        self.current().await.ok_or(AmqpError::ChannelUnavailable)
    }

    /// The live session, if any.
    pub async fn current(&self) -> Option<Arc<dyn Session>> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_open())
            .cloned()
    }

    /// Reports `session` as unusable; reconnects if it is still the current one.
    pub async fn invalidate(&self, session: SessionId) {
        if self.is_current(session).await {
            warn!(session, "session reported unusable");
            self.schedule_reconnect().await;
        }
    }

    async fn is_current(&self, session: SessionId) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.id() == session)
    }

    async fn open(&self) -> Result<Arc<dyn Session>, AmqpError> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let session = self.connector.connect(id, self.events.clone()).await?;

        if let Some(topology) = &self.topology {
            topology.install(session.as_ref()).await;
        }

        // the channel may have died while the topology was being declared
        if !session.is_open() {
            warn!(session = id, "session closed during setup, discarding it");
            close_in_background(session);
            return Err(AmqpError::ChannelUnavailable);
        }

        Ok(session)
    }

    async fn cancel_timer(&self) {
        if let Some((_, pending)) = self.timer.lock().await.take() {
            pending.abort();
        }
    }

    async fn on_lifecycle(&self, event: LifecycleEvent) {
        let session = event.session();

        match event {
            LifecycleEvent::ChannelError { reason, .. } => {
                error!(session, reason, "amqp channel error");
                // dependents report the session through `invalidate`; only the
                // observable state changes here
                if self.is_current(session).await {
                    self.state.send_replace(ConnectionState::Disconnected);
                }
            }
            LifecycleEvent::ConnectionError { .. } | LifecycleEvent::ConnectionClosed { .. } => {
                if !self.is_current(session).await {
                    debug!(session, "ignoring event of a replaced session");
                    return;
                }
                error!(session, event = ?event, "amqp connection lost");
                self.schedule_reconnect().await;
            }
        }
    }

    async fn on_reconnect_due(&self, generation: u64) {
        {
            let mut timer = self.timer.lock().await;
            match timer.as_ref() {
                Some((armed, _)) if *armed == generation => {
                    timer.take();
                }
                _ => return,
            }
        }

        info!("reconnecting to the broker");
        if let Err(err) = self.connect().await {
            warn!(error = err.to_string(), "background reconnect failed");
        }
    }
}

async fn supervise(
    manager: Weak<ConnectionManager>,
    mut events: UnboundedReceiver<LifecycleEvent>,
    mut due: UnboundedReceiver<u64>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.on_lifecycle(event).await;
            }
            Some(generation) = due.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.on_reconnect_due(generation).await;
            }
            else => break,
        }
    }
}

fn close_in_background(session: Arc<dyn Session>) {
    tokio::spawn(async move {
        if let Err(err) = session.close().await {
            debug!(error = err.to_string(), "closing a replaced session");
        }
    });
}
