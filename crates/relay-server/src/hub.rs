//! The hub: sole owner of the live-connection registry and of the
//! persist-then-broadcast pipeline.
//!
//! All registry mutations and message accepts travel through one bounded
//! command channel drained by a single task, so they observe one total order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use relay_core::{BroadcastMessage, ChatMessage, ChatStore, ConnectionId, RelayError};
use relay_telemetry::RelayMetrics;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::ConnectionHandle;

pub enum HubCommand {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Accept(ChatMessage),
    Members(oneshot::Sender<Vec<ConnectionId>>),
}

/// Outcome of one broadcast fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: u64,
    pub dropped: u64,
}

/// State owned by the hub task.
pub struct HubState {
    members: HashMap<ConnectionId, ConnectionHandle>,
    store: Arc<dyn ChatStore>,
    metrics: Arc<RelayMetrics>,
}

impl HubState {
    pub fn new(store: Arc<dyn ChatStore>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            members: HashMap::new(),
            store,
            metrics,
        }
    }

    /// Add a connection. A second registration under the same id replaces the first.
    pub fn register(&mut self, handle: ConnectionHandle) {
        let id = handle.id.clone();
        if self.members.insert(id.clone(), handle).is_some() {
            warn!(connection_id = %id, "connection registered twice, replacing entry");
        } else {
            self.metrics.connection_opened();
            info!(connection_id = %id, members = self.len(), "connection registered");
        }
    }

    /// Remove a connection if present. Dropping the entry closes its outbound queue.
    pub fn unregister(&mut self, id: &ConnectionId) -> bool {
        match self.members.remove(id) {
            Some(handle) => {
                self.metrics.connection_closed();
                info!(
                    connection_id = %id,
                    username = %handle.identity.username,
                    members = self.len(),
                    "connection unregistered"
                );
                true
            }
            None => {
                debug!(connection_id = %id, "unregister for unknown connection ignored");
                false
            }
        }
    }

    /// Validate, persist, then fan a message out to every registered connection.
    pub fn accept(&mut self, message: ChatMessage) -> Result<DeliveryReport, RelayError> {
        if message.username.is_empty() {
            self.metrics.message_rejected();
            return Err(RelayError::Validation("empty username"));
        }
        if message.content.is_empty() {
            self.metrics.message_rejected();
            return Err(RelayError::Validation("empty content"));
        }

        let user_id = self
            .store
            .get_or_create_user(&message.username)
            .inspect_err(|_| self.metrics.persistence_failed())?;
        self.store
            .save_message(user_id, &message.content)
            .inspect_err(|_| self.metrics.persistence_failed())?;
        self.metrics.message_accepted();

        let outbound = BroadcastMessage::stamped(message, Local::now());
        let payload: Arc<str> = serde_json::to_string(&outbound)?.into();

        let mut report = DeliveryReport::default();
        for handle in self.members.values() {
            match handle.try_deliver(payload.clone()) {
                Ok(()) => report.sent += 1,
                Err(e) if e.is_connection_fatal() => {
                    // queue already closed, the connection is on its way out
                    report.dropped += 1;
                    debug!(connection_id = %handle.id, error = %e, "message dropped for closing connection");
                }
                Err(e) => {
                    report.dropped += 1;
                    warn!(
                        connection_id = %handle.id,
                        username = %handle.identity.username,
                        error = %e,
                        kind = e.error_kind(),
                        "message dropped for connection"
                    );
                }
            }
        }
        self.metrics.record_delivery(report.sent, report.dropped);
        Ok(report)
    }

    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(handle) => self.register(handle),
            HubCommand::Unregister(id) => {
                self.unregister(&id);
            }
            HubCommand::Accept(message) => {
                let username = message.username.clone();
                match self.accept(message) {
                    Ok(report) if report.dropped > 0 => {
                        warn!(%username, sent = report.sent, dropped = report.dropped, "broadcast partially dropped");
                    }
                    Ok(report) => {
                        debug!(%username, sent = report.sent, "broadcast delivered");
                    }
                    Err(e @ RelayError::Persistence(_)) => {
                        error!(%username, error = %e, kind = e.error_kind(), "message dropped");
                    }
                    Err(e) => {
                        warn!(%username, error = %e, kind = e.error_kind(), "message dropped");
                    }
                }
            }
            HubCommand::Members(reply) => {
                let _ = reply.send(self.members());
            }
        }
    }

    /// Drop every registry entry, closing all outbound queues.
    fn close_all(&mut self) {
        let ids = self.members();
        for id in ids {
            self.unregister(&id);
        }
    }
}

/// Cheap-to-clone handle onto the hub task.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
    metrics: Arc<RelayMetrics>,
}

impl Hub {
    /// Spawn the hub task. It runs until every handle is dropped or `shutdown` fires;
    /// on shutdown all registered connections have their queues closed.
    pub fn spawn(
        store: Arc<dyn ChatStore>,
        metrics: Arc<RelayMetrics>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let state = HubState::new(store, metrics.clone());
        let task = tokio::spawn(run_hub(state, rx, shutdown));
        (Self { tx, metrics }, task)
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), RelayError> {
        self.send(HubCommand::Register(handle)).await
    }

    /// Tolerates unknown ids and a stopped hub.
    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.send(HubCommand::Unregister(id)).await;
    }

    /// Hand a message to the hub. Returns once it is queued, not once it is processed.
    pub async fn accept(&self, message: ChatMessage) -> Result<(), RelayError> {
        self.send(HubCommand::Accept(message)).await
    }

    pub async fn members(&self) -> Result<Vec<ConnectionId>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Members(reply)).await?;
        rx.await.map_err(|_| hub_stopped())
    }

    pub async fn connection_count(&self) -> usize {
        self.members().await.map(|m| m.len()).unwrap_or(0)
    }

    async fn send(&self, command: HubCommand) -> Result<(), RelayError> {
        self.tx.send(command).await.map_err(|_| hub_stopped())
    }
}

fn hub_stopped() -> RelayError {
    RelayError::Transport("hub stopped".into())
}

#[instrument(name = "hub", skip_all)]
async fn run_hub(
    mut state: HubState,
    mut rx: mpsc::Receiver<HubCommand>,
    shutdown: CancellationToken,
) {
    info!("hub started");
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => state.handle(command),
                None => break,
            },
        }
    }
    state.close_all();
    info!("hub stopped");
}
