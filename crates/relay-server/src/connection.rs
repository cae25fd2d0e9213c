//! Per-connection lifecycle: one inbound pump reading frames into the hub,
//! one outbound pump draining the connection's queue onto the wire.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use relay_core::{ChatMessage, ConnectionId, Identity, RelayError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::LivenessTimings;
use crate::hub::Hub;

/// Registry entry for one live connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    outbound: mpsc::Sender<Arc<str>>,
}

impl ConnectionHandle {
    /// Non-blocking enqueue onto the connection's outbound queue.
    pub fn try_deliver(&self, payload: Arc<str>) -> Result<(), RelayError> {
        self.outbound.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::DeliveryBackpressure,
            TrySendError::Closed(_) => RelayError::Transport("outbound queue closed".into()),
        })
    }
}

/// A freshly authenticated connection: the handle goes to the hub, the
/// receiver to the outbound pump.
pub struct Connection {
    pub handle: ConnectionHandle,
    pub outbound: mpsc::Receiver<Arc<str>>,
}

impl Connection {
    pub fn new(identity: Identity, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            handle: ConnectionHandle {
                id: ConnectionId::new(),
                identity,
                outbound: tx,
            },
            outbound: rx,
        }
    }
}

/// Why a pump stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PumpExit {
    // inbound
    RemoteClosed,
    ReadError(String),
    TimedOut,
    HubGone,
    /// Reading abandoned because the outbound pump stopped first.
    WriterStopped,
    // outbound
    QueueClosed,
    WriteFailed(String),
    WriteTimedOut,
}

/// How both directions of a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionExit {
    pub inbound: PumpExit,
    pub outbound: PumpExit,
}

/// Drive one upgraded socket until both directions have stopped.
pub async fn run_connection(
    socket: WebSocket,
    identity: Identity,
    hub: Hub,
    timings: LivenessTimings,
    capacity: usize,
) {
    let conn = Connection::new(identity, capacity);
    let span = info_span!(
        "connection",
        connection_id = %conn.handle.id,
        username = %conn.handle.identity.username,
        user_id = %conn.handle.identity.user_id,
    );

    async move {
        let (sink, stream) = socket.split();
        if let Some(exit) = drive_connection(stream, sink, conn, &hub, timings).await {
            info!(inbound = ?exit.inbound, outbound = ?exit.outbound, "client disconnected");
        }
    }
    .instrument(span)
    .await
}

/// Register `conn`, run both pumps, and unregister exactly once when either
/// side stops. A dead writer ends the read side too, so a peer that keeps
/// sending but never reads cannot linger in the registry. Both halves are
/// dropped on return, which closes the transport.
///
/// Returns `None` when the hub refused the registration.
pub async fn drive_connection<St, Si, E>(
    stream: St,
    sink: Si,
    conn: Connection,
    hub: &Hub,
    timings: LivenessTimings,
) -> Option<ConnectionExit>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display + Send,
{
    let Connection { handle, outbound } = conn;
    let id = handle.id.clone();
    if hub.register(handle).await.is_err() {
        warn!("hub stopped, refusing connection");
        return None;
    }
    info!("client connected");

    let mut writer = tokio::spawn(outbound_pump(sink, outbound, timings).in_current_span());
    let reader = inbound_pump(stream, hub, timings.pong_wait);
    tokio::pin!(reader);

    let exit = tokio::select! {
        inbound = &mut reader => {
            hub.unregister(id).await;
            ConnectionExit { inbound, outbound: joined(writer.await) }
        }
        outbound = &mut writer => {
            let outbound = joined(outbound);
            debug!(?outbound, "outbound pump stopped first, abandoning reads");
            hub.unregister(id).await;
            ConnectionExit { inbound: PumpExit::WriterStopped, outbound }
        }
    };
    Some(exit)
}

fn joined(result: Result<PumpExit, tokio::task::JoinError>) -> PumpExit {
    result.unwrap_or_else(|e| PumpExit::WriteFailed(e.to_string()))
}

/// Read frames until the peer goes away, handing chat messages to the hub.
///
/// Any frame resets the idle deadline. Undecodable frames are dropped.
pub async fn inbound_pump<S, E>(mut stream: S, hub: &Hub, pong_wait: Duration) -> PumpExit
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = match timeout(pong_wait, stream.next()).await {
            Err(_) => return PumpExit::TimedOut,
            Ok(None) => return PumpExit::RemoteClosed,
            Ok(Some(Err(e))) => return PumpExit::ReadError(e.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };

        let bytes: &[u8] = match &frame {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(data) => data.as_ref(),
            Message::Close(_) => return PumpExit::RemoteClosed,
            Message::Ping(_) | Message::Pong(_) => {
                trace!("liveness frame");
                continue;
            }
        };

        match ChatMessage::decode(bytes) {
            Ok(message) => {
                debug!(author = %message.username, len = message.content.len(), "frame decoded");
                if hub.accept(message).await.is_err() {
                    return PumpExit::HubGone;
                }
            }
            Err(e) => {
                hub.metrics().decode_failed();
                let e = RelayError::from(e);
                warn!(error = %e, kind = e.error_kind(), "dropping malformed frame");
            }
        }
    }
}

/// Drain the outbound queue to the wire and ping on a fixed cadence.
///
/// Stops on the first failed or overdue write. A closed queue gets a Close
/// frame before stopping.
pub async fn outbound_pump<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Arc<str>>,
    timings: LivenessTimings,
) -> PumpExit
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = interval(timings.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            item = queue.recv() => match item {
                Some(payload) => Message::Text(payload.as_ref().into()),
                None => {
                    let _ = timeout(timings.write_wait, sink.send(Message::Close(None))).await;
                    return PumpExit::QueueClosed;
                }
            },
            _ = ping.tick() => Message::Ping(Default::default()),
        };

        match timeout(timings.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "write failed");
                return PumpExit::WriteFailed(e.to_string());
            }
            Err(_) => {
                warn!(write_wait = ?timings.write_wait, "write timed out");
                return PumpExit::WriteTimedOut;
            }
        }
    }
}
