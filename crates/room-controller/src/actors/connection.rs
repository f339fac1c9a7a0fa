//! `ConnectionActor` - per-signaling-connection outbound queue.
//!
//! Rooms push events and the session pushes responses through the same
//! mailbox, so a client sees them in the order they were produced. The
//! actor forwards each frame to the socket writer.
//!
//! # Backpressure
//!
//! Events use `try_send`: when a slow client's mailbox is full the event is
//! dropped and counted. Responses wait for space and are never dropped.

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::errors::RcError;
use crate::observability::metrics as prom;
use crate::signaling::protocol::{ResponseFrame, ServerEvent, ServerFrame};

use common::types::{ConnectionId, ParticipantId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for the connection mailbox.
pub const CONNECTION_CHANNEL_BUFFER: usize = 256;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
    participant_id: ParticipantId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Queue an event for the client. Returns `false` if it was dropped.
    pub fn notify(&self, event: ServerEvent) -> bool {
        let name = event.name();
        match self.mailbox.try_send(
            &self.sender,
            ConnectionMessage::Deliver(ServerFrame::Event(event)),
        ) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                prom::record_event_dropped();
                debug!(
                    target: "rc.actor.connection",
                    connection_id = %self.connection_id,
                    event = name,
                    "Event dropped, client mailbox full"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "rc.actor.connection",
                    connection_id = %self.connection_id,
                    event = name,
                    "Event for closed connection discarded"
                );
                false
            }
        }
    }

    /// Queue a response, waiting for mailbox space.
    pub async fn respond(&self, response: ResponseFrame) -> Result<(), RcError> {
        self.mailbox
            .send(
                &self.sender,
                ConnectionMessage::Deliver(ServerFrame::Response(response)),
            )
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))
    }

    /// Stop the actor; the socket writer sees end of stream and closes.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    participant_id: ParticipantId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    /// Frames for the socket writer.
    outbound: mpsc::Sender<ServerFrame>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: ConnectionId,
        participant_id: ParticipantId,
        outbound: mpsc::Sender<ServerFrame>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        Self::spawn_with_capacity(
            connection_id,
            participant_id,
            outbound,
            cancel_token,
            metrics,
            CONNECTION_CHANNEL_BUFFER,
        )
    }

    pub(crate) fn spawn_with_capacity(
        connection_id: ConnectionId,
        participant_id: ParticipantId,
        outbound: mpsc::Sender<ServerFrame>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        capacity: usize,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let mailbox = MailboxMonitor::shared(ActorType::Connection, connection_id.to_string());

        let actor = Self {
            connection_id,
            participant_id: participant_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            outbound,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            participant_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "rc.actor.connection",
        fields(connection_id = %self.connection_id, participant_id = %self.participant_id)
    )]
    async fn run(mut self) {
        self.metrics.connection_opened();
        debug!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.flush_pending();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ConnectionMessage::Deliver(frame)) => {
                            self.mailbox.record_dequeue();
                            if self.outbound.send(frame).await.is_err() {
                                debug!(
                                    target: "rc.actor.connection",
                                    connection_id = %self.connection_id,
                                    "Socket writer gone, exiting"
                                );
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.metrics.connection_closed();
        info!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Best-effort hand-off of frames already queued when cancelled.
    fn flush_pending(&mut self) {
        while let Ok(ConnectionMessage::Deliver(frame)) = self.receiver.try_recv() {
            self.mailbox.record_dequeue();
            if self.outbound.try_send(frame).is_err() {
                break;
            }
        }
    }
}
