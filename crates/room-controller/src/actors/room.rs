//! `RoomActor` - per-room actor that owns the peer set and the room's router.
//!
//! Each `RoomActor`:
//! - Owns every peer in the room, keyed by connection id
//! - Owns each peer's transports, producers and consumers (ids only; the
//!   media state lives on the worker)
//! - Enforces capacity and per-peer ownership of transports
//! - Fans room events out through each peer's `ConnectionActorHandle`
//!
//! # Peer teardown
//!
//! Leaving closes the peer's consumers, then producers, then transports.
//! A failing close is logged and counted, never propagated. Consumers of
//! other peers whose producer disappeared are then closed and their owners
//! told via `consumerClosed`. Remaining peers receive `peerLeft` once.

use super::connection::ConnectionActorHandle;
use super::messages::{
    Audience, JoinOutcome, LeaveOutcome, PeerInfo, PeerState, ProducerInfo, RoomMessage,
    RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::auth::Identity;
use crate::errors::{NegotiationError, RcError, Resource};
use crate::media::rtp::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters,
    TransportDirection, TransportId,
};
use crate::media::{ConsumerCreated, RouterHandle, TransportCreated};
use crate::observability::metrics as prom;
use crate::signaling::protocol::{
    ConsumerClosed, HandState, MuteCommand, NewProducer, PeerLeft, ServerEvent,
};

use common::types::{ConnectionId, RoomKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_key: RoomKey,
    instance_id: u64,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_key(&self) -> &RoomKey {
        &self.room_key
    }

    /// Distinguishes this room from earlier or later rooms with the same key.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, RcError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(&self.sender, build(tx))
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    async fn post(&self, message: RoomMessage) -> Result<(), RcError> {
        self.mailbox
            .send(&self.sender, message)
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))
    }

    /// Add a peer for `connection_id`.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        identity: Identity,
        connection: ConnectionActorHandle,
    ) -> Result<JoinOutcome, RcError> {
        self.request(|respond_to| RoomMessage::Join {
            connection_id,
            identity,
            connection,
            respond_to,
        })
        .await?
    }

    /// Remove the peer and release everything it owns.
    pub async fn leave(&self, connection_id: ConnectionId) -> Result<LeaveOutcome, RcError> {
        self.request(|respond_to| RoomMessage::Leave {
            connection_id,
            respond_to,
        })
        .await?
    }

    pub async fn create_transport(
        &self,
        connection_id: ConnectionId,
        direction: TransportDirection,
    ) -> Result<TransportCreated, RcError> {
        self.request(|respond_to| RoomMessage::CreateTransport {
            connection_id,
            direction,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RcError> {
        self.request(|respond_to| RoomMessage::ConnectTransport {
            connection_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn produce(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RcError> {
        self.request(|respond_to| RoomMessage::Produce {
            connection_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn consume(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerCreated, RcError> {
        self.request(|respond_to| RoomMessage::Consume {
            connection_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    /// Fan out an event. Fire-and-forget.
    pub async fn broadcast(
        &self,
        sender: ConnectionId,
        event: ServerEvent,
        audience: Audience,
    ) -> Result<(), RcError> {
        self.post(RoomMessage::Broadcast {
            sender,
            event,
            audience,
        })
        .await
    }

    pub async fn set_hand_raised(
        &self,
        connection_id: ConnectionId,
        raised: bool,
    ) -> Result<(), RcError> {
        self.post(RoomMessage::SetHandRaised {
            connection_id,
            raised,
        })
        .await
    }

    pub async fn mute_all(&self, connection_id: ConnectionId) -> Result<(), RcError> {
        self.request(|respond_to| RoomMessage::MuteAll {
            connection_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_state(&self) -> Result<RoomState, RcError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    /// Close the room if it has no peers. Returns whether it closed.
    pub async fn close_if_empty(&self) -> Result<bool, RcError> {
        self.request(|respond_to| RoomMessage::CloseIfEmpty { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[derive(Debug)]
struct PeerTransport {
    direction: TransportDirection,
    connected: bool,
}

#[derive(Debug)]
struct PeerProducer {
    kind: MediaKind,
}

#[derive(Debug)]
struct PeerConsumer {
    producer_id: ProducerId,
}

/// One connected participant and the media resources it owns.
#[derive(Debug)]
struct Peer {
    identity: Identity,
    connection: ConnectionActorHandle,
    state: PeerState,
    hand_raised: bool,
    transports: HashMap<TransportId, PeerTransport>,
    producers: HashMap<ProducerId, PeerProducer>,
    consumers: HashMap<ConsumerId, PeerConsumer>,
}

impl Peer {
    fn to_info(&self, connection_id: ConnectionId) -> PeerInfo {
        PeerInfo {
            peer_id: connection_id.to_string(),
            participant_id: self.identity.participant_id.clone(),
            display_name: self.identity.display_name.clone(),
            role: self.identity.role,
            hand_raised: self.hand_raised,
            producers: self
                .producers
                .iter()
                .map(|(id, p)| ProducerInfo {
                    producer_id: *id,
                    kind: p.kind,
                })
                .collect(),
        }
    }

    fn hand_state(&self, connection_id: ConnectionId) -> HandState {
        HandState {
            peer_id: connection_id.to_string(),
            participant_id: self.identity.participant_id.clone(),
            display_name: self.identity.display_name.clone(),
        }
    }

    /// Look up a transport this peer owns, checking direction and state.
    fn usable_transport(
        &self,
        transport_id: TransportId,
        direction: TransportDirection,
    ) -> Result<(), RcError> {
        let transport = self
            .transports
            .get(&transport_id)
            .ok_or(RcError::NotFound(Resource::Transport))?;
        if transport.direction != direction {
            return Err(NegotiationError::WrongDirection.into());
        }
        if !transport.connected {
            return Err(NegotiationError::TransportNotConnected.into());
        }
        Ok(())
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_key: RoomKey,
    instance_id: u64,
    capacity: usize,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    router: RouterHandle,
    peers: HashMap<ConnectionId, Peer>,
    /// Set once the router is released; the actor exits after responding.
    closed: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActor {
    /// Spawn a new room actor over an already-created router.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_key: RoomKey,
        instance_id: u64,
        capacity: usize,
        router: RouterHandle,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let mailbox = MailboxMonitor::shared(ActorType::Room, room_key.to_string());

        let actor = Self {
            room_key: room_key.clone(),
            instance_id,
            capacity,
            receiver,
            cancel_token: cancel_token.clone(),
            router,
            peers: HashMap::new(),
            closed: false,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_key,
            instance_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "rc.actor.room",
        fields(room_key = %self.room_key, instance_id = self.instance_id)
    )]
    async fn run(mut self) {
        info!(
            target: "rc.actor.room",
            room_key = %self.room_key,
            instance_id = self.instance_id,
            worker_id = self.router.worker_id(),
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message).await;
                            if self.closed {
                                break;
                            }
                        }
                        None => {
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.room",
            room_key = %self.room_key,
            instance_id = self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                connection_id,
                identity,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(connection_id, identity, connection);
                let joined = result.is_ok();
                let _ = respond_to.send(result);
                if joined {
                    self.complete_join(connection_id);
                }
            }

            RoomMessage::Leave {
                connection_id,
                respond_to,
            } => {
                let result = self.handle_leave(connection_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CreateTransport {
                connection_id,
                direction,
                respond_to,
            } => {
                let result = self.handle_create_transport(connection_id, direction).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                connection_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_connect_transport(connection_id, transport_id, dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                connection_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_produce(connection_id, transport_id, kind, rtp_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Consume {
                connection_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self
                    .handle_consume(connection_id, transport_id, producer_id, rtp_capabilities)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Broadcast {
                sender,
                event,
                audience,
            } => {
                self.handle_broadcast(sender, event, &audience);
            }

            RoomMessage::SetHandRaised {
                connection_id,
                raised,
            } => {
                self.handle_set_hand_raised(connection_id, raised);
            }

            RoomMessage::MuteAll {
                connection_id,
                respond_to,
            } => {
                let result = self.handle_mute_all(connection_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                let closed = self.handle_close_if_empty().await;
                let _ = respond_to.send(closed);
            }
        }
    }

    fn handle_join(
        &mut self,
        connection_id: ConnectionId,
        identity: Identity,
        connection: ConnectionActorHandle,
    ) -> Result<JoinOutcome, RcError> {
        if self.peers.contains_key(&connection_id) {
            return Err(RcError::Conflict(
                "Already joined this room from this connection".to_string(),
            ));
        }
        if self.peers.len() >= self.capacity {
            debug!(
                target: "rc.actor.room",
                room_key = %self.room_key,
                capacity = self.capacity,
                "Join rejected, room full"
            );
            return Err(RcError::RoomFull);
        }

        let existing_peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|(id, peer)| peer.to_info(*id))
            .collect();

        self.peers.insert(
            connection_id,
            Peer {
                identity,
                connection,
                state: PeerState::Joining,
                hand_raised: false,
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
            },
        );
        self.metrics.peer_joined();

        Ok(JoinOutcome {
            peer_id: connection_id.to_string(),
            capabilities: self.router.rtp_capabilities().clone(),
            existing_peers,
        })
    }

    /// The join acknowledgment is on its way; announce the peer.
    fn complete_join(&mut self, connection_id: ConnectionId) {
        let Some(peer) = self.peers.get_mut(&connection_id) else {
            return;
        };
        peer.state = PeerState::Joined;
        let info = peer.to_info(connection_id);

        info!(
            target: "rc.actor.room",
            room_key = %self.room_key,
            connection_id = %connection_id,
            participant_id = %info.participant_id,
            role = info.role.as_str(),
            peers = self.peers.len(),
            "Peer joined"
        );

        self.notify_others(connection_id, &ServerEvent::PeerJoined(info));
    }

    async fn handle_leave(&mut self, connection_id: ConnectionId) -> Result<LeaveOutcome, RcError> {
        let Some(peer) = self.peers.get_mut(&connection_id) else {
            return Err(RcError::NotFound(Resource::Peer));
        };
        peer.state = PeerState::Leaving;

        if let Some(peer) = self.peers.remove(&connection_id) {
            self.teardown_peer(connection_id, peer).await;
        }

        Ok(LeaveOutcome {
            remaining: self.peers.len(),
        })
    }

    /// Release everything a departing peer owns and tell the others.
    async fn teardown_peer(&mut self, connection_id: ConnectionId, peer: Peer) {
        for consumer_id in peer.consumers.keys() {
            if let Err(e) = self.router.close_consumer(*consumer_id).await {
                self.teardown_failed("consumer", &e);
            }
        }

        let removed_producers: HashSet<ProducerId> = peer.producers.keys().copied().collect();
        for producer_id in &removed_producers {
            if let Err(e) = self.router.close_producer(*producer_id).await {
                self.teardown_failed("producer", &e);
            }
        }

        for transport_id in peer.transports.keys() {
            if let Err(e) = self.router.close_transport(*transport_id).await {
                self.teardown_failed("transport", &e);
            }
        }

        let orphaned = self.close_orphaned_consumers(&removed_producers).await;

        let gone = PeerState::Gone;
        info!(
            target: "rc.actor.room",
            room_key = %self.room_key,
            connection_id = %connection_id,
            participant_id = %peer.identity.participant_id,
            state = ?gone,
            transports = peer.transports.len(),
            producers = removed_producers.len(),
            consumers = peer.consumers.len(),
            orphaned_consumers = orphaned,
            remaining = self.peers.len(),
            "Peer left"
        );
        self.metrics.peer_left();

        let event = ServerEvent::PeerLeft(PeerLeft {
            peer_id: connection_id.to_string(),
            participant_id: peer.identity.participant_id,
        });
        for other in self.peers.values() {
            other.connection.notify(event.clone());
        }
    }

    /// Close other peers' consumers of vanished producers. Returns how many.
    async fn close_orphaned_consumers(&mut self, removed: &HashSet<ProducerId>) -> usize {
        if removed.is_empty() {
            return 0;
        }

        let mut closed = Vec::new();
        for (owner, peer) in &mut self.peers {
            let orphans: Vec<ConsumerId> = peer
                .consumers
                .iter()
                .filter(|(_, c)| removed.contains(&c.producer_id))
                .map(|(id, _)| *id)
                .collect();
            for consumer_id in orphans {
                if let Some(consumer) = peer.consumers.remove(&consumer_id) {
                    closed.push((*owner, consumer_id, consumer.producer_id));
                }
            }
        }

        for (owner, consumer_id, producer_id) in &closed {
            // Usually already gone with its producer; close is idempotent.
            if let Err(e) = self.router.close_consumer(*consumer_id).await {
                self.teardown_failed("consumer", &e);
            }
            if let Some(peer) = self.peers.get(owner) {
                peer.connection
                    .notify(ServerEvent::ConsumerClosed(ConsumerClosed {
                        consumer_id: *consumer_id,
                        producer_id: *producer_id,
                    }));
            }
        }
        closed.len()
    }

    fn teardown_failed(&self, resource: &'static str, error: &RcError) {
        warn!(
            target: "rc.actor.room",
            room_key = %self.room_key,
            resource,
            error = %error,
            "Close failed during peer teardown, continuing"
        );
        prom::record_teardown_failure(resource);
    }

    async fn handle_create_transport(
        &mut self,
        connection_id: ConnectionId,
        direction: TransportDirection,
    ) -> Result<TransportCreated, RcError> {
        if !self.peers.contains_key(&connection_id) {
            return Err(RcError::NotFound(Resource::Peer));
        }

        let created = self.router.create_webrtc_transport().await?;

        match self.peers.get_mut(&connection_id) {
            Some(peer) => {
                peer.transports.insert(
                    created.id,
                    PeerTransport {
                        direction,
                        connected: false,
                    },
                );
                debug!(
                    target: "rc.actor.room",
                    room_key = %self.room_key,
                    connection_id = %connection_id,
                    transport_id = %created.id,
                    direction = direction.as_str(),
                    "Transport created"
                );
                Ok(created)
            }
            None => {
                // Peer vanished while the worker call was in flight.
                let _ = self.router.close_transport(created.id).await;
                Err(RcError::NotFound(Resource::Peer))
            }
        }
    }

    async fn handle_connect_transport(
        &mut self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RcError> {
        let peer = self
            .peers
            .get(&connection_id)
            .ok_or(RcError::NotFound(Resource::Peer))?;
        let transport = peer
            .transports
            .get(&transport_id)
            .ok_or(RcError::NotFound(Resource::Transport))?;
        if transport.connected {
            return Err(NegotiationError::TransportAlreadyConnected.into());
        }

        self.router
            .connect_transport(transport_id, dtls_parameters)
            .await?;

        if let Some(transport) = self
            .peers
            .get_mut(&connection_id)
            .and_then(|p| p.transports.get_mut(&transport_id))
        {
            transport.connected = true;
        }
        Ok(())
    }

    async fn handle_produce(
        &mut self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RcError> {
        self.peers
            .get(&connection_id)
            .ok_or(RcError::NotFound(Resource::Peer))?
            .usable_transport(transport_id, TransportDirection::Send)?;

        let producer_id = self
            .router
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        let Some(peer) = self.peers.get_mut(&connection_id) else {
            let _ = self.router.close_producer(producer_id).await;
            return Err(RcError::NotFound(Resource::Peer));
        };
        peer.producers.insert(producer_id, PeerProducer { kind });
        let participant_id = peer.identity.participant_id.clone();

        debug!(
            target: "rc.actor.room",
            room_key = %self.room_key,
            connection_id = %connection_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );

        self.notify_others(
            connection_id,
            &ServerEvent::NewProducer(NewProducer {
                producer_id,
                peer_id: connection_id.to_string(),
                participant_id,
                kind,
            }),
        );

        Ok(producer_id)
    }

    async fn handle_consume(
        &mut self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerCreated, RcError> {
        self.peers
            .get(&connection_id)
            .ok_or(RcError::NotFound(Resource::Peer))?
            .usable_transport(transport_id, TransportDirection::Recv)?;

        if self.find_producer(producer_id).is_none() {
            return Err(RcError::NotFound(Resource::Producer));
        }
        if !self
            .router
            .can_consume(producer_id, &rtp_capabilities)
            .await?
        {
            return Err(NegotiationError::IncompatibleCapabilities.into());
        }

        let consumer = self
            .router
            .consume(transport_id, producer_id, rtp_capabilities)
            .await?;

        // Either side may have left while the worker call was in flight.
        let producer_alive = self.find_producer(producer_id).is_some();
        match self.peers.get_mut(&connection_id) {
            Some(peer) if producer_alive => {
                peer.consumers
                    .insert(consumer.id, PeerConsumer { producer_id });
                Ok(consumer)
            }
            Some(_) => {
                let _ = self.router.close_consumer(consumer.id).await;
                Err(RcError::NotFound(Resource::Producer))
            }
            None => {
                let _ = self.router.close_consumer(consumer.id).await;
                Err(RcError::NotFound(Resource::Peer))
            }
        }
    }

    /// Owner of a producer, by linear scan.
    fn find_producer(&self, producer_id: ProducerId) -> Option<ConnectionId> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.producers.contains_key(&producer_id))
            .map(|(id, _)| *id)
    }

    fn handle_broadcast(&self, sender: ConnectionId, event: ServerEvent, audience: &Audience) {
        if !self.peers.contains_key(&sender) {
            debug!(
                target: "rc.actor.room",
                room_key = %self.room_key,
                connection_id = %sender,
                event = event.name(),
                "Broadcast from non-member ignored"
            );
            return;
        }

        for (id, peer) in &self.peers {
            let deliver = match audience {
                Audience::All => true,
                Audience::Others => *id != sender,
                Audience::Private(recipient) => {
                    *id == sender || &peer.identity.participant_id == recipient
                }
            };
            if deliver {
                peer.connection.notify(event.clone());
            }
        }
    }

    fn handle_set_hand_raised(&mut self, connection_id: ConnectionId, raised: bool) {
        let Some(peer) = self.peers.get_mut(&connection_id) else {
            return;
        };
        if peer.hand_raised == raised {
            return;
        }
        peer.hand_raised = raised;

        let state = peer.hand_state(connection_id);
        let event = if raised {
            ServerEvent::HandRaised(state)
        } else {
            ServerEvent::HandLowered(state)
        };
        self.notify_others(connection_id, &event);
    }

    fn handle_mute_all(&self, connection_id: ConnectionId) -> Result<(), RcError> {
        let peer = self
            .peers
            .get(&connection_id)
            .ok_or(RcError::NotFound(Resource::Peer))?;
        if !peer.identity.role.is_instructor() {
            return Err(RcError::PermissionDenied(
                "Only instructors can mute everyone".to_string(),
            ));
        }

        self.notify_others(
            connection_id,
            &ServerEvent::MuteCommand(MuteCommand {
                by: peer.identity.participant_id.clone(),
            }),
        );
        Ok(())
    }

    fn notify_others(&self, except: ConnectionId, event: &ServerEvent) {
        for (id, peer) in &self.peers {
            if *id != except {
                peer.connection.notify(event.clone());
            }
        }
    }

    fn get_state(&self) -> RoomState {
        RoomState {
            room_key: self.room_key.clone(),
            instance_id: self.instance_id,
            capacity: self.capacity,
            peers: self
                .peers
                .iter()
                .map(|(id, peer)| peer.to_info(*id))
                .collect(),
            peer_states: self
                .peers
                .iter()
                .map(|(id, peer)| (id.to_string(), peer.state))
                .collect(),
        }
    }

    async fn handle_close_if_empty(&mut self) -> bool {
        if !self.peers.is_empty() {
            return false;
        }
        self.release_router().await;
        true
    }

    async fn release_router(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.router.close().await {
            warn!(
                target: "rc.actor.room",
                room_key = %self.room_key,
                error = %e,
                "Router close failed"
            );
            prom::record_teardown_failure("router");
        }
        debug!(
            target: "rc.actor.room",
            room_key = %self.room_key,
            router_id = %self.router.id(),
            "Router released"
        );
    }

    /// Force-close: drop every peer and release the router.
    async fn graceful_shutdown(&mut self) {
        let peers = self.peers.len();
        for _ in self.peers.drain() {
            self.metrics.peer_left();
        }
        // The router close cascades to every transport, producer and consumer.
        self.release_router().await;

        info!(
            target: "rc.actor.room",
            room_key = %self.room_key,
            peers_dropped = peers,
            "Room shut down"
        );
    }
}
