//! Per-connection signaling session.
//!
//! One session exists per authenticated WebSocket. It tracks which rooms the
//! connection joined and which room each of its transports lives in, and
//! turns client frames into room actor calls. Frames are handled strictly in
//! arrival order.
//!
//! # Admission
//!
//! The room key is resolved through the course directory on every join.
//! Instructors are admitted to any existing room. Everyone else must be
//! enrolled, and the session must be live.

use super::protocol::{
    ClientEvent, ClientFrame, ConsumeResponse, CreateTransportResponse, GetMessagesData,
    Inbound, JoinResponse, MessagesResponse, OkResponse, ProduceResponse, Request,
    ResponseFrame, ServerEvent, Typing, to_data,
};
use super::SignalingState;
use crate::actors::{
    Audience, ConnectionActorHandle, LeaveOutcome, RoomActorHandle, RoomRegistryHandle,
};
use crate::auth::Identity;
use crate::chat::{normalize_text, ChatMessage, NewChatMessage};
use crate::directory::SessionStatus;
use crate::errors::{RcError, Resource};
use crate::media::rtp::TransportId;
use crate::observability::metrics as prom;

use common::types::{ConnectionId, ParticipantId, RoomKey};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Messages returned by `getMessages` when no limit is given.
pub const DEFAULT_MESSAGES_LIMIT: usize = 50;

/// Upper bound for `getMessages`.
pub const MAX_MESSAGES_LIMIT: usize = 200;

pub struct SignalingSession {
    state: Arc<SignalingState>,
    identity: Identity,
    connection: ConnectionActorHandle,
    memberships: HashMap<RoomKey, RoomActorHandle>,
    /// Room of every transport this connection created.
    transports: HashMap<TransportId, RoomKey>,
}

impl SignalingSession {
    #[must_use]
    pub fn new(
        state: Arc<SignalingState>,
        identity: Identity,
        connection: ConnectionActorHandle,
    ) -> Self {
        Self {
            state,
            identity,
            connection,
            memberships: HashMap::new(),
            transports: HashMap::new(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id()
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn is_member(&self, room_key: &RoomKey) -> bool {
        self.memberships.contains_key(room_key)
    }

    /// Handle one text frame from the socket.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientFrame::parse(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                // Answer if the frame at least carried an id.
                let id = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64));
                match id {
                    Some(id) => self.respond(ResponseFrame::failure(id, &e)).await,
                    None => debug!(
                        target: "rc.signaling",
                        connection_id = %self.connection_id(),
                        error = %e,
                        "Dropping malformed frame"
                    ),
                }
            }
        }
    }

    pub async fn handle_frame(&mut self, frame: ClientFrame) {
        let inbound = Inbound::parse(&frame.method, frame.data);

        match (frame.id, inbound) {
            (Some(id), Ok(Inbound::Request(request))) => self.handle_request(id, request).await,
            (None, Ok(Inbound::Request(request))) => {
                warn!(
                    target: "rc.signaling",
                    connection_id = %self.connection_id(),
                    method = request.method(),
                    "Request without id dropped"
                );
            }
            (id, Ok(Inbound::Event(event))) => {
                let method = event.method();
                let result = self.handle_event(event).await;
                match id {
                    Some(id) => {
                        let response = match result.and_then(|()| to_data(&OkResponse::OK)) {
                            Ok(data) => ResponseFrame::success(id, data),
                            Err(e) => ResponseFrame::failure(id, &e),
                        };
                        self.respond(response).await;
                    }
                    None => {
                        if let Err(e) = result {
                            debug!(
                                target: "rc.signaling",
                                connection_id = %self.connection_id(),
                                method,
                                error = %e,
                                "Event rejected"
                            );
                        }
                    }
                }
            }
            (Some(id), Err(e)) => self.respond(ResponseFrame::failure(id, &e)).await,
            (None, Err(e)) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %self.connection_id(),
                    method = %frame.method,
                    error = %e,
                    "Dropping invalid event"
                );
            }
        }
    }

    #[instrument(
        skip_all,
        name = "rc.signaling.request",
        fields(connection_id = %self.connection_id(), method = request.method(), id)
    )]
    async fn handle_request(&mut self, id: u64, request: Request) {
        let method = request.method();
        let started = Instant::now();
        let join_key = match &request {
            Request::Join(room) => room.key().ok(),
            _ => None,
        };

        let outcome = tokio::time::timeout(self.state.request_timeout, self.dispatch(request)).await;

        let (status, response) = match outcome {
            Ok(Ok(data)) => ("success", ResponseFrame::success(id, data)),
            Ok(Err(e)) => {
                debug!(
                    target: "rc.signaling",
                    method,
                    code = e.code(),
                    error = %e,
                    "Request failed"
                );
                ("error", ResponseFrame::failure(id, &e))
            }
            Err(_) => {
                warn!(target: "rc.signaling", method, "Request timed out");
                if let Some(room_key) = join_key {
                    self.undo_join(&room_key).await;
                }
                (
                    "timeout",
                    ResponseFrame::failure(id, &RcError::Timeout(method.to_string())),
                )
            }
        };

        prom::record_signaling_request(method, status, started.elapsed());
        self.respond(response).await;
    }

    async fn dispatch(&mut self, request: Request) -> Result<Value, RcError> {
        match request {
            Request::Join(room) => {
                let room_key = room.key()?;
                to_data(&self.join(room_key).await?)
            }

            Request::CreateTransport(data) => {
                let room_key = super::protocol::parse_room_key(&data.room_key)?;
                let room = self.member_room(&room_key)?;
                let created = room
                    .create_transport(self.connection_id(), data.direction)
                    .await?;
                self.transports.insert(created.id, room_key);
                to_data(&CreateTransportResponse {
                    transport_id: created.id,
                    ice_params: created.ice_parameters,
                    ice_candidates: created.ice_candidates,
                    dtls_params: created.dtls_parameters,
                })
            }

            Request::ConnectTransport(data) => {
                let room = self.transport_room(data.transport_id)?;
                room.connect_transport(self.connection_id(), data.transport_id, data.dtls_params)
                    .await?;
                to_data(&OkResponse::OK)
            }

            Request::Produce(data) => {
                let room = self.transport_room(data.transport_id)?;
                let producer_id = room
                    .produce(
                        self.connection_id(),
                        data.transport_id,
                        data.kind,
                        data.rtp_params,
                    )
                    .await?;
                to_data(&ProduceResponse { producer_id })
            }

            Request::Consume(data) => {
                let room = self.transport_room(data.transport_id)?;
                let consumer = room
                    .consume(
                        self.connection_id(),
                        data.transport_id,
                        data.producer_id,
                        data.rtp_capabilities,
                    )
                    .await?;
                to_data(&ConsumeResponse {
                    consumer_id: consumer.id,
                    producer_id: consumer.producer_id,
                    kind: consumer.kind,
                    rtp_params: consumer.rtp_parameters,
                })
            }

            Request::Leave(room) => {
                let room_key = room.key()?;
                self.leave(&room_key).await?;
                to_data(&OkResponse::OK)
            }

            Request::GetMessages(data) => to_data(&self.get_messages(data).await?),

            Request::MuteAll(room) => {
                let room_key = room.key()?;
                self.member_room(&room_key)?
                    .mute_all(self.connection_id())
                    .await?;
                to_data(&OkResponse::OK)
            }
        }
    }

    async fn join(&mut self, room_key: RoomKey) -> Result<JoinResponse, RcError> {
        if self.memberships.contains_key(&room_key) {
            return Err(RcError::Conflict(
                "Already joined this room from this connection".to_string(),
            ));
        }

        self.admit(&room_key).await?;

        let lease = self.state.registry.acquire(room_key.clone()).await?;
        let outcome = lease
            .room()
            .join(
                self.connection_id(),
                self.identity.clone(),
                self.connection.clone(),
            )
            .await?;
        self.memberships
            .insert(room_key.clone(), lease.room().clone());
        drop(lease);

        info!(
            target: "rc.signaling",
            connection_id = %self.connection_id(),
            room_key = %room_key,
            role = self.identity.role.as_str(),
            existing_peers = outcome.existing_peers.len(),
            "Joined room"
        );

        let chat_history = self.chat_history(&room_key).await;

        Ok(JoinResponse {
            peer_id: outcome.peer_id,
            capabilities: outcome.capabilities,
            existing_peers: outcome.existing_peers,
            chat_history,
        })
    }

    /// Admission check, counted by outcome.
    async fn admit(&self, room_key: &RoomKey) -> Result<(), RcError> {
        let result = self.check_admission(room_key).await;
        let outcome = match &result {
            Ok(()) => "admitted",
            Err(e) => e.code(),
        };
        prom::record_admission(outcome);
        result
    }

    async fn check_admission(&self, room_key: &RoomKey) -> Result<(), RcError> {
        let session = self
            .state
            .directory
            .resolve_room(room_key)
            .await?
            .ok_or(RcError::NotFound(Resource::Room))?;

        if self.identity.role.is_instructor() {
            return Ok(());
        }

        if !self
            .state
            .directory
            .is_enrolled(&self.identity.participant_id, &session.course_id)
            .await?
        {
            return Err(RcError::NotEnrolled);
        }

        match session.status {
            SessionStatus::Live => Ok(()),
            SessionStatus::Scheduled => Err(RcError::SessionNotStarted),
            SessionStatus::Completed => Err(RcError::NotFound(Resource::Room)),
        }
    }

    /// Recent history visible to this participant. Store failures yield none.
    async fn chat_history(&self, room_key: &RoomKey) -> Vec<ChatMessage> {
        match self
            .state
            .chat
            .recent(room_key, self.state.chat_history_limit)
            .await
        {
            Ok(messages) => messages
                .into_iter()
                .filter(|m| m.visible_to(&self.identity.participant_id))
                .collect(),
            Err(e) => {
                warn!(
                    target: "rc.signaling",
                    room_key = %room_key,
                    error = %e,
                    "Chat history unavailable, joining without it"
                );
                Vec::new()
            }
        }
    }

    /// A join that timed out may still have landed; take it back.
    async fn undo_join(&mut self, room_key: &RoomKey) {
        let connection_id = self.connection_id();
        self.forget_room(room_key);

        let undo = async {
            let Some(room) = self.state.registry.get(room_key.clone()).await? else {
                return Ok::<_, RcError>(());
            };
            match leave_and_report(&self.state.registry, room, connection_id).await {
                Ok(_) | Err(RcError::NotFound(Resource::Peer)) => Ok(()),
                Err(e) => Err(e),
            }
        };

        match tokio::time::timeout(self.state.request_timeout, undo).await {
            Ok(Ok(())) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %connection_id,
                    room_key = %room_key,
                    "Timed-out join rolled back"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    target: "rc.signaling",
                    room_key = %room_key,
                    error = %e,
                    "Rolling back timed-out join failed"
                );
            }
            Err(_) => {
                warn!(
                    target: "rc.signaling",
                    room_key = %room_key,
                    "Rolling back timed-out join timed out"
                );
            }
        }
    }

    /// Leave `room_key`, releasing everything this connection owns there.
    async fn leave(&mut self, room_key: &RoomKey) -> Result<(), RcError> {
        let room = self
            .memberships
            .get(room_key)
            .cloned()
            .ok_or(RcError::NotFound(Resource::Peer))?;
        self.forget_room(room_key);

        let outcome = leave_and_report(&self.state.registry, room, self.connection_id()).await?;
        info!(
            target: "rc.signaling",
            connection_id = %self.connection_id(),
            room_key = %room_key,
            remaining = outcome.remaining,
            "Left room"
        );
        Ok(())
    }

    fn forget_room(&mut self, room_key: &RoomKey) {
        self.memberships.remove(room_key);
        self.transports.retain(|_, key| key != room_key);
    }

    async fn get_messages(&self, data: GetMessagesData) -> Result<MessagesResponse, RcError> {
        let room_key = super::protocol::parse_room_key(&data.room_key)?;
        self.member_room(&room_key)?;

        let limit = data
            .limit
            .unwrap_or(DEFAULT_MESSAGES_LIMIT)
            .clamp(1, MAX_MESSAGES_LIMIT);
        let messages = self
            .state
            .chat
            .recent(&room_key, limit)
            .await?
            .into_iter()
            .filter(|m| m.visible_to(&self.identity.participant_id))
            .collect();

        Ok(MessagesResponse { messages })
    }

    async fn handle_event(&mut self, event: ClientEvent) -> Result<(), RcError> {
        match event {
            ClientEvent::ChatMessage(data) => {
                let room_key = super::protocol::parse_room_key(&data.room_key)?;
                let room = self.member_room(&room_key)?;
                let text = normalize_text(&data.text).ok_or_else(|| {
                    RcError::InvalidRequest("Message text is empty or too long".to_string())
                })?;
                let recipient_id = data
                    .recipient_id
                    .filter(|r| !r.is_empty())
                    .map(ParticipantId);

                let message = self
                    .state
                    .chat
                    .append(NewChatMessage {
                        room_key,
                        user_id: self.identity.participant_id.clone(),
                        user_name: self.identity.display_name.clone(),
                        message: text,
                        recipient_id: recipient_id.clone(),
                    })
                    .await?;

                let audience = recipient_id.map_or(Audience::All, Audience::Private);
                room.broadcast(
                    self.connection_id(),
                    ServerEvent::ChatMessage(message),
                    audience,
                )
                .await
            }

            ClientEvent::Typing(data) => {
                let room_key = super::protocol::parse_room_key(&data.room_key)?;
                let room = self.member_room(&room_key)?;
                let event = ServerEvent::Typing(Typing {
                    peer_id: self.connection_id().to_string(),
                    participant_id: self.identity.participant_id.clone(),
                    display_name: self.identity.display_name.clone(),
                    is_typing: data.is_typing,
                });
                room.broadcast(self.connection_id(), event, Audience::Others)
                    .await
            }

            ClientEvent::RaiseHand(room) => {
                let room_key = room.key()?;
                self.member_room(&room_key)?
                    .set_hand_raised(self.connection_id(), true)
                    .await
            }

            ClientEvent::LowerHand(room) => {
                let room_key = room.key()?;
                self.member_room(&room_key)?
                    .set_hand_raised(self.connection_id(), false)
                    .await
            }
        }
    }

    fn member_room(&self, room_key: &RoomKey) -> Result<RoomActorHandle, RcError> {
        self.memberships
            .get(room_key)
            .cloned()
            .ok_or(RcError::NotFound(Resource::Peer))
    }

    fn transport_room(&self, transport_id: TransportId) -> Result<RoomActorHandle, RcError> {
        self.transports
            .get(&transport_id)
            .and_then(|key| self.memberships.get(key))
            .cloned()
            .ok_or(RcError::NotFound(Resource::Transport))
    }

    async fn respond(&self, response: ResponseFrame) {
        if let Err(e) = self.connection.respond(response).await {
            debug!(
                target: "rc.signaling",
                connection_id = %self.connection_id(),
                error = %e,
                "Response not delivered, connection closing"
            );
        }
    }

    /// Channel lost: leave every joined room.
    pub async fn close(mut self) {
        let rooms: Vec<RoomKey> = self.memberships.keys().cloned().collect();
        for room_key in rooms {
            let left = tokio::time::timeout(self.state.request_timeout, self.leave(&room_key)).await;
            match left {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.signaling",
                        room_key = %room_key,
                        error = %e,
                        "Leave on disconnect failed"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.signaling",
                        room_key = %room_key,
                        "Leave on disconnect timed out"
                    );
                }
            }
        }
        self.connection.cancel();
    }
}

/// Leave `room` and tell the registry it was vacated. Both run in one
/// task that finishes even if the caller stops waiting, so an empty room is
/// always reported.
async fn leave_and_report(
    registry: &RoomRegistryHandle,
    room: RoomActorHandle,
    connection_id: ConnectionId,
) -> Result<LeaveOutcome, RcError> {
    let registry = registry.clone();
    let task = tokio::spawn(async move {
        let result = room.leave(connection_id).await;
        if let Err(e) = registry
            .room_vacated(room.room_key().clone(), room.instance_id())
            .await
        {
            warn!(
                target: "rc.signaling",
                room_key = %room.room_key(),
                error = %e,
                "Could not report vacated room"
            );
        }
        result
    });

    task.await
        .map_err(|e| RcError::Internal(format!("leave task failed: {e}")))?
}
