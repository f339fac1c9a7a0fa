//! Message types for actor communication.
//!
//! Request-reply messages carry a `oneshot` responder; the rest are
//! fire-and-forget.

use super::connection::ConnectionActorHandle;
use super::room::RoomActorHandle;
use crate::auth::{Identity, Role};
use crate::errors::RcError;
use crate::media::rtp::{
    DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters, TransportDirection,
    TransportId,
};
use crate::media::{ConsumerCreated, TransportCreated};
use crate::signaling::protocol::{ServerEvent, ServerFrame};

use common::types::{ConnectionId, ParticipantId, RoomKey};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Get or create the room and hold a join lease on it.
    Acquire {
        room_key: RoomKey,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RcError>>,
    },

    /// A join attempt finished (either way).
    ReleaseLease { room_key: RoomKey, instance_id: u64 },

    /// A peer left; destroy the room if it is now empty.
    RoomVacated { room_key: RoomKey, instance_id: u64 },

    Get {
        room_key: RoomKey,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// Force-close a room and everything in it.
    Destroy {
        room_key: RoomKey,
        respond_to: oneshot::Sender<Result<(), RcError>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop admitting and close every room.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), RcError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Join {
        connection_id: ConnectionId,
        identity: Identity,
        connection: ConnectionActorHandle,
        respond_to: oneshot::Sender<Result<JoinOutcome, RcError>>,
    },

    Leave {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<LeaveOutcome, RcError>>,
    },

    CreateTransport {
        connection_id: ConnectionId,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportCreated, RcError>>,
    },

    ConnectTransport {
        connection_id: ConnectionId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), RcError>>,
    },

    Produce {
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProducerId, RcError>>,
    },

    Consume {
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumerCreated, RcError>>,
    },

    /// Fan an event out to part of the room. Ignored unless `sender` is a member.
    Broadcast {
        sender: ConnectionId,
        event: ServerEvent,
        audience: Audience,
    },

    SetHandRaised {
        connection_id: ConnectionId,
        raised: bool,
    },

    /// Instructor-only: ask every other peer to mute.
    MuteAll {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), RcError>>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Close the room if no peers remain. Responds `true` when closed.
    CloseIfEmpty { respond_to: oneshot::Sender<bool> },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write a frame to the client.
    Deliver(ServerFrame),
}

/// Who receives a room broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every peer except the sender.
    Others,
    /// Every peer including the sender.
    All,
    /// The sender plus every peer of the given participant.
    Private(ParticipantId),
}

/// Peer lifecycle. `Gone` is terminal; a rejoin is a new peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Joining,
    Joined,
    Leaving,
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

/// A peer as other peers see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub role: Role,
    pub hand_raised: bool,
    pub producers: Vec<ProducerInfo>,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub peer_id: String,
    pub capabilities: RtpCapabilities,
    /// Peers present before this one, with their producers.
    pub existing_peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Peers still in the room.
    pub remaining: usize,
}

/// Room snapshot for status and tests.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_key: RoomKey,
    pub instance_id: u64,
    pub capacity: usize,
    pub peers: Vec<PeerInfo>,
    pub peer_states: Vec<(String, PeerState)>,
}

/// Registry status for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub is_shutting_down: bool,
}
