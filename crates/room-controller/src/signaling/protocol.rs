//! Signaling wire protocol.
//!
//! Client frames are `{"id"?, "method", "data"}`. A frame with an `id` is a
//! request and gets exactly one response: `{"id", "data"}` on success or
//! `{"id", "error", "code"}` on failure. Server-initiated events are
//! `{"event", "data"}`.

use crate::actors::messages::PeerInfo;
use crate::chat::ChatMessage;
use crate::errors::RcError;
use crate::media::rtp::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportDirection, TransportId,
};

use common::types::{ParticipantId, RoomKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw inbound frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    /// # Errors
    ///
    /// `InvalidRequest` when the text is not a frame.
    pub fn parse(text: &str) -> Result<Self, RcError> {
        serde_json::from_str(text)
            .map_err(|e| RcError::InvalidRequest(format!("malformed frame: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_key: String,
}

impl RoomRef {
    /// # Errors
    ///
    /// `InvalidRequest` for an empty or oversized key.
    pub fn key(&self) -> Result<RoomKey, RcError> {
        parse_room_key(&self.room_key)
    }
}

/// # Errors
///
/// `InvalidRequest` for an empty or oversized key.
pub fn parse_room_key(raw: &str) -> Result<RoomKey, RcError> {
    RoomKey::parse(raw).ok_or_else(|| RcError::InvalidRequest("invalid roomKey".to_string()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportData {
    pub room_key: String,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportData {
    pub transport_id: TransportId,
    pub dtls_params: DtlsParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_params: RtpParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeData {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesData {
    pub room_key: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageData {
    pub room_key: String,
    pub text: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    pub room_key: String,
    #[serde(default)]
    pub is_typing: bool,
}

/// Request methods. Each gets a response.
#[derive(Debug, Clone)]
pub enum Request {
    Join(RoomRef),
    CreateTransport(CreateTransportData),
    ConnectTransport(ConnectTransportData),
    Produce(ProduceData),
    Consume(ConsumeData),
    Leave(RoomRef),
    GetMessages(GetMessagesData),
    MuteAll(RoomRef),
}

impl Request {
    /// Method name, used as a bounded metric label.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Request::Join(_) => "join",
            Request::CreateTransport(_) => "createTransport",
            Request::ConnectTransport(_) => "connectTransport",
            Request::Produce(_) => "produce",
            Request::Consume(_) => "consume",
            Request::Leave(_) => "leave",
            Request::GetMessages(_) => "getMessages",
            Request::MuteAll(_) => "muteAll",
        }
    }
}

/// Fire-and-forget client events.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ChatMessage(ChatMessageData),
    Typing(TypingData),
    RaiseHand(RoomRef),
    LowerHand(RoomRef),
}

impl ClientEvent {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            ClientEvent::ChatMessage(_) => "chatMessage",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::RaiseHand(_) => "raiseHand",
            ClientEvent::LowerHand(_) => "lowerHand",
        }
    }
}

/// A parsed inbound frame body.
#[derive(Debug, Clone)]
pub enum Inbound {
    Request(Request),
    Event(ClientEvent),
}

fn payload<T: DeserializeOwned>(method: &str, data: Value) -> Result<T, RcError> {
    serde_json::from_value(data)
        .map_err(|e| RcError::InvalidRequest(format!("invalid {method} payload: {e}")))
}

impl Inbound {
    /// # Errors
    ///
    /// `InvalidRequest` for an unknown method or a payload of the wrong shape.
    pub fn parse(method: &str, data: Value) -> Result<Self, RcError> {
        let inbound = match method {
            "join" => Inbound::Request(Request::Join(payload(method, data)?)),
            "createTransport" => Inbound::Request(Request::CreateTransport(payload(method, data)?)),
            "connectTransport" => {
                Inbound::Request(Request::ConnectTransport(payload(method, data)?))
            }
            "produce" => Inbound::Request(Request::Produce(payload(method, data)?)),
            "consume" => Inbound::Request(Request::Consume(payload(method, data)?)),
            "leave" => Inbound::Request(Request::Leave(payload(method, data)?)),
            "getMessages" => Inbound::Request(Request::GetMessages(payload(method, data)?)),
            "muteAll" => Inbound::Request(Request::MuteAll(payload(method, data)?)),
            "chatMessage" => Inbound::Event(ClientEvent::ChatMessage(payload(method, data)?)),
            "typing" => Inbound::Event(ClientEvent::Typing(payload(method, data)?)),
            "raiseHand" => Inbound::Event(ClientEvent::RaiseHand(payload(method, data)?)),
            "lowerHand" => Inbound::Event(ClientEvent::LowerHand(payload(method, data)?)),
            other => {
                return Err(RcError::InvalidRequest(format!("unknown method: {other}")));
            }
        };
        Ok(inbound)
    }
}

// Response payloads

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub peer_id: String,
    pub capabilities: RtpCapabilities,
    pub existing_peers: Vec<PeerInfo>,
    pub chat_history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportResponse {
    pub transport_id: TransportId,
    pub ice_params: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_params: DtlsParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub const OK: OkResponse = OkResponse { ok: true };
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_params: RtpParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<ChatMessage>,
}

// Server events

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub peer_id: String,
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub producer_id: ProducerId,
    pub peer_id: String,
    pub participant_id: ParticipantId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosed {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub peer_id: String,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandState {
    pub peer_id: String,
    pub participant_id: ParticipantId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteCommand {
    pub by: ParticipantId,
}

/// Events pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    PeerJoined(PeerInfo),
    PeerLeft(PeerLeft),
    NewProducer(NewProducer),
    ConsumerClosed(ConsumerClosed),
    ChatMessage(ChatMessage),
    Typing(Typing),
    HandRaised(HandState),
    HandLowered(HandState),
    MuteCommand(MuteCommand),
}

impl ServerEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::PeerJoined(_) => "peerJoined",
            ServerEvent::PeerLeft(_) => "peerLeft",
            ServerEvent::NewProducer(_) => "newProducer",
            ServerEvent::ConsumerClosed(_) => "consumerClosed",
            ServerEvent::ChatMessage(_) => "chatMessage",
            ServerEvent::Typing(_) => "typing",
            ServerEvent::HandRaised(_) => "handRaised",
            ServerEvent::HandLowered(_) => "handLowered",
            ServerEvent::MuteCommand(_) => "muteCommand",
        }
    }
}

/// Response to one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl ResponseFrame {
    #[must_use]
    pub fn success(id: u64, data: Value) -> Self {
        Self {
            id,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    #[must_use]
    pub fn failure(id: u64, err: &RcError) -> Self {
        Self {
            id,
            data: None,
            error: Some(err.client_message()),
            code: Some(err.code()),
        }
    }
}

/// Anything the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Response(ResponseFrame),
    Event(ServerEvent),
}

impl ServerFrame {
    /// Encode to JSON text.
    ///
    /// # Errors
    ///
    /// `Internal` if a payload cannot be serialized.
    pub fn to_text(&self) -> Result<String, RcError> {
        serde_json::to_string(self)
            .map_err(|e| RcError::Internal(format!("frame encoding failed: {e}")))
    }
}

/// Serialize a response payload.
///
/// # Errors
///
/// `Internal` if the payload cannot be serialized.
pub fn to_data<T: Serialize>(value: &T) -> Result<Value, RcError> {
    serde_json::to_value(value)
        .map_err(|e| RcError::Internal(format!("response encoding failed: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::errors::Resource;
    use serde_json::json;

    #[test]
    fn test_request_frame_parsing() {
        let frame = ClientFrame::parse(
            r#"{"id": 7, "method": "createTransport", "data": {"roomKey": "R1", "direction": "send"}}"#,
        )
        .unwrap();
        assert_eq!(frame.id, Some(7));

        match Inbound::parse(&frame.method, frame.data).unwrap() {
            Inbound::Request(Request::CreateTransport(data)) => {
                assert_eq!(data.room_key, "R1");
                assert_eq!(data.direction, TransportDirection::Send);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_event_frame_without_id() {
        let frame =
            ClientFrame::parse(r#"{"method": "typing", "data": {"roomKey": "R1", "isTyping": true}}"#)
                .unwrap();
        assert_eq!(frame.id, None);
        assert!(matches!(
            Inbound::parse(&frame.method, frame.data).unwrap(),
            Inbound::Event(ClientEvent::Typing(TypingData { is_typing: true, .. }))
        ));
    }

    #[test]
    fn test_unknown_method_and_bad_payload() {
        assert!(matches!(
            Inbound::parse("teleport", json!({})),
            Err(RcError::InvalidRequest(_))
        ));
        assert!(matches!(
            Inbound::parse("createTransport", json!({"roomKey": "R1", "direction": "sideways"})),
            Err(RcError::InvalidRequest(_))
        ));
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = ServerFrame::Response(ResponseFrame::success(3, json!({"ok": true})));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": 3, "data": {"ok": true}})
        );

        let err = ServerFrame::Response(ResponseFrame::failure(4, &RcError::NotFound(Resource::Room)));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"id": 4, "error": "Room not found", "code": "not_found"})
        );
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ServerFrame::Event(ServerEvent::PeerLeft(PeerLeft {
            peer_id: "c1".to_string(),
            participant_id: ParticipantId::from("u1"),
        }));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "peerLeft", "data": {"peerId": "c1", "participantId": "u1"}})
        );
    }

    #[test]
    fn test_room_key_validation() {
        assert!(parse_room_key("R1").is_ok());
        assert!(matches!(parse_room_key("  "), Err(RcError::InvalidRequest(_))));
    }
}
