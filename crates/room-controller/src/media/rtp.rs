//! RTP, ICE and DTLS parameter types exchanged with clients, and the codec
//! compatibility rules a room's router applies.
//!
//! Field names are camelCase on the wire to match WebRTC client libraries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::errors::NegotiationError;

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

resource_id!(
    /// Router (per-room capability context) identifier.
    RouterId
);
resource_id!(
    /// WebRTC transport identifier.
    TransportId
);
resource_id!(
    /// Producer (published track) identifier.
    ProducerId
);
resource_id!(
    /// Consumer (subscription) identifier.
    ConsumerId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    fn mime_prefix(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio/",
            MediaKind::Video => "video/",
        }
    }
}

/// Direction of a peer's transport. Send transports host producers, receive
/// transports host consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

/// A codec the router supports or a subscriber can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub uri: String,
    pub preferred_id: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

/// A codec as negotiated for one producer or consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduced_size: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default = "default_dtls_role")]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

fn default_dtls_role() -> DtlsRole {
    DtlsRole::Auto
}

/// First payload type handed out to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

fn params(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// The codec set every room router offers.
///
/// Opus for audio; VP8, VP9 (profile 2) and two H264 profiles for video.
#[must_use]
pub fn router_capabilities() -> RtpCapabilities {
    let video_feedback = vec![
        RtcpFeedback::new("nack", ""),
        RtcpFeedback::new("nack", "pli"),
        RtcpFeedback::new("ccm", "fir"),
        RtcpFeedback::new("goog-remb", ""),
        RtcpFeedback::new("transport-cc", ""),
    ];

    let video = |mime: &str, parameters| RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: mime.to_string(),
        preferred_payload_type: None,
        clock_rate: 90000,
        channels: None,
        parameters,
        rtcp_feedback: video_feedback.clone(),
    };

    let mut codecs = vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
        },
        video(
            "video/VP8",
            params(&[("x-google-start-bitrate", Value::from(1000))]),
        ),
        video("video/VP9", params(&[("profile-id", Value::from(2))])),
        video(
            "video/H264",
            params(&[
                ("packetization-mode", Value::from(1)),
                ("profile-level-id", Value::from("4d0032")),
                ("level-asymmetry-allowed", Value::from(1)),
            ]),
        ),
        video(
            "video/H264",
            params(&[
                ("packetization-mode", Value::from(1)),
                ("profile-level-id", Value::from("42e01f")),
                ("level-asymmetry-allowed", Value::from(1)),
            ]),
        ),
    ];

    for (pt, codec) in (FIRST_DYNAMIC_PAYLOAD_TYPE..).zip(codecs.iter_mut()) {
        codec.preferred_payload_type = Some(pt);
    }

    RtpCapabilities {
        codecs,
        header_extensions: vec![
            RtpHeaderExtension {
                kind: None,
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
                preferred_id: 1,
            },
            RtpHeaderExtension {
                kind: Some(MediaKind::Video),
                uri: "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time".to_string(),
                preferred_id: 4,
            },
            RtpHeaderExtension {
                kind: None,
                uri: "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
                    .to_string(),
                preferred_id: 5,
            },
        ],
    }
}

/// Read a format parameter that clients send as either a number or a string.
fn param_string(parameters: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    match parameters.get(key)? {
        Value::String(s) => Some(s.to_ascii_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Codec identity shared by capabilities and negotiated parameters.
struct CodecView<'a> {
    mime_type: &'a str,
    clock_rate: u32,
    channels: Option<u8>,
    parameters: &'a BTreeMap<String, Value>,
}

impl<'a> From<&'a RtpCodecCapability> for CodecView<'a> {
    fn from(c: &'a RtpCodecCapability) -> Self {
        Self {
            mime_type: &c.mime_type,
            clock_rate: c.clock_rate,
            channels: c.channels,
            parameters: &c.parameters,
        }
    }
}

impl<'a> From<&'a RtpCodecParameters> for CodecView<'a> {
    fn from(c: &'a RtpCodecParameters) -> Self {
        Self {
            mime_type: &c.mime_type,
            clock_rate: c.clock_rate,
            channels: c.channels,
            parameters: &c.parameters,
        }
    }
}

fn codecs_match(a: &CodecView<'_>, b: &CodecView<'_>) -> bool {
    if !a.mime_type.eq_ignore_ascii_case(b.mime_type) || a.clock_rate != b.clock_rate {
        return false;
    }

    // Channel counts only have to agree when both sides state one.
    if let (Some(a_channels), Some(b_channels)) = (a.channels, b.channels) {
        if a_channels != b_channels {
            return false;
        }
    }

    let mime = a.mime_type.to_ascii_lowercase();

    match mime.as_str() {
        "video/h264" => {
            let mode = |p: &BTreeMap<String, Value>| {
                param_string(p, "packetization-mode").unwrap_or_else(|| "0".into())
            };
            // profile_idc is the first byte of profile-level-id
            let profile = |p: &BTreeMap<String, Value>| {
                param_string(p, "profile-level-id")
                    .unwrap_or_else(|| "42e01f".into())
                    .get(..2)
                    .map(str::to_string)
            };
            mode(a.parameters) == mode(b.parameters) && profile(a.parameters) == profile(b.parameters)
        }
        "video/vp9" => {
            let profile = |p: &BTreeMap<String, Value>| {
                param_string(p, "profile-id").unwrap_or_else(|| "0".into())
            };
            profile(a.parameters) == profile(b.parameters)
        }
        _ => true,
    }
}

/// Check a producer's parameters against the router's codec set.
///
/// # Errors
///
/// `InvalidParameters` when there are no codecs or a codec's type does not
/// match `kind`; `UnsupportedCodec` when the router does not offer a codec.
pub fn validate_producer_parameters(
    router: &RtpCapabilities,
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
) -> Result<(), NegotiationError> {
    if rtp_parameters.codecs.is_empty() {
        return Err(NegotiationError::InvalidParameters(
            "rtpParams must contain at least one codec".to_string(),
        ));
    }

    for codec in &rtp_parameters.codecs {
        if !codec
            .mime_type
            .to_ascii_lowercase()
            .starts_with(kind.mime_prefix())
        {
            return Err(NegotiationError::InvalidParameters(format!(
                "codec {} does not match kind {}",
                codec.mime_type,
                kind.as_str()
            )));
        }

        let supported = router
            .codecs
            .iter()
            .any(|cap| codecs_match(&cap.into(), &codec.into()));
        if !supported {
            return Err(NegotiationError::UnsupportedCodec(codec.mime_type.clone()));
        }
    }

    Ok(())
}

/// Pick the first producer codec the subscriber can receive, returned with
/// the subscriber's preferred payload type.
#[must_use]
pub fn negotiate_consumer_codec(
    producer: &RtpParameters,
    subscriber: &RtpCapabilities,
) -> Option<RtpCodecParameters> {
    producer.codecs.iter().find_map(|codec| {
        subscriber
            .codecs
            .iter()
            .find(|cap| codecs_match(&(*cap).into(), &codec.into()))
            .map(|cap| RtpCodecParameters {
                payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                rtcp_feedback: cap.rtcp_feedback.clone(),
                ..codec.clone()
            })
    })
}
