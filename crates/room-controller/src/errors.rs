//! Room Controller error types.
//!
//! Every signaling failure is returned to the client as `{error, code}`.
//! Internal details are logged server-side but not exposed to clients.

use std::fmt;
use thiserror::Error;

/// Resource kinds that can be referenced by id and go missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Room,
    Peer,
    Transport,
    Producer,
    Consumer,
}

impl Resource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Resource::Room => "room",
            Resource::Peer => "peer",
            Resource::Transport => "transport",
            Resource::Producer => "producer",
            Resource::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error categories surfaced to clients and used as metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad or missing credential.
    Authentication,
    /// Valid identity, not permitted into this room or action.
    Authorization,
    /// A referenced room/peer/transport/producer no longer exists.
    NotFound,
    /// Room full.
    Capacity,
    /// Invalid transport state transition or incompatible capabilities.
    Negotiation,
    /// A worker died; the process is shutting down.
    FatalInfrastructure,
    /// Malformed or conflicting request.
    Invalid,
    /// Anything else, including timeouts and collaborator failures.
    Internal,
}

/// Transport and media negotiation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("transport is already connected")]
    TransportAlreadyConnected,

    #[error("transport is not connected")]
    TransportNotConnected,

    #[error("transport direction does not allow this operation")]
    WrongDirection,

    #[error("receive capabilities are incompatible with the producer")]
    IncompatibleCapabilities,

    #[error("codec not supported by this room: {0}")]
    UnsupportedCodec(String),

    #[error("invalid media parameters: {0}")]
    InvalidParameters(String),
}

/// Room Controller error type.
#[derive(Debug, Error)]
pub enum RcError {
    /// Credential missing, malformed, expired or badly signed.
    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    /// Non-instructor without an enrollment for the room's course.
    #[error("Not enrolled in this course")]
    NotEnrolled,

    /// The course session exists but has not gone live yet.
    #[error("Session has not started")]
    SessionNotStarted,

    /// Authenticated but the action requires another role.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Referenced resource does not exist (or is not owned by the caller).
    #[error("{0} not found")]
    NotFound(Resource),

    /// Room is at capacity.
    #[error("Room is full")]
    RoomFull,

    /// Invalid negotiation state or parameters.
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Conflicting request (e.g., a second join from the same connection).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request could not be parsed or failed validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A media worker died. Fatal to the process.
    #[error("Media worker died: {0}")]
    WorkerDied(String),

    /// Operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Course directory lookup failed.
    #[error("Directory error: {0}")]
    Directory(String),

    /// Chat persistence failed.
    #[error("Chat store error: {0}")]
    ChatStore(String),

    /// Internal error (actor channel closed, invariant broken).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RcError {
    /// Category used to route the client and label metrics.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RcError::Unauthenticated(_) => ErrorCategory::Authentication,
            RcError::NotEnrolled | RcError::SessionNotStarted | RcError::PermissionDenied(_) => {
                ErrorCategory::Authorization
            }
            RcError::NotFound(_) => ErrorCategory::NotFound,
            RcError::RoomFull => ErrorCategory::Capacity,
            RcError::Negotiation(_) => ErrorCategory::Negotiation,
            RcError::WorkerDied(_) => ErrorCategory::FatalInfrastructure,
            RcError::Conflict(_) | RcError::InvalidRequest(_) => ErrorCategory::Invalid,
            RcError::Timeout(_)
            | RcError::Directory(_)
            | RcError::ChatStore(_)
            | RcError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Stable wire code. Clients route on this, not on the message text.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            RcError::Unauthenticated(_) => "unauthenticated",
            RcError::NotEnrolled => "not_enrolled",
            RcError::SessionNotStarted => "session_not_started",
            RcError::PermissionDenied(_) => "forbidden",
            RcError::NotFound(_) => "not_found",
            RcError::RoomFull => "room_full",
            RcError::Negotiation(_) => "negotiation_failed",
            RcError::Conflict(_) => "conflict",
            RcError::InvalidRequest(_) => "invalid_request",
            RcError::WorkerDied(_) => "fatal",
            RcError::Timeout(_) => "timeout",
            RcError::Directory(_) | RcError::ChatStore(_) | RcError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RcError::Unauthenticated(_) => "Invalid or expired token".to_string(),
            RcError::NotEnrolled => "Not enrolled in this class".to_string(),
            RcError::SessionNotStarted => "Session has not started yet".to_string(),
            RcError::PermissionDenied(msg)
            | RcError::Conflict(msg)
            | RcError::InvalidRequest(msg) => msg.clone(),
            RcError::NotFound(resource) => match resource {
                Resource::Room => "Room not found".to_string(),
                Resource::Peer => "Not a member of this room".to_string(),
                Resource::Transport => "Transport not found".to_string(),
                Resource::Producer => "Producer not found".to_string(),
                Resource::Consumer => "Consumer not found".to_string(),
            },
            RcError::RoomFull => "Room is full".to_string(),
            RcError::Negotiation(e) => e.to_string(),
            RcError::WorkerDied(_) => "Server is restarting, please reconnect".to_string(),
            RcError::Timeout(_) => "Request timed out".to_string(),
            RcError::Directory(_) | RcError::ChatStore(_) | RcError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            RcError::Unauthenticated("expired".to_string()).category(),
            ErrorCategory::Authentication
        );
        assert_eq!(RcError::NotEnrolled.category(), ErrorCategory::Authorization);
        assert_eq!(
            RcError::SessionNotStarted.category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            RcError::PermissionDenied("instructor only".to_string()).category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            RcError::NotFound(Resource::Transport).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(RcError::RoomFull.category(), ErrorCategory::Capacity);
        assert_eq!(
            RcError::from(NegotiationError::TransportNotConnected).category(),
            ErrorCategory::Negotiation
        );
        assert_eq!(
            RcError::WorkerDied("worker 0".to_string()).category(),
            ErrorCategory::FatalInfrastructure
        );
        assert_eq!(
            RcError::Timeout("produce".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_rejected_joins_are_distinguishable() {
        let codes = [
            RcError::Unauthenticated("missing".to_string()).code(),
            RcError::NotEnrolled.code(),
            RcError::SessionNotStarted.code(),
            RcError::NotFound(Resource::Room).code(),
            RcError::RoomFull.code(),
        ];

        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let errors = [
            RcError::Directory("connection refused to 10.0.0.5:5432".to_string()),
            RcError::ChatStore("relation chat_messages does not exist".to_string()),
            RcError::Internal("channel send failed: closed".to_string()),
        ];

        for err in errors {
            let msg = err.client_message();
            assert_eq!(msg, "An internal error occurred");
            assert_eq!(err.code(), "internal");
        }

        let fatal = RcError::WorkerDied("worker 3 pid 4242".to_string());
        assert!(!fatal.client_message().contains("4242"));
    }

    #[test]
    fn test_negotiation_messages_are_client_visible() {
        let err = RcError::from(NegotiationError::TransportAlreadyConnected);
        assert_eq!(err.code(), "negotiation_failed");
        assert_eq!(err.client_message(), "transport is already connected");
    }

    #[test]
    fn test_not_found_messages() {
        assert_eq!(
            RcError::NotFound(Resource::Room).client_message(),
            "Room not found"
        );
        assert_eq!(
            RcError::NotFound(Resource::Producer).to_string(),
            "producer not found"
        );
    }
}
