//! Bearer credential helpers shared by the relay and its test utilities.
//!
//! - Size limit checked before any decoding
//! - Clock skew tolerance for the `iat` claim
//! - The participant claim set, with personal fields redacted in `Debug`
//! - Bearer extraction from `Authorization` header values
//!
//! Signature verification itself lives with the service that owns the key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum accepted bearer token size in bytes (8KB).
///
/// Oversized tokens are rejected before base64 decoding or signature checks.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default clock skew tolerance for `iat` (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Role claim value that grants instructor privileges.
pub const INSTRUCTOR_ROLE: &str = "instructor";

/// Errors from the pre-verification checks in this module.
///
/// Messages are deliberately identical so a client cannot tell which check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds [`MAX_JWT_SIZE_BYTES`].
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token is not three dot-separated segments.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,
}

/// Claims carried by a participant's bearer token.
///
/// `sub` also accepts `userId` and the display name falls back to `email`,
/// matching tokens minted by the course platform.
#[derive(Clone, Serialize, Deserialize)]
pub struct ParticipantClaims {
    /// Stable participant identifier.
    #[serde(alias = "userId")]
    pub sub: String,

    /// Display name shown to other peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Contact address, used as a display-name fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Platform role (`instructor`, `student`, ...).
    #[serde(default)]
    pub role: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl fmt::Debug for ParticipantClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantClaims")
            .field("sub", &"[REDACTED]")
            .field("name", &self.name.as_ref().map(|_| "[REDACTED]"))
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("role", &self.role)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

impl ParticipantClaims {
    /// Whether the role claim grants instructor privileges.
    #[must_use]
    pub fn is_instructor(&self) -> bool {
        self.role.eq_ignore_ascii_case(INSTRUCTOR_ROLE)
    }

    /// Name to show other peers: `name`, then `email`, then the subject.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.sub)
            .to_string()
    }
}

/// Reject a token before parsing if it is oversized or not JWT-shaped.
///
/// # Errors
///
/// - `TokenTooLarge` when the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` when it does not have exactly three non-empty segments
pub fn check_token_shape(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let segments = token.split('.').filter(|s| !s.is_empty()).count();
    if segments != 3 || token.matches('.').count() != 2 {
        tracing::debug!(target: "common.jwt", segments, "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    }

    Ok(())
}

/// Validate the `iat` claim against the current time with skew tolerance.
///
/// # Errors
///
/// Returns `IatTooFarInFuture` if `iat` is more than `clock_skew` ahead of now.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    validate_iat_at(iat, clock_skew, chrono::Utc::now().timestamp())
}

pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    let clock_skew_secs = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX);
    let max_iat = now.saturating_add(clock_skew_secs);

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat,
            now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Extract the token from an `Authorization` header value.
///
/// The scheme comparison is case-insensitive; an empty token yields `None`.
#[must_use]
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn claims(role: &str) -> ParticipantClaims {
        ParticipantClaims {
            sub: "user-1".to_string(),
            name: Some("Ada Lovelace".to_string()),
            email: Some("ada@example.com".to_string()),
            role: role.to_string(),
            exp: 4_102_444_800,
            iat: None,
        }
    }

    #[test]
    fn test_check_token_shape_accepts_three_segments() {
        assert!(check_token_shape("aaa.bbb.ccc").is_ok());
    }

    #[test]
    fn test_check_token_shape_rejects_malformed() {
        for token in ["", "abc", "a.b", "a.b.c.d", "a..c", ".b.c"] {
            assert_eq!(
                check_token_shape(token),
                Err(JwtValidationError::MalformedToken),
                "token {token:?}"
            );
        }
    }

    #[test]
    fn test_check_token_shape_rejects_oversized() {
        let token = format!("{}.b.c", "a".repeat(MAX_JWT_SIZE_BYTES));
        assert_eq!(
            check_token_shape(&token),
            Err(JwtValidationError::TokenTooLarge)
        );
    }

    #[test]
    fn test_validate_iat_boundary() {
        let now = 1_700_000_000_i64;

        assert!(validate_iat_at(now + 300, DEFAULT_CLOCK_SKEW, now).is_ok());
        assert_eq!(
            validate_iat_at(now + 301, DEFAULT_CLOCK_SKEW, now),
            Err(JwtValidationError::IatTooFarInFuture)
        );
    }

    #[test]
    fn test_validate_iat_past_is_fine() {
        let past = chrono::Utc::now().timestamp() - 3600;
        assert!(validate_iat(past, DEFAULT_CLOCK_SKEW).is_ok());
    }

    #[test]
    fn test_claims_accept_user_id_alias() {
        let json = r#"{"userId":"u-9","email":"x@y.z","role":"student","exp":1}"#;
        let parsed: ParticipantClaims = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.sub, "u-9");
        assert_eq!(parsed.display_name(), "x@y.z");
        assert!(!parsed.is_instructor());
    }

    #[test]
    fn test_display_name_falls_back_to_subject() {
        let mut c = claims("student");
        c.name = None;
        c.email = None;
        assert_eq!(c.display_name(), "user-1");

        c.name = Some("  ".to_string());
        assert_eq!(c.display_name(), "user-1");
    }

    #[test]
    fn test_instructor_role_is_case_insensitive() {
        assert!(claims("Instructor").is_instructor());
        assert!(claims("instructor").is_instructor());
        assert!(!claims("admin").is_instructor());
    }

    #[test]
    fn test_claims_debug_redacts_personal_fields() {
        let debug = format!("{:?}", claims("student"));

        assert!(!debug.contains("user-1"));
        assert!(!debug.contains("Ada"));
        assert!(!debug.contains("ada@example.com"));
        assert!(debug.contains("student"));
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("bearer   tok "), Some("tok"));
        assert_eq!(bearer_token("Basic dXNlcg=="), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Bearer"), None);
    }
}
