//! Bearer credential verification for signaling connections.
//!
//! # Security
//!
//! - Tokens are size- and shape-checked before parsing
//! - Only HS256 is accepted
//! - `exp` is enforced, `iat` is checked against clock skew
//! - Every failure produces the same client-facing message

use crate::errors::RcError;

use async_trait::async_trait;
use common::jwt::{check_token_shape, validate_iat, ParticipantClaims, DEFAULT_CLOCK_SKEW};
use common::secret::{ExposeSecret, SecretString};
use common::types::ParticipantId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Serialize;
use std::time::Duration;
use tracing::instrument;

const INVALID_TOKEN: &str = "The access token is invalid or expired";

/// Privilege level inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Instructor,
    Participant,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Instructor => "instructor",
            Role::Participant => "participant",
        }
    }

    #[must_use]
    pub fn is_instructor(&self) -> bool {
        matches!(self, Role::Instructor)
    }
}

/// Verified identity attached to a signaling connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub role: Role,
}

impl From<ParticipantClaims> for Identity {
    fn from(claims: ParticipantClaims) -> Self {
        let role = if claims.is_instructor() {
            Role::Instructor
        } else {
            Role::Participant
        };
        Self {
            display_name: claims.display_name(),
            participant_id: ParticipantId(claims.sub),
            role,
        }
    }
}

/// Validates a bearer credential and returns who presented it.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, RcError>;
}

/// HS256 verifier keyed by the shared signing secret.
pub struct JwtIdentityVerifier {
    secret: SecretString,
    clock_skew: Duration,
}

impl JwtIdentityVerifier {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }

    fn decode_claims(&self, token: &str) -> Result<ParticipantClaims, RcError> {
        check_token_shape(token).map_err(|e| {
            tracing::debug!(target: "rc.auth", error = ?e, "Token failed pre-checks");
            RcError::Unauthenticated(INVALID_TOKEN.to_string())
        })?;

        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<ParticipantClaims>(token, &key, &validation).map_err(|e| {
            tracing::debug!(target: "rc.auth", error = %e, "Token verification failed");
            RcError::Unauthenticated(INVALID_TOKEN.to_string())
        })?;

        if let Some(iat) = data.claims.iat {
            validate_iat(iat, self.clock_skew).map_err(|e| {
                tracing::debug!(target: "rc.auth", error = ?e, "Token iat validation failed");
                RcError::Unauthenticated(INVALID_TOKEN.to_string())
            })?;
        }

        if data.claims.sub.trim().is_empty() {
            tracing::debug!(target: "rc.auth", "Token has an empty subject");
            return Err(RcError::Unauthenticated(INVALID_TOKEN.to_string()));
        }

        Ok(data.claims)
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    #[instrument(skip_all, name = "rc.auth.verify")]
    async fn verify(&self, token: &str) -> Result<Identity, RcError> {
        let claims = self.decode_claims(token)?;
        let identity = Identity::from(claims);
        tracing::debug!(
            target: "rc.auth",
            participant_id = %identity.participant_id,
            role = identity.role.as_str(),
            "Token validated"
        );
        Ok(identity)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-signing-secret";

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn claims(role: &str) -> ParticipantClaims {
        ParticipantClaims {
            sub: "student-7".to_string(),
            name: Some("Grace".to_string()),
            email: None,
            role: role.to_string(),
            exp: now() + 3600,
            iat: Some(now()),
        }
    }

    fn sign(claims: &ParticipantClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> JwtIdentityVerifier {
        JwtIdentityVerifier::new(SecretString::from(SECRET))
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let identity = verifier()
            .verify(&sign(&claims("student"), SECRET))
            .await
            .unwrap();

        assert_eq!(identity.participant_id.as_str(), "student-7");
        assert_eq!(identity.display_name, "Grace");
        assert_eq!(identity.role, Role::Participant);
    }

    #[tokio::test]
    async fn test_instructor_role() {
        let identity = verifier()
            .verify(&sign(&claims("Instructor"), SECRET))
            .await
            .unwrap();
        assert!(identity.role.is_instructor());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let err = verifier()
            .verify(&sign(&claims("student"), "some-other-secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, RcError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let mut expired = claims("student");
        expired.exp = now() - 3600;
        let err = verifier()
            .verify(&sign(&expired, SECRET))
            .await
            .unwrap_err();
        assert!(matches!(err, RcError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_future_iat_rejected() {
        let mut future = claims("student");
        future.iat = Some(now() + 3600);
        let err = verifier().verify(&sign(&future, SECRET)).await.unwrap_err();
        assert!(matches!(err, RcError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_oversized_and_garbage_tokens_rejected() {
        let v = verifier();
        assert!(v.verify("not-a-jwt").await.is_err());
        assert!(v.verify(&"a".repeat(9000)).await.is_err());
    }

    #[tokio::test]
    async fn test_failures_share_one_message() {
        let v = verifier();
        let a = v.verify("garbage").await.unwrap_err();
        let b = v
            .verify(&sign(&claims("student"), "wrong"))
            .await
            .unwrap_err();
        assert_eq!(a.to_string(), b.to_string());
    }
}
