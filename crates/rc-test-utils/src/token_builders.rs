//! Signed participant tokens for auth tests.
//!
//! # Example
//!
//! ```rust,ignore
//! let token = TestTokenBuilder::new("alice")
//!     .named("Alice")
//!     .instructor()
//!     .sign(TEST_JWT_SECRET);
//! ```

use common::jwt::{ParticipantClaims, INSTRUCTOR_ROLE};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

/// Signing secret shared by [`TestTokenBuilder`] and [`crate::TestRig`].
pub const TEST_JWT_SECRET: &str = "rc-test-signing-secret-with-enough-bytes";

/// Builder for HS256 participant tokens. Defaults to a student token that
/// expires in one hour and was issued now.
#[derive(Debug, Clone)]
pub struct TestTokenBuilder {
    claims: ParticipantClaims,
}

impl TestTokenBuilder {
    pub fn new(participant_id: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            claims: ParticipantClaims {
                sub: participant_id.to_string(),
                name: None,
                email: None,
                role: "student".to_string(),
                exp: now + 3600,
                iat: Some(now),
            },
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.claims.name = Some(name.to_string());
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        self.claims.email = Some(email.to_string());
        self
    }

    pub fn role(mut self, role: &str) -> Self {
        self.claims.role = role.to_string();
        self
    }

    pub fn instructor(self) -> Self {
        self.role(INSTRUCTOR_ROLE)
    }

    /// Set `exp` relative to now. Negative values give an expired token.
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.claims.exp = chrono::Utc::now().timestamp() + seconds;
        self
    }

    /// Set `iat` relative to now.
    pub fn issued_in(mut self, seconds: i64) -> Self {
        self.claims.iat = Some(chrono::Utc::now().timestamp() + seconds);
        self
    }

    pub fn claims(&self) -> &ParticipantClaims {
        &self.claims
    }

    pub fn sign(&self, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &self.claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("test token signing failed")
    }
}
