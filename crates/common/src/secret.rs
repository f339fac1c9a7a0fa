//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for the credential-verification key,
//! the database URL and raw bearer tokens.
//!
//! # Compile-Time Safety
//!
//! `SecretString` prints as `[REDACTED]` under `Debug`, so config and claim
//! structs can derive `Debug` and still be logged with `{:?}`. Reading the
//! value requires an explicit `expose_secret()` call.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct RelaySecrets {
//!     instance: String,
//!     signing_key: SecretString,
//! }
//!
//! let secrets = RelaySecrets {
//!     instance: "rc-1".to_string(),
//!     signing_key: SecretString::from("k3y"),
//! };
//!
//! assert!(!format!("{secrets:?}").contains("k3y"));
//! let key: &str = secrets.signing_key.expose_secret();
//! assert_eq!(key, "k3y");
//! ```

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("relay-signing-key");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("relay-signing-key"));
    }

    #[test]
    fn test_database_url_in_struct_is_redacted() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct Store {
            name: String,
            url: SecretString,
        }

        let store = Store {
            name: "chat".to_string(),
            url: SecretString::from("postgres://user:pw@db/relay"),
        };

        let debug_str = format!("{store:?}");
        assert!(debug_str.contains("chat"));
        assert!(!debug_str.contains("pw@db"));
    }

    #[test]
    fn test_deserialize_and_expose() {
        #[derive(Debug, Deserialize)]
        struct Keys {
            signing_key: SecretString,
        }

        let keys: Keys = serde_json::from_str(r#"{"signing_key": "abc"}"#).unwrap();
        assert_eq!(keys.signing_key.expose_secret(), "abc");
        assert!(!format!("{keys:?}").contains("abc"));
    }
}
