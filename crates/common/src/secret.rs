//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used across Code Room for the token
//! signing secret and the metadata store URL (which may embed credentials).
//!
//! `SecretString` and `SecretBox<T>` implement `Debug` with redaction, so a
//! struct that derives `Debug` and holds one of them is safe to log. The
//! inner value is only reachable through [`ExposeSecret::expose_secret`],
//! which keeps every read of a secret greppable.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct SigningConfig {
//!     issuer: String,
//!     secret: SecretString,
//! }
//!
//! let cfg = SigningConfig {
//!     issuer: "code-room".to_string(),
//!     secret: SecretString::from("s3cr3t"),
//! };
//!
//! assert!(!format!("{cfg:?}").contains("s3cr3t"));
//! assert_eq!(cfg.secret.expose_secret(), "s3cr3t");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("jwt-signing-key");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("jwt-signing-key"));
    }

    #[test]
    fn test_redis_url_in_struct_is_redacted() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct StoreSettings {
            ttl_seconds: u64,
            url: SecretString,
        }

        let settings = StoreSettings {
            ttl_seconds: 86_400,
            url: SecretString::from("redis://:hunter2@cache:6379"),
        };

        let debug_str = format!("{settings:?}");
        assert!(debug_str.contains("86400"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_deserialize_then_expose() {
        #[derive(Debug, Deserialize)]
        struct Signing {
            secret: SecretString,
        }

        let signing: Signing =
            serde_json::from_str(r#"{"secret": "from-json"}"#).expect("deserialize");
        assert_eq!(signing.secret.expose_secret(), "from-json");
        assert!(!format!("{signing:?}").contains("from-json"));
    }
}
