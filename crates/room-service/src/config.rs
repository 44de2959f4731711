//! Room coordinator configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP + WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default per-participant outbound queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default expiry of the persisted room record (24 hours).
pub const DEFAULT_ROOM_RECORD_TTL_SECONDS: u64 = 86_400;

/// Default transport ping cadence.
pub const DEFAULT_PING_INTERVAL_SECONDS: u64 = 30;

/// Default inbound silence tolerated before a connection is treated as dead.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 90;

/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Default room size, host included.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 2;

/// Room coordinator configuration.
#[derive(Clone)]
pub struct Config {
    /// HTTP + WebSocket bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// HS256 secret for participant tokens.
    pub jwt_secret: SecretString,

    /// Metadata mirror URL. `None` disables the mirror.
    /// May embed credentials, hence `SecretString`.
    pub redis_url: Option<SecretString>,

    /// Bound of each participant's outbound queue.
    pub outbound_queue_capacity: usize,

    /// Expiry of the persisted room record.
    pub room_record_ttl_seconds: u64,

    /// Members a room admits, host included.
    pub max_participants: usize,

    /// Transport ping cadence.
    pub ping_interval_seconds: u64,

    /// Inbound silence after which a connection is dropped.
    pub idle_timeout_seconds: u64,

    /// HTTP request timeout.
    pub request_timeout_seconds: u64,

    /// Emit JSON logs instead of the human-readable format.
    pub json_logs: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("jwt_secret", &"[REDACTED]")
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("room_record_ttl_seconds", &self.room_record_ttl_seconds)
            .field("max_participants", &self.max_participants)
            .field("ping_interval_seconds", &self.ping_interval_seconds)
            .field("idle_timeout_seconds", &self.idle_timeout_seconds)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = vars
            .get("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("JWT_SECRET".to_string()))?;
        let jwt_secret = SecretString::from(jwt_secret.clone());

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let bind_address = vars
            .get("RC_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let outbound_queue_capacity: usize = parse_or(
            vars,
            "RC_OUTBOUND_QUEUE_CAPACITY",
            DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        )?;
        if outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_OUTBOUND_QUEUE_CAPACITY must be greater than 0".to_string(),
            ));
        }

        let room_record_ttl_seconds = parse_or(
            vars,
            "RC_ROOM_RECORD_TTL_SECONDS",
            DEFAULT_ROOM_RECORD_TTL_SECONDS,
        )?;

        let max_participants: usize =
            parse_or(vars, "RC_MAX_PARTICIPANTS", DEFAULT_MAX_PARTICIPANTS)?;
        if max_participants == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_MAX_PARTICIPANTS must be greater than 0".to_string(),
            ));
        }

        let ping_interval_seconds: u64 =
            parse_or(vars, "RC_PING_INTERVAL_SECONDS", DEFAULT_PING_INTERVAL_SECONDS)?;
        let idle_timeout_seconds: u64 =
            parse_or(vars, "RC_IDLE_TIMEOUT_SECONDS", DEFAULT_IDLE_TIMEOUT_SECONDS)?;
        if ping_interval_seconds == 0 || idle_timeout_seconds <= ping_interval_seconds {
            return Err(ConfigError::InvalidValue(format!(
                "RC_IDLE_TIMEOUT_SECONDS ({idle_timeout_seconds}) must exceed a non-zero \
                 RC_PING_INTERVAL_SECONDS ({ping_interval_seconds})"
            )));
        }

        let request_timeout_seconds = parse_or(
            vars,
            "RC_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECONDS,
        )?;

        let json_logs = vars
            .get("RC_LOG_FORMAT")
            .is_some_and(|v| v.eq_ignore_ascii_case("json"));

        Ok(Config {
            bind_address,
            jwt_secret,
            redis_url,
            outbound_queue_capacity,
            room_record_ttl_seconds,
            max_participants,
            ping_interval_seconds,
            idle_timeout_seconds,
            request_timeout_seconds,
            json_logs,
        })
    }

    #[must_use]
    pub fn room_record_ttl(&self) -> Duration {
        Duration::from_secs(self.room_record_ttl_seconds)
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "JWT_SECRET".to_string(),
            "test-jwt-secret-0123456789".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.jwt_secret.expose_secret(), "test-jwt-secret-0123456789");
        assert!(config.redis_url.is_none());
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(
            config.outbound_queue_capacity,
            DEFAULT_OUTBOUND_QUEUE_CAPACITY
        );
        assert_eq!(
            config.room_record_ttl(),
            Duration::from_secs(DEFAULT_ROOM_RECORD_TTL_SECONDS)
        );
        assert_eq!(config.max_participants, 2);
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.idle_timeout(), Duration::from_secs(90));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(!config.json_logs);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("RC_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert(
            "REDIS_URL".to_string(),
            "redis://localhost:6379".to_string(),
        );
        vars.insert("RC_OUTBOUND_QUEUE_CAPACITY".to_string(), "16".to_string());
        vars.insert("RC_ROOM_RECORD_TTL_SECONDS".to_string(), "600".to_string());
        vars.insert("RC_MAX_PARTICIPANTS".to_string(), "4".to_string());
        vars.insert("RC_PING_INTERVAL_SECONDS".to_string(), "5".to_string());
        vars.insert("RC_IDLE_TIMEOUT_SECONDS".to_string(), "20".to_string());
        vars.insert("RC_REQUEST_TIMEOUT_SECONDS".to_string(), "3".to_string());
        vars.insert("RC_LOG_FORMAT".to_string(), "JSON".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(
            config.redis_url.as_ref().map(|s| s.expose_secret().to_string()),
            Some("redis://localhost:6379".to_string())
        );
        assert_eq!(config.outbound_queue_capacity, 16);
        assert_eq!(config.room_record_ttl_seconds, 600);
        assert_eq!(config.max_participants, 4);
        assert_eq!(config.ping_interval_seconds, 5);
        assert_eq!(config.idle_timeout_seconds, 20);
        assert_eq!(config.request_timeout_seconds, 3);
        assert!(config.json_logs);
    }

    #[test]
    fn test_from_vars_missing_jwt_secret() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "JWT_SECRET"));
    }

    #[test]
    fn test_empty_redis_url_disables_mirror() {
        let mut vars = base_vars();
        vars.insert("REDIS_URL".to_string(), String::new());

        let config = Config::from_vars(&vars).unwrap();
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_invalid_numeric_value() {
        let mut vars = base_vars();
        vars.insert(
            "RC_OUTBOUND_QUEUE_CAPACITY".to_string(),
            "lots".to_string(),
        );

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut vars = base_vars();
        vars.insert("RC_OUTBOUND_QUEUE_CAPACITY".to_string(), "0".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zero_max_participants_rejected() {
        let mut vars = base_vars();
        vars.insert("RC_MAX_PARTICIPANTS".to_string(), "0".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(ref msg)) if msg.contains("RC_MAX_PARTICIPANTS"))
        );
    }

    #[test]
    fn test_idle_timeout_must_exceed_ping_interval() {
        let mut vars = base_vars();
        vars.insert("RC_PING_INTERVAL_SECONDS".to_string(), "30".to_string());
        vars.insert("RC_IDLE_TIMEOUT_SECONDS".to_string(), "30".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let mut vars = base_vars();
        vars.insert(
            "REDIS_URL".to_string(),
            "redis://:hunter2@cache:6379".to_string(),
        );
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
        assert!(!debug_output.contains("test-jwt-secret"));
    }
}
