//! Rendezvous service configuration.
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

/// Default WebSocket/API bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default lifetime of a search ticket in seconds.
pub const DEFAULT_SEARCH_TICKET_TTL_SECONDS: u64 = 300;

/// Default interval between ticket expiry sweeps in seconds.
pub const DEFAULT_EXPIRY_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Default delay before mode-dependent match follow-ups in milliseconds.
pub const DEFAULT_MATCH_FOLLOWUP_DELAY_MS: u64 = 500;

/// Default countdown duration in seconds when a client does not send one.
pub const DEFAULT_COUNTDOWN_SECONDS: u64 = 15;

/// Default delay between countdown start attempts in milliseconds.
pub const DEFAULT_COUNTDOWN_RETRY_DELAY_MS: u64 = 2000;

/// Default number of countdown start attempts before giving up.
pub const DEFAULT_COUNTDOWN_MAX_START_RETRIES: u32 = 30;

/// Default continuation vote window in seconds.
pub const DEFAULT_NOTIFICATION_TIMEOUT_SECONDS: u64 = 30;

/// Default unanswered-call timeout in seconds.
pub const DEFAULT_RING_TIMEOUT_SECONDS: u64 = 30;

/// Default accepted-but-never-connected timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 30;

/// Default bounded send timeout for signaling relay in milliseconds.
pub const DEFAULT_RELAY_SEND_TIMEOUT_MS: u64 = 5000;

/// Default number of signaling relay attempts.
pub const DEFAULT_RELAY_MAX_ATTEMPTS: u32 = 3;

/// Default linear backoff step between relay attempts in milliseconds.
pub const DEFAULT_RELAY_RETRY_BACKOFF_MS: u64 = 1000;

/// Default maximum chat message length in characters.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1000;

/// Longest countdown a client may request, in seconds.
pub const MAX_COUNTDOWN_SECONDS: u64 = 3600;

/// Timing and limits shared by the orchestration components.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub search_ticket_ttl: Duration,
    pub expiry_sweep_interval: Duration,
    pub match_followup_delay: Duration,
    pub auto_call_on_voice_match: bool,
    pub default_countdown: Duration,
    pub countdown_retry_delay: Duration,
    pub countdown_max_start_retries: u32,
    pub notification_timeout: Duration,
    pub ring_timeout: Duration,
    pub connect_timeout: Duration,
    pub default_max_call_duration: Duration,
    pub relay_send_timeout: Duration,
    pub relay_max_attempts: u32,
    pub relay_retry_backoff: Duration,
    pub max_message_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            search_ticket_ttl: Duration::from_secs(DEFAULT_SEARCH_TICKET_TTL_SECONDS),
            expiry_sweep_interval: Duration::from_secs(DEFAULT_EXPIRY_SWEEP_INTERVAL_SECONDS),
            match_followup_delay: Duration::from_millis(DEFAULT_MATCH_FOLLOWUP_DELAY_MS),
            auto_call_on_voice_match: true,
            default_countdown: Duration::from_secs(DEFAULT_COUNTDOWN_SECONDS),
            countdown_retry_delay: Duration::from_millis(DEFAULT_COUNTDOWN_RETRY_DELAY_MS),
            countdown_max_start_retries: DEFAULT_COUNTDOWN_MAX_START_RETRIES,
            notification_timeout: Duration::from_secs(DEFAULT_NOTIFICATION_TIMEOUT_SECONDS),
            ring_timeout: Duration::from_secs(DEFAULT_RING_TIMEOUT_SECONDS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            default_max_call_duration: Duration::from_secs(
                crate::models::DEFAULT_MAX_CALL_DURATION_SECS,
            ),
            relay_send_timeout: Duration::from_millis(DEFAULT_RELAY_SEND_TIMEOUT_MS),
            relay_max_attempts: DEFAULT_RELAY_MAX_ATTEMPTS,
            relay_retry_backoff: Duration::from_millis(DEFAULT_RELAY_RETRY_BACKOFF_MS),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

/// Rendezvous service configuration.
#[derive(Clone)]
pub struct Config {
    /// HS256 secret for client session tokens.
    /// Protected by `SecretString` to prevent accidental logging.
    pub jwt_secret: SecretString,

    /// WebSocket server bind address (default: "0.0.0.0:8000").
    pub bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Usernames created in the in-memory store at startup
    /// (`RV_SEED_USERS`, comma separated).
    pub seed_users: Vec<String>,

    /// Orchestration timings and limits.
    pub session: SessionConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("seed_users", &self.seed_users.len())
            .field("session", &self.session)
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

/// Parse an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = vars
            .get("RV_JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("RV_JWT_SECRET".to_string()))?;
        let jwt_secret = SecretString::from(jwt_secret.clone());

        let bind_address = vars
            .get("RV_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RV_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let seed_users = vars
            .get("RV_SEED_USERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let relay_max_attempts = parse_var(
            vars,
            "RV_RELAY_MAX_ATTEMPTS",
            DEFAULT_RELAY_MAX_ATTEMPTS,
        )?;
        if relay_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "RV_RELAY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let session = SessionConfig {
            search_ticket_ttl: Duration::from_secs(parse_var(
                vars,
                "RV_SEARCH_TICKET_TTL_SECONDS",
                DEFAULT_SEARCH_TICKET_TTL_SECONDS,
            )?),
            expiry_sweep_interval: Duration::from_secs(parse_var(
                vars,
                "RV_EXPIRY_SWEEP_INTERVAL_SECONDS",
                DEFAULT_EXPIRY_SWEEP_INTERVAL_SECONDS,
            )?),
            match_followup_delay: Duration::from_millis(parse_var(
                vars,
                "RV_MATCH_FOLLOWUP_DELAY_MS",
                DEFAULT_MATCH_FOLLOWUP_DELAY_MS,
            )?),
            auto_call_on_voice_match: parse_var(vars, "RV_AUTO_CALL_ON_VOICE_MATCH", true)?,
            default_countdown: Duration::from_secs(parse_var(
                vars,
                "RV_DEFAULT_COUNTDOWN_SECONDS",
                DEFAULT_COUNTDOWN_SECONDS,
            )?),
            countdown_retry_delay: Duration::from_millis(parse_var(
                vars,
                "RV_COUNTDOWN_RETRY_DELAY_MS",
                DEFAULT_COUNTDOWN_RETRY_DELAY_MS,
            )?),
            countdown_max_start_retries: parse_var(
                vars,
                "RV_COUNTDOWN_MAX_START_RETRIES",
                DEFAULT_COUNTDOWN_MAX_START_RETRIES,
            )?,
            notification_timeout: Duration::from_secs(parse_var(
                vars,
                "RV_NOTIFICATION_TIMEOUT_SECONDS",
                DEFAULT_NOTIFICATION_TIMEOUT_SECONDS,
            )?),
            ring_timeout: Duration::from_secs(parse_var(
                vars,
                "RV_RING_TIMEOUT_SECONDS",
                DEFAULT_RING_TIMEOUT_SECONDS,
            )?),
            connect_timeout: Duration::from_secs(parse_var(
                vars,
                "RV_CONNECT_TIMEOUT_SECONDS",
                DEFAULT_CONNECT_TIMEOUT_SECONDS,
            )?),
            default_max_call_duration: Duration::from_secs(parse_var(
                vars,
                "RV_DEFAULT_MAX_CALL_DURATION_SECONDS",
                crate::models::DEFAULT_MAX_CALL_DURATION_SECS,
            )?),
            relay_send_timeout: Duration::from_millis(parse_var(
                vars,
                "RV_RELAY_SEND_TIMEOUT_MS",
                DEFAULT_RELAY_SEND_TIMEOUT_MS,
            )?),
            relay_max_attempts,
            relay_retry_backoff: Duration::from_millis(parse_var(
                vars,
                "RV_RELAY_RETRY_BACKOFF_MS",
                DEFAULT_RELAY_RETRY_BACKOFF_MS,
            )?),
            max_message_length: parse_var(
                vars,
                "RV_MAX_MESSAGE_LENGTH",
                DEFAULT_MAX_MESSAGE_LENGTH,
            )?,
        };

        Ok(Config {
            jwt_secret,
            bind_address,
            health_bind_address,
            seed_users,
            session,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "RV_JWT_SECRET".to_string(),
            "test-secret-value-0123456789abcdef".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = base_vars();

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(
            config.jwt_secret.expose_secret(),
            "test-secret-value-0123456789abcdef"
        );
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.session.search_ticket_ttl, Duration::from_secs(300));
        assert_eq!(config.session.notification_timeout, Duration::from_secs(30));
        assert_eq!(config.session.ring_timeout, Duration::from_secs(30));
        assert_eq!(
            config.session.default_max_call_duration,
            Duration::from_secs(3600)
        );
        assert_eq!(config.session.relay_max_attempts, 3);
        assert_eq!(config.session.max_message_length, 1000);
        assert!(config.session.auto_call_on_voice_match);
        assert!(config.seed_users.is_empty());
    }

    #[test]
    fn test_from_vars_seed_users_are_trimmed() {
        let mut vars = base_vars();
        vars.insert("RV_SEED_USERS".to_string(), " alice, bob,,".to_string());

        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(config.seed_users, vec!["alice", "bob"]);
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert("RV_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert("RV_RING_TIMEOUT_SECONDS".to_string(), "10".to_string());
        vars.insert("RV_RELAY_SEND_TIMEOUT_MS".to_string(), "250".to_string());
        vars.insert("RV_AUTO_CALL_ON_VOICE_MATCH".to_string(), "false".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.session.ring_timeout, Duration::from_secs(10));
        assert_eq!(config.session.relay_send_timeout, Duration::from_millis(250));
        assert!(!config.session.auto_call_on_voice_match);
    }

    #[test]
    fn test_from_vars_missing_jwt_secret() {
        let vars = HashMap::new();

        let result = Config::from_vars(&vars);

        assert!(matches!(
            result,
            Err(ConfigError::MissingEnvVar(ref var)) if var == "RV_JWT_SECRET"
        ));
    }

    #[test]
    fn test_from_vars_invalid_number_rejected() {
        let mut vars = base_vars();
        vars.insert(
            "RV_NOTIFICATION_TIMEOUT_SECONDS".to_string(),
            "thirty".to_string(),
        );

        let result = Config::from_vars(&vars);

        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_vars_zero_relay_attempts_rejected() {
        let mut vars = base_vars();
        vars.insert("RV_RELAY_MAX_ATTEMPTS".to_string(), "0".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug = format!("{config:?}");

        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("test-secret-value"));
        assert!(debug.contains(DEFAULT_BIND_ADDRESS));
    }
}
