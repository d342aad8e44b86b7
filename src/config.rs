//! Server configuration module
//! Handles dynamic configuration parameters for the jukebox server

use crate::constants::*;
use crate::error::{JukeboxError, Result};
use std::env;
use std::time::Duration;

/// Limits applied to non-host room members
#[derive(Debug, Clone)]
pub struct RoomPolicy {
    pub vote_cooldown: Duration,
    pub submit_cooldown: Duration,
    pub blocklist_ttl: Duration,
    pub max_queue_length: usize,
    /// How long an empty room is kept before eviction
    pub room_grace: Duration,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            vote_cooldown: Duration::from_secs(DEFAULT_VOTE_COOLDOWN_SECS),
            submit_cooldown: Duration::from_secs(DEFAULT_SUBMIT_COOLDOWN_SECS),
            blocklist_ttl: Duration::from_secs(DEFAULT_BLOCKLIST_SECS),
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            room_grace: Duration::from_secs(DEFAULT_ROOM_GRACE_SECS),
        }
    }
}

/// Mutation pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name of this process, recorded on the actions it accepts
    pub node_id: String,
    pub lease: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            node_id: DEFAULT_NODE_ID.to_string(),
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl PipelineConfig {
    /// Backoff before the next delivery of a failed action
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let millis = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << exponent);
        Duration::from_millis(millis.min(RETRY_MAX_DELAY_MS))
    }
}

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// JWT secret shared with the join-token issuer
    pub jwt_secret: String,
    pub database_url: String,
    /// Origins allowed to open a WebSocket (empty = no explicit list)
    pub allowed_origins: Vec<String>,
    /// Development mode (enables localhost origins)
    pub development_mode: bool,
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// Capacity of each room's broadcast topic
    pub room_topic_capacity: usize,
    pub oembed_endpoint: String,
    pub policy: RoomPolicy,
    pub pipeline: PipelineConfig,
    /// TLS configuration
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub enable_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        panic!("ServerConfig::default() is not allowed for security reasons. Use ServerConfig::from_env() instead.");
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(false)
}

impl ServerConfig {
    /// Create a test configuration - DANGEROUS: Only for testing!
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            jwt_secret: "test-jwt-secret-only-for-unit-tests-never-use-in-production".to_string(),
            database_url: "sqlite::memory:".to_string(),
            allowed_origins: Vec::new(),
            development_mode: true,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            room_topic_capacity: DEFAULT_ROOM_TOPIC_CAPACITY,
            oembed_endpoint: DEFAULT_OEMBED_ENDPOINT.to_string(),
            policy: RoomPolicy::default(),
            pipeline: PipelineConfig::default(),
            tls_cert_path: None,
            tls_key_path: None,
            enable_tls: false,
        }
    }

    /// Validate that the JWT secret meets security requirements
    fn validate_jwt_secret(secret: &str) -> Result<()> {
        if secret.len() < 32 {
            return Err(JukeboxError::ConfigError(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        // Check for insecure default or example values
        let insecure_patterns = ["your-secret-key", "change-this", "test-secret", "password", "12345"];
        for pattern in &insecure_patterns {
            if secret.contains(pattern) {
                return Err(JukeboxError::ConfigError(format!(
                    "JWT secret contains insecure pattern '{}'. Generate one with: openssl rand -base64 32",
                    pattern
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let host = env::var("JUKEBOX_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = env_or("JUKEBOX_PORT", DEFAULT_PORT);

        // The join-token issuer historically used JWT_SECRET_KEY
        let jwt_secret = env::var("JUKEBOX_JWT_SECRET")
            .or_else(|_| env::var("JWT_SECRET_KEY"))
            .map_err(|_| {
                JukeboxError::ConfigError(
                    "JUKEBOX_JWT_SECRET environment variable is required. \
                     It must match the secret used to sign join tokens."
                        .to_string(),
                )
            })?;
        Self::validate_jwt_secret(&jwt_secret)?;

        let database_url =
            env::var("JUKEBOX_DATABASE_URL").unwrap_or(DEFAULT_DATABASE_URL.to_string());

        let allowed_origins = env::var("JUKEBOX_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let policy = RoomPolicy {
            vote_cooldown: Duration::from_secs(env_or(
                "JUKEBOX_VOTE_COOLDOWN_SECS",
                DEFAULT_VOTE_COOLDOWN_SECS,
            )),
            submit_cooldown: Duration::from_secs(env_or(
                "JUKEBOX_SUBMIT_COOLDOWN_SECS",
                DEFAULT_SUBMIT_COOLDOWN_SECS,
            )),
            blocklist_ttl: Duration::from_secs(env_or(
                "JUKEBOX_BLOCKLIST_SECS",
                DEFAULT_BLOCKLIST_SECS,
            )),
            max_queue_length: env_or("JUKEBOX_MAX_QUEUE_LENGTH", DEFAULT_MAX_QUEUE_LENGTH),
            room_grace: Duration::from_secs(env_or(
                "JUKEBOX_ROOM_GRACE_SECS",
                DEFAULT_ROOM_GRACE_SECS,
            )),
        };

        let pipeline = PipelineConfig {
            node_id: env::var("JUKEBOX_NODE_ID").unwrap_or(DEFAULT_NODE_ID.to_string()),
            lease: Duration::from_secs(env_or("JUKEBOX_LEASE_SECS", DEFAULT_LEASE_SECS)),
            max_attempts: env_or("JUKEBOX_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            poll_interval: Duration::from_millis(env_or(
                "JUKEBOX_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )),
        };

        // TLS configuration
        let enable_tls = env_flag("JUKEBOX_ENABLE_TLS");
        let tls_cert_path = env::var("JUKEBOX_TLS_CERT_PATH").ok();
        let tls_key_path = env::var("JUKEBOX_TLS_KEY_PATH").ok();

        if enable_tls {
            match (&tls_cert_path, &tls_key_path) {
                (Some(cert_path), Some(key_path)) => {
                    if !std::path::Path::new(cert_path).exists() {
                        return Err(JukeboxError::ConfigError(format!(
                            "TLS certificate file does not exist: {}",
                            cert_path
                        )));
                    }
                    if !std::path::Path::new(key_path).exists() {
                        return Err(JukeboxError::ConfigError(format!(
                            "TLS private key file does not exist: {}",
                            key_path
                        )));
                    }
                }
                _ => {
                    return Err(JukeboxError::ConfigError(
                        "TLS is enabled but JUKEBOX_TLS_CERT_PATH or JUKEBOX_TLS_KEY_PATH is not set"
                            .to_string(),
                    ))
                }
            }
        }

        Ok(Self {
            host,
            port,
            jwt_secret,
            database_url,
            allowed_origins,
            development_mode: env_flag("JUKEBOX_DEVELOPMENT_MODE"),
            outbound_buffer: env_or("JUKEBOX_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER).max(1),
            room_topic_capacity: env_or("JUKEBOX_ROOM_TOPIC_CAPACITY", DEFAULT_ROOM_TOPIC_CAPACITY)
                .max(1),
            oembed_endpoint: env::var("JUKEBOX_OEMBED_ENDPOINT")
                .unwrap_or(DEFAULT_OEMBED_ENDPOINT.to_string()),
            policy,
            pipeline,
            tls_cert_path,
            tls_key_path,
            enable_tls,
        })
    }
}
