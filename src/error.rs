use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum JukeboxError {
    // Authorization errors
    Unauthorized(String),
    PermissionDenied(String),

    // Validation errors
    ValidationError(String),
    InvalidMediaLink,

    // Rate limiting errors
    RateLimited(String),
    QueueFull,
    Blocklisted,

    // Lookup errors
    NotFound(String),
    Conflict(String),
    QueueEmpty,

    // Infrastructure errors
    StorageError(String),
    LookupError(String),
    PipelineError(String),

    // Messages errors
    MessageParseError(String),
    MessageTooLarge(usize),

    // Connections errors
    ConnectionError(String),

    // Configuration errors
    ConfigError(String),
}

impl JukeboxError {
    /// Whether the failure came from an unavailable collaborator and the
    /// action may succeed if delivered again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StorageError(_) | Self::LookupError(_) | Self::PipelineError(_)
        )
    }

    /// Text placed in the `error` event sent to the caller.
    pub fn client_message(&self) -> String {
        match self {
            Self::Unauthorized(msg) | Self::PermissionDenied(msg) => msg.clone(),
            Self::ValidationError(msg) | Self::RateLimited(msg) => msg.clone(),
            Self::InvalidMediaLink => "Invalid YouTube URL".to_string(),
            Self::QueueFull => "Queue limit reached".to_string(),
            Self::Blocklisted => "This song is blocked for 1 hour".to_string(),
            Self::NotFound(msg) | Self::Conflict(msg) => msg.clone(),
            Self::QueueEmpty => "Please add video in queue".to_string(),
            // Infrastructure details stay in the logs
            Self::StorageError(_) | Self::PipelineError(_) => {
                "Something went wrong, please try again".to_string()
            }
            Self::LookupError(_) => "Could not fetch video details".to_string(),
            Self::MessageParseError(_) => "Invalid message".to_string(),
            Self::MessageTooLarge(_) => "Message too large".to_string(),
            Self::ConnectionError(_) | Self::ConfigError(_) => "Internal server error".to_string(),
        }
    }
}

impl fmt::Display for JukeboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Self::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            Self::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Self::InvalidMediaLink => write!(f, "Validation error: invalid media link"),
            Self::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            Self::QueueFull => write!(f, "Rate limited: queue is full"),
            Self::Blocklisted => write!(f, "Rate limited: link is blocklisted"),
            Self::NotFound(msg) => write!(f, "Not found: {}", msg),
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::QueueEmpty => write!(f, "Queue is empty"),
            Self::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Self::LookupError(msg) => write!(f, "Metadata lookup error: {}", msg),
            Self::PipelineError(msg) => write!(f, "Pipeline error: {}", msg),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for JukeboxError {}

impl From<sqlx::Error> for JukeboxError {
    fn from(err: sqlx::Error) -> Self {
        JukeboxError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for JukeboxError {
    fn from(err: serde_json::Error) -> Self {
        JukeboxError::MessageParseError(err.to_string())
    }
}

impl From<reqwest::Error> for JukeboxError {
    fn from(err: reqwest::Error) -> Self {
        JukeboxError::LookupError(err.to_string())
    }
}

// Generic result type for the jukebox
pub type Result<T> = std::result::Result<T, JukeboxError>;
