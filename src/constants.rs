// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const WS_PATH: &str = "ws";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://jukebox.db";
pub const DEFAULT_NODE_ID: &str = "default";

// Room policy defaults
pub const DEFAULT_VOTE_COOLDOWN_SECS: u64 = 20 * 60;
pub const DEFAULT_SUBMIT_COOLDOWN_SECS: u64 = 20 * 60;
pub const DEFAULT_BLOCKLIST_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 20;
pub const DEFAULT_ROOM_GRACE_SECS: u64 = 10 * 60;
pub const ROOM_SWEEP_INTERVAL_SECS: u64 = 60;

// Connection and fan-out buffers
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;
pub const DEFAULT_ROOM_TOPIC_CAPACITY: usize = 256;
pub const MAX_INBOUND_MESSAGE_SIZE: usize = 4096;
// Frames above this are refused by the transport itself
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
pub const MAX_TOKEN_LENGTH: usize = 4096;

// Mutation pipeline
pub const DEFAULT_LEASE_SECS: u64 = 30;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const RETRY_BASE_DELAY_MS: u64 = 250;
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const RELAY_BATCH_SIZE: usize = 256;
pub const EVENT_RETENTION_SECS: u64 = 10 * 60;
pub const EVENT_PRUNE_INTERVAL_SECS: u64 = 60;

// Media metadata
pub const DEFAULT_OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";
pub const METADATA_CACHE_CAPACITY: usize = 512;
pub const FALLBACK_IMAGE_URL: &str =
    "https://cdn.pixabay.com/photo/2024/02/28/07/42/european-shorthair-8601492_640.jpg";
pub const FALLBACK_TITLE: &str = "Cant find video";
