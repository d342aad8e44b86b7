//! Queue persistence and media metadata collaborators

pub mod memory;
pub mod metadata;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryQueueStorage;
pub use metadata::{
    pick_images, CachedLookup, MediaMetadata, MetadataLookup, OEmbedLookup, Thumbnail,
};
pub use sqlite::{connect, SqliteQueueStorage};
pub use traits::{CurrentItem, NewQueueItem, QueueEntry, QueueItem, QueueStorage};
