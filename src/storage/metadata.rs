//! Media metadata lookup
//!
//! Titles and thumbnails come from an oEmbed endpoint. Results are kept in a
//! small LRU cache since the same link is often submitted again after it has
//! played.

use async_trait::async_trait;
use log::debug;
use lru::LruCache;
use reqwest::StatusCode;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::constants::{FALLBACK_IMAGE_URL, METADATA_CACHE_CAPACITY};
use crate::error::{JukeboxError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub url: String,
    pub width: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub thumbnails: Vec<Thumbnail>,
}

#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// Fetch metadata for a media id. `NotFound` means the media does not
    /// exist; other errors are transient.
    async fn lookup(&self, media_id: &str) -> Result<MediaMetadata>;
}

/// Choose (small, big) thumbnail urls: big is the widest, small the second
/// widest. Falls back to a fixed image when there are none.
pub fn pick_images(thumbnails: &[Thumbnail]) -> (String, String) {
    let mut sorted: Vec<&Thumbnail> = thumbnails.iter().filter(|t| !t.url.is_empty()).collect();
    sorted.sort_by_key(|t| t.width);

    match sorted.as_slice() {
        [] => (FALLBACK_IMAGE_URL.to_string(), FALLBACK_IMAGE_URL.to_string()),
        [only] => (only.url.clone(), only.url.clone()),
        [.., small, big] => (small.url.clone(), big.url.clone()),
    }
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    title: Option<String>,
    thumbnail_url: Option<String>,
    thumbnail_width: Option<u32>,
}

/// Lookup backed by an oEmbed HTTP endpoint
pub struct OEmbedLookup {
    client: reqwest::Client,
    endpoint: String,
}

impl OEmbedLookup {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl MetadataLookup for OEmbedLookup {
    async fn lookup(&self, media_id: &str) -> Result<MediaMetadata> {
        let watch_url = format!("https://www.youtube.com/watch?v={}", media_id);
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("url", watch_url.as_str()), ("format", "json")])
            .send()
            .await?;

        match resp.status() {
            // oEmbed answers 401 for embeds that are private or disabled
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST => {
                return Err(JukeboxError::NotFound("Video not found".to_string()));
            }
            status if !status.is_success() => {
                return Err(JukeboxError::LookupError(format!(
                    "oEmbed endpoint returned {}",
                    status
                )));
            }
            _ => {}
        }

        let body: OEmbedResponse = resp.json().await?;
        let thumbnails = body
            .thumbnail_url
            .map(|url| {
                vec![Thumbnail {
                    url,
                    width: body.thumbnail_width.unwrap_or(0),
                }]
            })
            .unwrap_or_default();

        Ok(MediaMetadata {
            title: body.title,
            thumbnails,
        })
    }
}

/// Caches successful lookups of an inner lookup
pub struct CachedLookup {
    inner: Arc<dyn MetadataLookup>,
    cache: Mutex<LruCache<String, MediaMetadata>>,
}

impl CachedLookup {
    pub fn new(inner: Arc<dyn MetadataLookup>) -> Self {
        Self::with_capacity(inner, METADATA_CACHE_CAPACITY)
    }

    pub fn with_capacity(inner: Arc<dyn MetadataLookup>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl MetadataLookup for CachedLookup {
    async fn lookup(&self, media_id: &str) -> Result<MediaMetadata> {
        if let Some(hit) = self.cache.lock().await.get(media_id) {
            debug!("Metadata cache hit for {}", media_id);
            return Ok(hit.clone());
        }

        let metadata = self.inner.lookup(media_id).await?;
        self.cache
            .lock()
            .await
            .put(media_id.to_string(), metadata.clone());
        Ok(metadata)
    }
}
