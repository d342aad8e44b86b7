//! Canonical media links
//!
//! Accepts YouTube watch, embed, `/v/` and `youtu.be` links (with or without
//! a scheme) and extracts the 11 character video id. Playlist watch links
//! are rejected.

use url::Url;

use crate::error::{JukeboxError, Result};

const MEDIA_ID_LEN: usize = 11;

fn is_media_id(candidate: &str) -> bool {
    candidate.len() == MEDIA_ID_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let url = Url::parse(&candidate).ok()?;
    match url.scheme() {
        "http" | "https" => Some(url),
        _ => None,
    }
}

/// Extract the canonical media id from a link
pub fn extract_media_id(raw: &str) -> Option<String> {
    let url = parse(raw)?;
    let host = url.host_str()?.to_ascii_lowercase();

    let id = match host.as_str() {
        "youtu.be" => {
            let mut segments = url.path_segments()?;
            let id = segments.next()?;
            if segments.any(|s| !s.is_empty()) {
                return None;
            }
            id.to_string()
        }
        "youtube.com" | "www.youtube.com" | "m.youtube.com" => {
            let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
            match segments.as_slice() {
                ["watch"] => {
                    if url.query_pairs().any(|(key, _)| key == "list") {
                        return None;
                    }
                    url.query_pairs()
                        .find(|(key, _)| key == "v")
                        .map(|(_, value)| value.into_owned())?
                }
                ["embed", id] | ["v", id] => id.to_string(),
                _ => return None,
            }
        }
        _ => return None,
    };

    if is_media_id(&id) {
        Some(id)
    } else {
        None
    }
}

/// Validate a submitted link and return its media id
pub fn validate_media_link(raw: &str) -> Result<String> {
    extract_media_id(raw).ok_or(JukeboxError::InvalidMediaLink)
}
