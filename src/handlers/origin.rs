//! Origin checks for the WebSocket upgrade

/// Whether a WebSocket upgrade from `origin` may proceed.
///
/// Requests without an Origin header come from non-browser clients and are
/// accepted. Browser origins must be listed; with no list configured,
/// development mode admits localhost origins only.
pub fn validate_origin(origin: Option<&str>, allowed_origins: &[String], development_mode: bool) -> bool {
    let Some(origin_value) = origin else {
        return true;
    };

    if allowed_origins.iter().any(|allowed| origin_value == allowed) {
        return true;
    }

    if development_mode && allowed_origins.is_empty() {
        let local = is_localhost(origin_value);
        if local {
            log::debug!("Development mode: allowing localhost origin {}", origin_value);
        }
        return local;
    }

    log::warn!("Origin rejected: {} (not in allowed list)", origin_value);
    false
}

fn is_localhost(origin: &str) -> bool {
    ["http://localhost", "https://localhost", "http://127.0.0.1", "https://127.0.0.1"]
        .iter()
        .any(|prefix| {
            origin
                .strip_prefix(prefix)
                .map(|rest| rest.is_empty() || rest.starts_with(':'))
                .unwrap_or(false)
        })
}
