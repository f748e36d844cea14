use axum::http::HeaderMap;

/// Header carrying the caller identity, injected by the authentication
/// layer in front of this daemon. The daemon itself never validates it; the
/// value is an opaque string used for lock ownership and broadcast
/// augmentation.
pub const IDENTITY_HEADER: &str = "x-batchline-user";

pub fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "anonymous".to_string())
}
