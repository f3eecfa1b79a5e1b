// src/core/policy.rs

//! Storability rules: which responses may enter the cache and which of their
//! headers are kept.

use crate::core::directives::{CacheControlDirectives, is_vary_wildcard};
use crate::core::headers::Headers;
use http::Method;
use serde::{Deserialize, Serialize};

/// Whether the cache is shared between users (a proxy) or private to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Honors `s-maxage` and never stores `private` responses.
    #[default]
    Shared,
    /// Stores `private` responses and ignores `s-maxage`.
    Private,
}

/// Methods whose successful responses invalidate the cached resource.
pub fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Status codes this cache stores.
pub fn is_storable_status(status: u16) -> bool {
    matches!(status, 200 | 307)
}

/// Decides whether a response may be written to the store. Freshness is
/// checked separately.
pub fn is_storable(
    cache_type: CacheType,
    status: u16,
    request_headers: &Headers,
    response_headers: &Headers,
    directives: &CacheControlDirectives,
) -> bool {
    if !is_storable_status(status) || directives.no_store {
        return false;
    }
    if cache_type == CacheType::Shared
        && directives.private.as_ref().is_some_and(|p| p.is_all())
        && !directives.public
    {
        return false;
    }
    if response_headers.get("vary").is_some_and(is_vary_wildcard) {
        return false;
    }
    if request_headers.contains("authorization") && !directives.public {
        return false;
    }
    true
}

/// Removes hop-by-hop headers and any headers a qualified `no-cache` or
/// `private` directive forbids storing.
pub fn strip_headers(headers: &Headers, directives: &CacheControlDirectives) -> Headers {
    let mut stripped = headers.clone();

    if let Some(connection) = headers.get("connection") {
        for line in connection.as_slice() {
            for name in line.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                stripped.remove(name);
            }
        }
        stripped.remove("connection");
    }

    let scoped = [directives.no_cache.as_ref(), directives.private.as_ref()];
    for scope in scoped.into_iter().flatten() {
        for name in scope.header_names() {
            stripped.remove(name);
        }
    }

    stripped
}

/// A strong validator: a quoted opaque tag without the `W/` prefix.
pub fn is_strong_etag(etag: &str) -> bool {
    etag.len() >= 2 && etag.starts_with('"') && etag.ends_with('"')
}
