// src/core/freshness.rs

//! Freshness arithmetic and vary matching.
//!
//! Every timestamp here is Unix epoch milliseconds and every directive value
//! is seconds. Arithmetic saturates so absurd `max-age` values can't wrap.

use crate::core::directives::{CacheControlDirectives, parse_vary_names};
use crate::core::headers::{HeaderValue, Headers};
use crate::core::policy::CacheType;
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;

/// Freshness lifetime granted to `immutable` responses (one year).
pub const IMMUTABLE_LIFETIME_SECS: u64 = 31_536_000;

/// Lower-cased header name -> the request's value at store time, or `None`
/// when the request did not send it.
pub type VaryRecord = IndexMap<String, Option<String>>;

/// Records the request's value for every header named in `vary`.
pub fn parse_vary(vary: &HeaderValue, request_headers: &Headers) -> VaryRecord {
    parse_vary_names(vary)
        .into_iter()
        .map(|name| {
            let value = request_headers.get_joined(&name);
            (name, value)
        })
        .collect()
}

/// True when every recorded header matches the request, absent matching absent.
pub fn vary_matches(record: Option<&VaryRecord>, request_headers: &Headers) -> bool {
    let Some(record) = record else {
        return true;
    };
    record
        .iter()
        .all(|(name, expected)| request_headers.get_joined(name) == *expected)
}

/// When the response stops being fresh, or `None` if it carries no
/// freshness information.
pub fn compute_stale_at(
    now: i64,
    response_headers: &Headers,
    directives: &CacheControlDirectives,
    cache_type: CacheType,
) -> Option<i64> {
    if cache_type == CacheType::Shared {
        if let Some(s_maxage) = directives.s_maxage {
            return Some(add_seconds(now, s_maxage));
        }
    }
    if directives.immutable {
        return Some(add_seconds(now, IMMUTABLE_LIFETIME_SECS));
    }
    if let Some(max_age) = directives.max_age {
        return Some(add_seconds(now, max_age));
    }
    let expires = response_headers
        .first("expires")
        .and_then(parse_http_date)?;
    // now + (expires - now); a past Expires gives an already-stale entry.
    Some(now.saturating_add(expires.saturating_sub(now)))
}

/// When the entry must be dropped: the end of whichever stale window is
/// longest, measured from `stale_at`.
pub fn compute_delete_at(stale_at: i64, directives: &CacheControlDirectives) -> i64 {
    let swr = directives
        .stale_while_revalidate
        .map_or(stale_at, |s| add_seconds(stale_at, s));
    let sie = directives
        .stale_if_error
        .map_or(stale_at, |s| add_seconds(stale_at, s));
    stale_at.max(swr).max(sie)
}

/// Seconds since `cached_at`, rounded to the nearest second and never negative.
pub fn age_seconds(now: i64, cached_at: i64) -> u64 {
    let elapsed = now.saturating_sub(cached_at).max(0) as u64;
    (elapsed + 500) / 1000
}

pub(crate) fn add_seconds(at: i64, seconds: u64) -> i64 {
    let ms = seconds.saturating_mul(1000).min(i64::MAX as u64) as i64;
    at.saturating_add(ms)
}

/// Parses an HTTP-date in IMF-fixdate, RFC 850 or asctime form.
pub fn parse_http_date(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%A, %d-%b-%y %H:%M:%S GMT") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y") {
        return Some(dt.and_utc().timestamp_millis());
    }
    None
}

/// Formats epoch milliseconds as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
