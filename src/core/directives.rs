// src/core/directives.rs

//! Parsing for the `Cache-Control` and `Vary` headers.
//!
//! Parsing never fails. Unknown directives are skipped, numeric directives
//! with a bad value are left unset, and the last valid occurrence of a
//! repeated directive wins.

use crate::core::headers::{HeaderValue, Headers};

/// The scope of a `no-cache` or `private` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveScope {
    /// The directive applies to the whole response.
    All,
    /// The directive names specific header fields (`no-cache="set-cookie"`).
    Headers(Vec<String>),
}

impl DirectiveScope {
    pub fn is_all(&self) -> bool {
        matches!(self, DirectiveScope::All)
    }

    pub fn header_names(&self) -> &[String] {
        match self {
            DirectiveScope::All => &[],
            DirectiveScope::Headers(names) => names,
        }
    }
}

/// A structured view of one `Cache-Control` header. Durations are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControlDirectives {
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub stale_while_revalidate: Option<u64>,
    pub stale_if_error: Option<u64>,
    pub min_fresh: Option<u64>,
    /// `max-stale` without a value accepts any staleness and is stored as `u64::MAX`.
    pub max_stale: Option<u64>,
    pub public: bool,
    pub private: Option<DirectiveScope>,
    pub no_store: bool,
    pub no_cache: Option<DirectiveScope>,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub immutable: bool,
    pub no_transform: bool,
    pub must_understand: bool,
    pub only_if_cached: bool,
}

impl CacheControlDirectives {
    /// Parses the `cache-control` header out of a header map. A missing header
    /// yields an empty directive set.
    pub fn from_headers(headers: &Headers) -> Self {
        headers
            .get("cache-control")
            .map(parse_cache_control)
            .unwrap_or_default()
    }
}

/// Parses a `Cache-Control` value. Repeated header lines are treated exactly
/// like one comma-joined line.
pub fn parse_cache_control(value: &HeaderValue) -> CacheControlDirectives {
    parse_cache_control_str(&value.joined())
}

pub fn parse_cache_control_str(value: &str) -> CacheControlDirectives {
    let mut directives = CacheControlDirectives::default();
    let lowered = value.to_ascii_lowercase();
    let tokens: Vec<&str> = lowered.split(',').collect();
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i].trim();
        i += 1;
        if token.is_empty() {
            continue;
        }

        let (name, raw_value) = match token.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().to_string())),
            None => (token, None),
        };

        let value = match raw_value {
            Some(v) if v.starts_with('"') => {
                // A quoted value may contain commas. Look ahead for the
                // closing quote; without one only this directive is dropped.
                let mut quoted = v;
                let mut end = i;
                while !is_closed_quote(&quoted) && end < tokens.len() {
                    quoted.push(',');
                    quoted.push_str(tokens[end]);
                    end += 1;
                }
                if !is_closed_quote(&quoted) {
                    continue;
                }
                i = end;
                Some(unquote(quoted.trim()))
            }
            other => other,
        };

        apply_directive(&mut directives, name, value);
    }

    directives
}

fn apply_directive(d: &mut CacheControlDirectives, name: &str, value: Option<String>) {
    match name {
        "max-age" => set_seconds(&mut d.max_age, value),
        "s-maxage" => set_seconds(&mut d.s_maxage, value),
        "stale-while-revalidate" => set_seconds(&mut d.stale_while_revalidate, value),
        "stale-if-error" => set_seconds(&mut d.stale_if_error, value),
        "min-fresh" => set_seconds(&mut d.min_fresh, value),
        "max-stale" => match value {
            None => d.max_stale = Some(u64::MAX),
            some => set_seconds(&mut d.max_stale, some),
        },
        "public" => d.public = true,
        "private" => d.private = Some(scope_from(value)),
        "no-store" => d.no_store = true,
        "no-cache" => d.no_cache = Some(scope_from(value)),
        "must-revalidate" => d.must_revalidate = true,
        "proxy-revalidate" => d.proxy_revalidate = true,
        "immutable" => d.immutable = true,
        "no-transform" => d.no_transform = true,
        "must-understand" => d.must_understand = true,
        "only-if-cached" => d.only_if_cached = true,
        _ => {}
    }
}

/// Only a well-formed non-negative integer replaces the current value.
fn set_seconds(slot: &mut Option<u64>, value: Option<String>) {
    if let Some(seconds) = value.and_then(|v| v.parse::<u64>().ok()) {
        *slot = Some(seconds);
    }
}

fn scope_from(value: Option<String>) -> DirectiveScope {
    let names: Vec<String> = value
        .iter()
        .flat_map(|v| v.split(','))
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        DirectiveScope::All
    } else {
        DirectiveScope::Headers(names)
    }
}

/// True when `s` opens with a quote and ends with an unescaped closing quote.
fn is_closed_quote(s: &str) -> bool {
    let s = s.trim_end();
    if s.len() < 2 || !s.starts_with('"') || !s.ends_with('"') {
        return false;
    }
    let body = &s[1..s.len() - 1];
    let trailing_backslashes = body.bytes().rev().take_while(|&b| b == b'\\').count();
    trailing_backslashes % 2 == 0
}

fn unquote(s: &str) -> String {
    let inner = &s[1..s.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits a `Vary` value into lower-cased header names.
pub fn parse_vary_names(value: &HeaderValue) -> Vec<String> {
    value
        .as_slice()
        .iter()
        .flat_map(|line| line.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

/// `Vary: *` makes a response uncacheable.
pub fn is_vary_wildcard(value: &HeaderValue) -> bool {
    parse_vary_names(value).iter().any(|n| n == "*")
}
