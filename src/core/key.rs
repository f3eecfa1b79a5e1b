// src/core/key.rs

use crate::core::errors::CacheError;
use crate::core::headers::Headers;
use http::Method;

/// Identifies a cacheable request.
///
/// Slots are addressed by `origin + path` and `method`. The request headers
/// only take part in vary matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    origin: String,
    path: String,
    method: Method,
    headers: Headers,
}

impl CacheKey {
    pub fn new(
        origin: impl Into<String>,
        path: impl Into<String>,
        method: Method,
        headers: Headers,
    ) -> Result<Self, CacheError> {
        let origin = origin.into();
        let path = path.into();
        if origin.is_empty() {
            return Err(CacheError::InvalidArgument(
                "cache key origin must not be empty".into(),
            ));
        }
        if !path.starts_with('/') {
            return Err(CacheError::InvalidArgument(format!(
                "cache key path must start with '/', got '{path}'"
            )));
        }
        Ok(Self {
            origin,
            path,
            method,
            headers,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The resource identifier shared by every method and variant of this URL.
    pub fn resource_id(&self) -> String {
        format!("{}{}", self.origin, self.path)
    }
}
