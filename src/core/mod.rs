// src/core/mod.rs

//! The central module containing the caching engine: directive parsing,
//! freshness rules, stores, and the interceptor that ties them together.

pub mod clock;
pub mod directives;
pub mod dispatch;
pub mod errors;
pub mod freshness;
pub mod handler;
pub mod headers;
pub mod interceptor;
pub mod key;
pub mod metrics;
pub mod policy;
pub mod stats;
pub mod storage;
pub mod tasks;

pub use dispatch::{DispatchRequest, Dispatcher};
pub use errors::{CacheError, DispatchError};
pub use headers::{HeaderValue, Headers};
pub use interceptor::{CacheInterceptor, CacheOptions};
pub use key::CacheKey;
pub use policy::CacheType;
pub use storage::{CacheStore, MemoryStore, PersistentStore};
