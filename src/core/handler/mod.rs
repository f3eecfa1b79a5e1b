// src/core/handler/mod.rs

//! Handlers the interceptor wraps around the caller's handler.

pub mod cache_handler;
pub mod revalidation;

pub use cache_handler::CacheHandler;
pub use revalidation::{RevalidationHandler, RevalidationOutcome};
