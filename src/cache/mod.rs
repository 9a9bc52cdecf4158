//! Pass-through cache in front of the RPC layer.
//!
//! The cache stores already-serialized bytes under namespaced keys. It is an
//! optimization only: callers treat a backend error as a miss on reads and a
//! no-op on writes, so a dead Redis never stalls the pipeline.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;

use crate::error::CacheError;

mod memory;
mod redis;

pub use memory::MemoryCache;
pub use redis::RedisCache;

/// Object-safe async key-value store with optional per-entry TTL.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;
}

/// Builds a `{namespace}:{kind}:{identity}` key.
#[must_use]
pub fn cache_key(namespace: &str, kind: &str, identity: impl Display) -> String {
    format!("{namespace}:{kind}:{identity}")
}
