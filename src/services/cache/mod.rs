//! Cache module
//!
//! Key/value store with per-key expiry and atomic increment, backing the
//! login throttle and the session-validity markers.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::{CacheConfig, CacheDriver};
use crate::error::CacheError;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

pub type SharedCache = Arc<dyn Cache>;

#[async_trait]
pub trait Cache: Send + Sync {
    /// Value for `key`, or an empty string when the key is absent or expired
    async fn get(&self, key: &str) -> Result<String, CacheError>;

    /// Store `value`, clearing any expiry previously set on `key`
    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Set the time-to-live of an existing key; no-op when absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Remaining time-to-live; zero when the key is absent or has no expiry
    async fn ttl(&self, key: &str) -> Result<Duration, CacheError>;

    /// Increment the integer stored at `key`, creating it as 1 when absent
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;
}

/// Build the configured cache backend.
///
/// The in-process backend starts its sweeper, which stops once `shutdown`
/// flips to `true`.
pub async fn build_cache(
    config: &CacheConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<SharedCache, CacheError> {
    match config.driver {
        CacheDriver::Memory => {
            tracing::info!("Using in-process cache");
            Ok(Arc::new(MemoryCache::with_sweeper(shutdown)))
        }
        CacheDriver::Redis => {
            tracing::info!("Using redis cache at {}", config.redis_url);
            Ok(Arc::new(RedisCache::connect(&config.redis_url).await?))
        }
    }
}
