use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, ErrorKind, RedisError};
use async_trait::async_trait;

use super::Cache;
use crate::error::CacheError;

/// Shared cache on a Redis server, for multi-instance deployments
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url).map_err(backend_error)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(backend_error)?;
        Ok(Self { conn })
    }
}

fn backend_error(err: RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(backend_error)?;
        Ok(value.unwrap_or_default())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(backend_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64)
            .await
            .map_err(backend_error)
    }

    async fn ttl(&self, key: &str) -> Result<Duration, CacheError> {
        let mut conn = self.conn.clone();
        // -2 = missing key, -1 = no expiry
        let secs: i64 = conn.ttl(key).await.map_err(backend_error)?;
        Ok(Duration::from_secs(secs.max(0) as u64))
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1i64).await.map_err(|err| {
            if err.kind() == ErrorKind::ResponseError
                && (err.to_string().contains("not an integer")
                    || err.to_string().contains("would overflow"))
            {
                CacheError::NotANumber(key.to_string())
            } else {
                backend_error(err)
            }
        })
    }
}
