//! Login throttling and session-validity memoization on top of the cache

use std::future::Future;
use std::time::Duration;

use chrono::Utc;

use crate::error::{CacheError, StoreError};
use crate::services::cache::SharedCache;

/// Failed attempts tolerated before login is refused
pub const MAX_LOGIN_ATTEMPTS: i64 = 5;

/// Sliding window of the attempt counter
pub const LOGIN_ATTEMPT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// How long a verified session is trusted without asking the provider
pub const SESSION_VALIDITY: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Clone)]
pub struct Store {
    cache: SharedCache,
}

impl Store {
    pub fn new(cache: SharedCache) -> Self {
        Self { cache }
    }

    fn login_count_key(user_type: &str, account: &str) -> String {
        format!("secure-proxy:user:{user_type}:{account}:login-count")
    }

    fn session_key(session_id: &str) -> String {
        format!("secure-proxy:session:{session_id}")
    }

    /// Reject once more than five failed attempts are on record.
    ///
    /// Check and record are separate cache operations, so concurrent
    /// attempts for one account can all pass the check before any of them
    /// is counted.
    pub async fn can_login(&self, user_type: &str, account: &str) -> Result<(), StoreError> {
        let key = Self::login_count_key(user_type, account);
        let value = self.cache.get(&key).await?;
        if value.is_empty() {
            return Ok(());
        }

        let attempts: i64 = value.parse().unwrap_or_default();
        if attempts <= MAX_LOGIN_ATTEMPTS {
            return Ok(());
        }

        let retry_after = self.cache.ttl(&key).await?;
        Err(StoreError::TooManyAttempts { retry_after })
    }

    /// Count a failed attempt. The window restarts on every call.
    pub async fn record_login_attempt(
        &self,
        user_type: &str,
        account: &str,
    ) -> Result<i64, StoreError> {
        let key = Self::login_count_key(user_type, account);
        let attempts = self.cache.incr(&key).await?;
        self.cache.expire(&key, LOGIN_ATTEMPT_WINDOW).await?;
        Ok(attempts)
    }

    /// True when the session is still valid, re-running `verify` at most
    /// once per validity window. Errors from `verify` are returned as-is.
    pub async fn validate_session<F, Fut, E>(&self, session_id: &str, verify: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: From<CacheError>,
    {
        let key = Self::session_key(session_id);
        if !self.cache.get(&key).await?.is_empty() {
            return Ok(true);
        }

        let valid = verify().await?;
        if valid {
            self.cache.set(&key, &Utc::now().to_rfc3339()).await?;
            self.cache.expire(&key, SESSION_VALIDITY).await?;
        }

        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::AppError;
    use crate::services::cache::{Cache, MemoryCache};

    fn store() -> (Store, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        (Store::new(cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_five_attempts_allowed_sixth_denied() {
        let (store, _) = store();
        store.can_login("local", "alice").await.unwrap();

        for _ in 0..5 {
            store.record_login_attempt("local", "alice").await.unwrap();
        }
        assert!(store.can_login("local", "alice").await.is_ok());

        assert_eq!(store.record_login_attempt("local", "alice").await.unwrap(), 6);
        match store.can_login("local", "alice").await {
            Err(StoreError::TooManyAttempts { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= LOGIN_ATTEMPT_WINDOW);
            }
            other => panic!("expected throttling, got {:?}", other),
        }

        // other accounts and provider types are independent
        assert!(store.can_login("ldap", "alice").await.is_ok());
        assert!(store.can_login("local", "bob").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_window_slides() {
        let (store, _) = store();
        for _ in 0..6 {
            store.record_login_attempt("local", "alice").await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        store.record_login_attempt("local", "alice").await.unwrap();

        // 18 minutes after the first failure, still blocked
        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert!(store.can_login("local", "alice").await.is_err());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert!(store.can_login("local", "alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_garbage_counter_counts_as_zero() {
        let (store, cache) = store();
        cache
            .set("secure-proxy:user:local:alice:login-count", "junk")
            .await
            .unwrap();
        assert!(store.can_login("local", "alice").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_session_memoizes() {
        let (store, _) = store();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let verify = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(true)
        };

        assert!(store.validate_session("s1", verify).await.unwrap());
        assert!(store.validate_session("s1", verify).await.unwrap());
        tokio::time::advance(Duration::from_secs(5 * 60 * 60)).await;
        assert!(store.validate_session("s1", verify).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
        assert!(store.validate_session("s1", verify).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_session_is_not_memoized() {
        let (store, _) = store();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let verify = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(false)
        };

        assert!(!store.validate_session("s2", verify).await.unwrap());
        assert!(!store.validate_session("s2", verify).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_verify_errors_propagate() {
        #[derive(Debug, PartialEq)]
        enum TestError {
            Cache(CacheError),
            Directory,
        }
        impl From<CacheError> for TestError {
            fn from(err: CacheError) -> Self {
                TestError::Cache(err)
            }
        }

        let (store, _) = store();
        let result = store
            .validate_session("s3", || async { Err::<bool, _>(TestError::Directory) })
            .await;
        assert_eq!(result, Err(TestError::Directory));
    }
}
