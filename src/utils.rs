use crate::error::AppError;

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep, timeout};
use tracing::warn;
use uuid::Uuid;

const PRUNE_THRESHOLD: usize = 1_024;

/// One async mutex per key, created on demand. Holders of a key's guard are serialized;
/// different keys never contend.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Hash + Eq + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            if locks.len() > PRUNE_THRESHOLD {
                // Entries only referenced by the map have no waiters.
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl<K: Hash + Eq + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded exponential backoff for transient provider and store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the policy is exhausted.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &'static str, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => break Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(error=%e, attempt, ?delay, "{what} failed; retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => break Err(e),
        }
    }
}

/// Treat a provider or store call that outlives `limit` as failed.
pub async fn bounded<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::Timeout(what))?
}

/// Name of the provider-side conference that carries a session's audio.
pub fn conference_name(session_id: Uuid) -> String {
    format!("session-{session_id}")
}
