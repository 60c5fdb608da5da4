//! Distributed lock manager (§4.1).
//!
//! Generalizes the renew-at-`ttl/2`, compare-and-set-on-token discipline that
//! this crate's ancestor used for its cron-job leases, but separates the
//! "who owns this key" question (this module) from "what state does the job
//! record hold" (`crate::store`) — the two were a single `Repo` trait before;
//! here they are independent collaborators the way §4.8's orchestrator wires
//! them together.

pub mod memory;
pub mod sql;

use crate::error::LockError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use rand::RngCore;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Atomic primitives a concrete lock store must provide. Implementations
/// must make `try_acquire`/`extend`/`release` single atomic operations
/// against their backing store (compare-and-set semantics) — the
/// `LockManager` above this trait assumes no other coordination.
#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;
    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;
    async fn holder(&self, key: &str) -> Result<Option<String>, LockError>;
}

/// A held lease. Carries the token used for compare-and-set release/extend
/// and a flag the background renewal task flips if it ever fails to extend
/// the lease (§4.1: "renewal is best-effort").
pub struct Lock {
    pub key: String,
    token: String,
    pub expires_at: DateTime<Utc>,
    lost: Arc<AtomicBool>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Lock {
    /// True once the background renewer has observed a failed `extend`.
    /// Callers must guard critical writes with store-side preconditions
    /// (status/version) rather than trusting this flag alone, per §4.1.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Coordinates acquisition, renewal, and release of named leases.
pub struct LockManager<B: LockBackend> {
    node_id: String,
    backend: Arc<B>,
}

impl<B: LockBackend> LockManager<B> {
    pub fn new(node_id: impl Into<String>, backend: B) -> Self {
        Self {
            node_id: node_id.into(),
            backend: Arc::new(backend),
        }
    }

    /// `node_id || random` token, assigned once per acquisition (§4.1).
    fn new_token(&self) -> String {
        let mut rand_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut rand_bytes);
        format!("{}:{}", self.node_id, BASE64.encode(rand_bytes))
    }

    /// Attempts to acquire `key`, retrying up to `retries` times with a fixed
    /// delay. On success, spawns a background task that extends the lease at
    /// `ttl/2` for as long as the lock is held.
    pub async fn acquire(
        &self,
        key: impl Into<String>,
        ttl: Duration,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<Option<Lock>, LockError> {
        let key = key.into();
        let token = self.new_token();

        for attempt in 0..=retries {
            if self.backend.try_acquire(&key, &token, ttl).await? {
                debug!("acquired lock {key} (attempt {attempt})");
                return Ok(Some(self.start_renewal(key, token, ttl)));
            }
            if attempt < retries {
                tokio::time::sleep(retry_delay).await;
            }
        }
        trace!("failed to acquire lock {key} after {retries} retries");
        Ok(None)
    }

    fn start_renewal(&self, key: String, token: String, ttl: Duration) -> Lock {
        let lost = Arc::new(AtomicBool::new(false));
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let backend = Arc::clone(&self.backend);
        let renew_key = key.clone();
        let renew_token = token.clone();
        let renew_lost = Arc::clone(&lost);

        tokio::spawn(async move {
            let refresh_interval = ttl / 2;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(refresh_interval) => {}
                    _ = &mut cancel_rx => {
                        trace!("lock renewal for {renew_key} cancelled");
                        return;
                    }
                }
                match backend.extend(&renew_key, &renew_token, ttl).await {
                    Ok(true) => trace!("lock {renew_key} renewed"),
                    Ok(false) => {
                        warn!("lock {renew_key} renewal lost: token no longer matches");
                        renew_lost.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        warn!("lock {renew_key} renewal failed: {e}");
                        renew_lost.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });

        Lock {
            key,
            token,
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
            lost,
            cancel: Some(cancel_tx),
        }
    }

    /// Atomically deletes the lease if the token still matches, and stops
    /// the renewal task regardless of outcome.
    pub async fn release(&self, mut lock: Lock) -> Result<bool, LockError> {
        if let Some(cancel) = lock.cancel.take() {
            let _ = cancel.send(());
        }
        self.backend.release(&lock.key, &lock.token).await
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        self.backend.is_locked(key).await
    }

    pub async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        self.backend.holder(key).await
    }

    /// Acquire → run → release, with guaranteed release on all exit paths
    /// including the closure returning an error.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        key: impl Into<String>,
        ttl: Duration,
        retries: u32,
        retry_delay: Duration,
        f: F,
    ) -> Result<Option<Result<T, E>>, LockError>
    where
        F: FnOnce(&Lock) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = key.into();
        let lock = match self.acquire(key, ttl, retries, retry_delay).await? {
            Some(lock) => lock,
            None => return Ok(None),
        };
        let outcome = f(&lock).await;
        self.release(lock).await?;
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::memory::InMemoryLockBackend;

    #[tokio::test]
    async fn exactly_one_of_two_concurrent_acquires_succeeds() {
        // S6: two nodes race for the same key.
        let backend = InMemoryLockBackend::new();
        let a = LockManager::new("node-a", backend.clone());
        let b = LockManager::new("node-b", backend.clone());

        let lock_a = a
            .acquire("import-job:x", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap();
        let lock_b = b
            .acquire("import-job:x", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap();

        assert!(lock_a.is_some());
        assert!(lock_b.is_none());

        a.release(lock_a.unwrap()).await.unwrap();

        let lock_b_retry = b
            .acquire("import-job:x", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap();
        assert!(lock_b_retry.is_some());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let backend = InMemoryLockBackend::new();
        let mgr = LockManager::new("node-a", backend.clone());

        let result: Option<Result<(), &str>> = mgr
            .with_lock(
                "stale-job-cleanup",
                Duration::from_secs(5),
                0,
                Duration::ZERO,
                |_lock| async { Err("boom") },
            )
            .await
            .unwrap();
        assert_eq!(result, Some(Err("boom")));

        assert!(!mgr.is_locked("stale-job-cleanup").await.unwrap());
    }
}
