//! In-memory lock backend used by tests; never used in production (§2.1 ambient stack).

use super::LockBackend;
use crate::error::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct InMemoryLockBackend {
    leases: Arc<Mutex<HashMap<String, (String, DateTime<Utc>)>>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(ttl: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().await;
        let now = Utc::now();
        let expired = leases
            .get(key)
            .map(|(_, expires_at)| *expires_at <= now)
            .unwrap_or(true);
        if expired {
            leases.insert(key.to_string(), (token.to_string(), Self::expiry(ttl)));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(key) {
            Some((held_token, expires_at)) if held_token == token => {
                *expires_at = Self::expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some((held_token, _)) if held_token == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(key)
            .map(|(_, expires_at)| *expires_at > Utc::now())
            .unwrap_or(false))
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let leases = self.leases.lock().await;
        Ok(leases.get(key).map(|(token, _)| token.clone()))
    }
}
