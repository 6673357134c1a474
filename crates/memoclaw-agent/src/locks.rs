//! Per-session lock table
//!
//! One tokio mutex per session key, created on first use and kept for the
//! life of the process. Tokio's mutex queues waiters FIFO, so a busy session
//! cannot starve any single turn.

use dashmap::DashMap;
use memoclaw_core::SessionKey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

pub struct SessionLocks {
    locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    /// Waits longer than this are logged. Zero disables the warning.
    warn_after: Duration,
}

/// Exclusive access to one session. Released on drop, on every exit path.
pub struct SessionGuard {
    key: SessionKey,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!("Released lock for {} after {:?}", self.key, self.acquired_at.elapsed());
    }
}

impl Default for SessionLocks {
    fn default() -> Self { Self::new(Duration::ZERO) }
}

impl SessionLocks {
    pub fn new(warn_after: Duration) -> Self {
        Self { locks: DashMap::new(), warn_after }
    }

    fn entry(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &SessionKey) -> SessionGuard {
        let lock = self.entry(key);
        let started = Instant::now();

        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) if self.warn_after.is_zero() => lock.lock_owned().await,
            Err(_) => {
                let wait = lock.lock_owned();
                tokio::pin!(wait);
                loop {
                    match tokio::time::timeout(self.warn_after, &mut wait).await {
                        Ok(guard) => break guard,
                        Err(_) => warn!(
                            session = %key,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Still waiting for session lock"
                        ),
                    }
                }
            }
        };

        let waited = started.elapsed();
        if waited > Duration::from_millis(1) {
            debug!("Acquired lock for {} after waiting {:?}", key, waited);
        }
        SessionGuard { key: key.clone(), acquired_at: Instant::now(), _guard: guard }
    }

    /// Take the lock only if nobody holds it and nobody is queued for it.
    pub fn try_acquire(&self, key: &SessionKey) -> Option<SessionGuard> {
        let guard = self.entry(key).try_lock_owned().ok()?;
        Some(SessionGuard { key: key.clone(), acquired_at: Instant::now(), _guard: guard })
    }

    pub fn is_locked(&self, key: &SessionKey) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys ever locked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let locks = SessionLocks::default();
        let key = SessionKey::new("tg:1");
        let guard = locks.acquire(&key).await;
        assert!(locks.is_locked(&key));
        assert!(locks.try_acquire(&key).is_none());
        drop(guard);
        assert!(!locks.is_locked(&key));
        assert!(locks.try_acquire(&key).is_some());
    }

    #[tokio::test]
    async fn entries_persist_after_release() {
        let locks = SessionLocks::default();
        drop(locks.acquire(&SessionKey::new("a")).await);
        drop(locks.acquire(&SessionKey::new("b")).await);
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn unseen_key_is_not_locked() {
        let locks = SessionLocks::default();
        assert!(!locks.is_locked(&SessionKey::new("never")));
        assert!(locks.is_empty());
    }
}
