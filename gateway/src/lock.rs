//! C1 Lock Service. A single SQLite table of leased keys backs both the
//! per-conversation and per-user locks named in the design notes: nothing
//! in this corpus pulls in redis or etcd, and a lease row with an
//! expiry does the same job for a single-process gateway.
//!
//! Acquisition polls with a short sleep rather than blocking on a
//! condition variable, since contention is expected to be rare and brief
//! (one session finalizing while another starts).

use crate::error::LockError;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Inner {
    conn: Mutex<rusqlite::Connection>,
}

impl Inner {
    fn open(path: &Path) -> Result<Self, LockError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS locks (
                key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
             );",
        )?;
        Ok(Inner {
            conn: Mutex::new(conn),
        })
    }

    fn try_acquire(&self, key: &str, owner: &str, lease: Duration, now_ms: i64) -> Result<bool, LockError> {
        let conn = self.conn.lock();
        let expires_at_ms = now_ms + lease.as_millis() as i64;
        let changed = conn.execute(
            "INSERT INTO locks (key, owner, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms
             WHERE locks.expires_at_ms < ?4",
            rusqlite::params![key, owner, expires_at_ms, now_ms],
        )?;
        Ok(changed > 0)
    }

    fn renew(&self, key: &str, owner: &str, lease: Duration, now_ms: i64) -> Result<(), LockError> {
        let conn = self.conn.lock();
        let expires_at_ms = now_ms + lease.as_millis() as i64;
        let changed = conn.execute(
            "UPDATE locks SET expires_at_ms = ?1 WHERE key = ?2 AND owner = ?3",
            rusqlite::params![expires_at_ms, key, owner],
        )?;
        if changed == 0 {
            return Err(LockError::Release {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND owner = ?2",
            rusqlite::params![key, owner],
        )?;
        if changed == 0 {
            return Err(LockError::Release {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Owns the lock table and hands out [`LockGuard`]s. Cheap to clone; all
/// clones share the same connection behind a mutex.
#[derive(Clone)]
pub struct LockService {
    inner: Arc<Inner>,
}

impl LockService {
    pub fn open(path: &Path) -> Result<Self, LockError> {
        Ok(LockService {
            inner: Arc::new(Inner::open(path)?),
        })
    }

    /// In-memory variant for tests: same schema, a throwaway file-backed
    /// SQLite db under a temp directory the caller owns.
    #[cfg(test)]
    pub fn open_for_test(dir: &Path) -> Self {
        LockService::open(&dir.join("locks.db")).unwrap()
    }

    /// Blocks (async) until `key` is acquired under `owner` or `wait`
    /// elapses, then returns a guard that releases on drop. Mirrors
    /// `with_conversation_lock`/`with_user_lock` in the design notes: the
    /// caller picks the key namespace (`conversation:{uid}:{id}` or
    /// `user:{uid}`).
    pub async fn acquire(
        &self,
        key: impl Into<String>,
        owner: impl Into<String>,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockGuard, LockError> {
        let key = key.into();
        let owner = owner.into();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let inner = self.inner.clone();
            let (k, o) = (key.clone(), owner.clone());
            let got = tokio::task::spawn_blocking(move || inner.try_acquire(&k, &o, lease, now_ms()))
                .await
                .expect("lock backend task panicked")?;
            if got {
                return Ok(LockGuard {
                    service: self.clone(),
                    key,
                    owner,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Acquisition {
                    key,
                    wait_secs: wait.as_secs(),
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn renew(&self, key: &str, owner: &str, lease: Duration) -> Result<(), LockError> {
        let inner = self.inner.clone();
        let (k, o) = (key.to_string(), owner.to_string());
        tokio::task::spawn_blocking(move || inner.renew(&k, &o, lease, now_ms()))
            .await
            .expect("lock backend task panicked")
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let inner = self.inner.clone();
        let (k, o) = (key.to_string(), owner.to_string());
        tokio::task::spawn_blocking(move || inner.release(&k, &o))
            .await
            .expect("lock backend task panicked")
    }
}

/// Holds a lease on `key`. Dropping it releases the lease on a detached
/// task rather than synchronously, since `Drop` can't await; callers that
/// need the release observed (e.g. in a test) should call
/// [`LockGuard::release`] directly instead of letting it drop.
pub struct LockGuard {
    service: LockService,
    key: String,
    owner: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn renew(&self, lease: Duration) -> Result<(), LockError> {
        self.service.renew(&self.key, &self.owner, lease).await
    }

    /// Releases the lease and consumes the guard so `Drop` becomes a
    /// no-op (I6: a lock is released exactly once).
    pub async fn release(self) -> Result<(), LockError> {
        let result = self.service.release(&self.key, &self.owner).await;
        std::mem::forget(self);
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let service = self.service.clone();
        let key = self.key.clone();
        let owner = self.owner.clone();
        tokio::spawn(async move {
            let _ = service.release(&key, &owner).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_waits_until_first_releases() {
        let dir = tempfile::tempdir().unwrap();
        let service = LockService::open_for_test(dir.path());

        let guard = service
            .acquire("conversation:u1:c1", "holder-a", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();

        let service2 = service.clone();
        let waiter = tokio::spawn(async move {
            service2
                .acquire("conversation:u1:c1", "holder-b", Duration::from_millis(500), Duration::from_secs(5))
                .await
        });

        guard.release().await.unwrap();
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn acquire_times_out_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let service = LockService::open_for_test(dir.path());
        let _guard = service
            .acquire("user:u1", "holder-a", Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();

        let result = service
            .acquire("user:u1", "holder-b", Duration::from_millis(150), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(LockError::Acquisition { .. })));
    }

    #[tokio::test]
    async fn explicit_release_is_observed_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let service = LockService::open_for_test(dir.path());
        let guard = service
            .acquire("conversation:u1:c1", "holder-a", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();
        guard.release().await.unwrap();

        let reacquired = service
            .acquire("conversation:u1:c1", "holder-b", Duration::from_millis(200), Duration::from_secs(5))
            .await;
        assert!(reacquired.is_ok());
    }
}
