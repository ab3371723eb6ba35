//! Redis-backed coordination: the per-(challenge, team) instance lock and
//! the authenticator token cache. Both are shared across workers, so redis
//! is the only place the mutual exclusion lives.

use std::future::Future;
use std::time::Duration;

use log::warn;
use nanoid::nanoid;
use redis::{AsyncCommands, ExistenceCheck, Script, SetExpiry, SetOptions, aio::ConnectionManager};

use crate::error::{Error, Result};

// Deletes the key only when the caller still holds it; a lock whose lease
// already expired must not clobber the next holder.
const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end";

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn lock_key(prefix: &str, challenge: &str, team_id: &str) -> String {
    format!("{prefix}:locks:instance:{challenge}:{team_id}")
}

fn token_key(prefix: &str, token: &str) -> String {
    format!("{prefix}:tokens:{token}")
}

#[derive(Clone)]
pub struct LockService {
    conn: ConnectionManager,
    prefix: String,
    lease: Duration,
    blocking: Duration,
}

impl LockService {
    pub fn new(
        conn: ConnectionManager,
        prefix: &str,
        lease_seconds: u64,
        blocking_seconds: u64,
    ) -> Self {
        Self {
            conn,
            prefix: prefix.to_owned(),
            lease: Duration::from_secs(lease_seconds),
            blocking: Duration::from_secs(blocking_seconds),
        }
    }

    /// Runs `body` while holding the (challenge, team) lock. Acquisition
    /// blocks up to the configured blocking timeout and fails the operation
    /// with CONFLICT on expiry; the lease bounds how long the key stays
    /// locked if this worker dies mid-body. Release happens on every exit
    /// path.
    pub async fn with_lock<T>(
        &self,
        challenge: &str,
        team_id: &str,
        body: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let key = lock_key(&self.prefix, challenge, team_id);
        let token = nanoid!();

        if !self.acquire(&key, &token).await? {
            return Err(Error::OperationInProgress);
        }

        let out = body.await;

        if let Err(err) = self.release(&key, &token).await {
            warn!("Failed to release instance lock {key}: {err}");
        }

        out
    }

    async fn acquire(&self, key: &str, token: &str) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.blocking;

        loop {
            let options = SetOptions::default()
                .conditional_set(ExistenceCheck::NX)
                .with_expiration(SetExpiry::PX(self.lease.as_millis() as u64));
            let mut conn = self.conn.clone();
            let acquired: bool = conn.set_options(key, token, options).await?;
            if acquired {
                return Ok(true);
            }
            if tokio::time::Instant::now() + ACQUIRE_POLL_INTERVAL > deadline {
                return Ok(false);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Authenticator token to team-id cache with a TTL, so platform lookups do
/// not hit the upstream on every request.
#[derive(Clone)]
pub struct TokenCache {
    conn: ConnectionManager,
    prefix: String,
    ttl: u64,
}

impl TokenCache {
    pub fn new(conn: ConnectionManager, prefix: &str, ttl_seconds: u64) -> Self {
        Self {
            conn,
            prefix: prefix.to_owned(),
            ttl: ttl_seconds,
        }
    }

    pub async fn put(&self, token: &str, team_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(token_key(&self.prefix, token), team_id, self.ttl)
            .await?;
        Ok(())
    }

    pub async fn get(&self, token: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(token_key(&self.prefix, token)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_scoped_per_challenge_and_team() {
        assert_eq!(
            lock_key("wd", "web1", "team-a"),
            "wd:locks:instance:web1:team-a"
        );
        assert_ne!(
            lock_key("wd", "web1", "team-a"),
            lock_key("wd", "web1", "team-b")
        );
    }

    #[test]
    fn token_keys_are_scoped_per_token() {
        assert_eq!(token_key("wd", "abc123"), "wd:tokens:abc123");
    }
}
