//! Redis [`LockStore`] for `tenantcore` distributed locks.
//!
//! Acquisition is a single `SET key token NX PX ttl`. Release runs a Lua
//! compare-and-delete, so reading the holder and deleting the key happen
//! atomically on the server.
//!
//! ```ignore
//! let config = TenantcoreConfig::from_env()?;
//! let locks = tenantcore_redis::connect_lock(&config.redis, &config.lock).await?;
//! let guard = locks.lock("invoice:42", config.lock.ttl, config.lock.acquire_timeout()).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionInfo, IntoConnectionInfo, RedisError, Script};
use tenantcore::config::{LockSettings, RedisSettings};
use tenantcore::errors::BoxError;
use tenantcore::lock::{DistributedLock, LockStore, ReleaseOutcome};
use thiserror::Error;
use tracing::info;

/// Deletes `KEYS[1]` only if it still holds `ARGV[1]`.
///
/// Replies `{1, value}` when deleted, `{0, current}` otherwise.
const COMPARE_AND_DELETE: &str = r"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return {1, current}
end
return {0, current}
";

/// Errors raised while connecting to Redis.
#[derive(Debug, Error)]
pub enum RedisLockStoreError {
    /// The URL could not be parsed.
    #[error("invalid redis url")]
    InvalidUrl(#[source] RedisError),
    /// The server could not be reached.
    #[error("failed to connect to redis")]
    ConnectionFailed(#[source] RedisError),
}

/// Connection settings for [`RedisLockStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Connection URL
    pub url: String,
    /// Password, overriding any in the URL
    pub password: Option<String>,
    /// Logical database index, overriding any in the URL
    pub db: i64,
}

impl From<&RedisSettings> for RedisConfig {
    fn from(settings: &RedisSettings) -> Self {
        Self {
            url: settings.url.clone(),
            password: settings.password.clone(),
            db: settings.db,
        }
    }
}

impl RedisConfig {
    /// Resolved connection parameters.
    pub fn connection_info(&self) -> Result<ConnectionInfo, RedisLockStoreError> {
        let mut info = self
            .url
            .as_str()
            .into_connection_info()
            .map_err(RedisLockStoreError::InvalidUrl)?;
        if let Some(password) = &self.password {
            info.redis.password = Some(password.clone());
        }
        if self.db != 0 {
            info.redis.db = self.db;
        }
        Ok(info)
    }
}

/// [`LockStore`] over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisLockStore {
    connection: ConnectionManager,
    release_script: Script,
}

impl std::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore").finish_non_exhaustive()
    }
}

impl RedisLockStore {
    /// Connects to the server described by `config`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, RedisLockStoreError> {
        let client = Client::open(config.connection_info()?).map_err(RedisLockStoreError::InvalidUrl)?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(RedisLockStoreError::ConnectionFailed)?;
        info!(db = config.db, "[redis.connect] lock store connected");
        Ok(Self::from_connection(connection))
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            release_script: Script::new(COMPARE_AND_DELETE),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BoxError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<ReleaseOutcome, BoxError> {
        let mut connection = self.connection.clone();
        let (released, current): (i64, Option<String>) = self
            .release_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut connection)
            .await?;

        if released == 1 {
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::Mismatch { current })
        }
    }
}

/// Connects a [`DistributedLock`] using loaded settings.
pub async fn connect_lock(
    redis: &RedisSettings,
    lock: &LockSettings,
) -> Result<DistributedLock<RedisLockStore>, RedisLockStoreError> {
    let store = RedisLockStore::connect(&RedisConfig::from(redis)).await?;
    Ok(DistributedLock::new(store, redis.prefix.clone())
        .with_retry_interval(lock.retry_interval.as_duration()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, password: Option<&str>, db: i64) -> RedisConfig {
        RedisConfig {
            url: url.to_string(),
            password: password.map(str::to_string),
            db,
        }
    }

    #[test]
    fn settings_override_url_credentials_and_db() {
        let info = config("redis://cache:6380/2", Some("s3cret"), 5)
            .connection_info()
            .unwrap();
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));
        assert_eq!(info.redis.db, 5);
    }

    #[test]
    fn url_values_survive_when_not_overridden() {
        let info = config("redis://:inline@cache:6380/2", None, 0)
            .connection_info()
            .unwrap();
        assert_eq!(info.redis.password.as_deref(), Some("inline"));
        assert_eq!(info.redis.db, 2);
    }

    #[test]
    fn malformed_urls_are_rejected() {
        let error = config("not a url", None, 0).connection_info().unwrap_err();
        assert!(matches!(error, RedisLockStoreError::InvalidUrl(_)));
    }

    #[test]
    fn sub_millisecond_ttls_round_up() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
    }

    #[test]
    fn release_script_compares_before_deleting() {
        let compare = COMPARE_AND_DELETE.find("current == ARGV[1]").unwrap();
        let delete = COMPARE_AND_DELETE.find("'DEL'").unwrap();
        assert!(compare < delete);
    }
}
