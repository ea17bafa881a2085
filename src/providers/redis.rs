// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{sync::LazyLock, time::Duration};

use redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script,
    aio::ConnectionManager,
};
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::RedilockError,
    providers::{Acquisition, Release, Store},
};

/// Connection parameters for a [RedisStore].
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port` of the Redis server.
    pub addr: String,
    pub db: i64,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            db: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    /// Build a configuration from `REDIS_ADDR`, `REDIS_DB` and
    /// `REDIS_PASSWORD`, falling back to the defaults for unset variables.
    pub fn from_env() -> Result<Self, RedilockError> {
        let defaults = Self::default();
        let addr = std::env::var("REDIS_ADDR").unwrap_or(defaults.addr);
        let db = match std::env::var("REDIS_DB") {
            Ok(db) => db
                .parse()
                .map_err(|_| RedilockError::InvalidConfig(format!("REDIS_DB is not an integer: {db}")))?,
            Err(_) => defaults.db,
        };
        let password = std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty());

        Ok(Self { addr, db, password })
    }

    fn connection_info(&self) -> Result<ConnectionInfo, RedilockError> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .ok_or_else(|| RedilockError::InvalidConfig(format!("missing port in {}", self.addr)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RedilockError::InvalidConfig(format!("invalid port in {}", self.addr)))?;

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..Default::default()
            },
        })
    }
}

/// Lease duration in whole milliseconds, as `PEXPIRE` expects it.
fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

const ACQUIRED: i64 = -100;
const REENTERED: i64 = -101;

static ACQUIRE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if (redis.call('exists', KEYS[1]) == 0) then
    redis.call('hset', KEYS[1], ARGV[2], 1);
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return -100;
end;
if (redis.call('hexists', KEYS[1], ARGV[2]) == 1) then
    redis.call('hincrby', KEYS[1], ARGV[2], 1);
    return -101;
end;
return redis.call('pttl', KEYS[1]);
"#,
    )
});

static RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if (redis.call('hexists', KEYS[1], ARGV[1]) == 0) then
    return -1;
end;
local remaining = redis.call('hincrby', KEYS[1], ARGV[1], -1);
if (remaining > 0) then
    return remaining;
end;
redis.call('del', KEYS[1]);
return 0;
"#,
    )
});

impl From<i64> for Acquisition {
    fn from(reply: i64) -> Self {
        match reply {
            ACQUIRED => Acquisition::Acquired,
            REENTERED => Acquisition::Reentered,
            // PTTL is -1 for a key someone created without an expiry
            ttl => Acquisition::HeldElsewhere {
                remaining: Duration::from_millis(ttl.max(0) as u64),
            },
        }
    }
}

impl From<i64> for Release {
    fn from(reply: i64) -> Self {
        match reply {
            0 => Release::Released,
            remaining if remaining > 0 => Release::Decremented {
                remaining: remaining as u64,
            },
            _ => Release::NotHeld,
        }
    }
}

/// [Redis](redis) backed [Store] for [Redilock](crate::Redilock).
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis and verify it answers `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, RedilockError> {
        let client = Client::open(config.connection_info()?)?;
        let conn = client.get_connection_manager().await?;
        let store = Self { conn };
        store.ping().await?;
        debug!(addr = %config.addr, db = config.db, "connected to redis");
        Ok(store)
    }

    /// Wrap an already established connection.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl Store for RedisStore {
    async fn ping(&self) -> Result<(), RedilockError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        holder: &str,
    ) -> Result<Acquisition, RedilockError> {
        let mut conn = self.conn.clone();
        let reply: i64 = ACQUIRE_SCRIPT
            .key(key)
            .arg(lease_millis(lease))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply.into())
    }

    async fn extend(&self, key: &str, lease: Duration) -> Result<bool, RedilockError> {
        let mut conn = self.conn.clone();
        let existed: bool = conn.pexpire(key, lease_millis(lease)).await?;
        Ok(existed)
    }

    async fn delete(&self, key: &str) -> Result<(), RedilockError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn release(&self, key: &str, holder: &str) -> Result<Release, RedilockError> {
        let mut conn = self.conn.clone();
        let reply: i64 = RELEASE_SCRIPT
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply.into())
    }
}
