// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of vellum.
//
// vellum is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// vellum is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with vellum.  If not,
// see <http://www.gnu.org/licenses/>.

//! # redis
//!
//! [Cache] implementation for Redis.
//!
//! [Cache]: crate::cache
//!
//! The [ConnectionManager] multiplexes one connection & reconnects underneath us; retries are
//! bounded & the connection timeout is short, because every caller of this backend would rather
//! hear "the cache is down" quickly & get on with the durable fallback than wait out a generous
//! timeout on the hot path.

use std::time::Duration;

use async_trait::async_trait;
use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    AsyncCommands, Client,
};
use snafu::{ResultExt, Snafu};

use crate::cache;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to open the Redis client: {source}"))]
    Client { source: redis::RedisError },
    #[snafu(display("Failed to connect to Redis at startup: {source}"))]
    Connect { source: redis::RedisError },
}

type Result<T> = std::result::Result<T, Error>;

type CacheResult<T> = std::result::Result<T, cache::Error>;

/// The Redis-backed volatile cache.
///
/// [ConnectionManager] is `Clone` & safe for concurrent use from any number of request tasks.
#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
}

impl Cache {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn new(url: &str) -> Result<Cache> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(250));
        let client = Client::open(url).context(ClientSnafu)?;
        let conn = client
            .get_connection_manager_with_config(config)
            .await
            .context(ConnectSnafu)?;
        Ok(Cache { conn })
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // Redis refuses a zero expiry; round sub-second TTLs up rather than down.
    ttl.as_secs().max(1)
}

#[async_trait]
impl cache::Backend for Cache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(cache::Error::new)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl_secs(ttl))
            .await
            .map_err(cache::Error::new)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(cache::Error::new)
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await.map_err(cache::Error::new)
    }

    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        // Explicit SCAN cursor loop; KEYS would block the server on a big keyspace.
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await
                .map_err(cache::Error::new)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        // SADD then EXPIRE; the window slides on every observation, which is exactly the
        // TTL-expiring-set approximation the fraud checks are specified against.
        conn.sadd::<_, _, ()>(key, member)
            .await
            .map_err(cache::Error::new)?;
        conn.expire::<_, ()>(key, ttl_secs(ttl) as i64)
            .await
            .map_err(cache::Error::new)
    }

    async fn set_cardinality(&self, key: &str) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(cache::Error::new)
    }
}
