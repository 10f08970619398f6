use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::counter::CounterStore;
use crate::error::{Error, ErrorDetails};

/// Redis-backed counter store, the fast path for multi-node deployments.
///
/// The increment runs as a Lua script so increment-or-create and the expiry
/// assignment are one atomic server-side operation; concurrent callers for
/// the same window never lose increments or race the TTL.
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    increment_script: Script,
}

impl RedisCounterStore {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::CounterStore {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;

        let increment_script = Script::new(
            r#"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
                redis.call('EXPIREAT', KEYS[1], ARGV[1])
            end
            return count
            "#,
        );

        Ok(Self {
            conn,
            increment_script,
        })
    }

    fn store_error(e: redis::RedisError) -> Error {
        Error::new_without_logging(ErrorDetails::CounterStore {
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, expire_at: DateTime<Utc>) -> Result<i64, Error> {
        let mut conn = self.conn.clone();
        self.increment_script
            .key(key)
            .arg(expire_at.timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::store_error)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, Error> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(Self::store_error)
    }

    async fn set(&self, key: &str, value: i64, expire_at: DateTime<Utc>) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EXAT")
            .arg(expire_at.timestamp())
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::store_error)
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(Self::store_error)
    }
}
