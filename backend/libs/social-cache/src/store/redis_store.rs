//! Redis-backed store, one instance per logical database.

use super::{CacheStore, Increment, Membership};
use crate::{CacheError, CacheResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult, Script};
use redis_utils::RedisPool;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

/// INCRBY that never leaves the counter below zero. Runs as one script so no
/// other client observes the negative intermediate value.
static INCR_CLAMPED: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local value = redis.call('INCRBY', KEYS[1], ARGV[1])
        if value < 0 then
            redis.call('SET', KEYS[1], 0, 'KEEPTTL')
            return {0, 1}
        end
        return {value, 0}
        "#,
    )
});

/// SADD/SREM plus clamped INCRBY on every counter key, in one script. Counter
/// values are checked before the set is touched so a failure writes nothing.
/// KEYS[1] is the set, KEYS[2..] the counters; ARGV[1] the member, ARGV[2]
/// `1` to insert or `0` to remove, ARGV[3..] the deltas.
static SET_UPDATE_COUNTED: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        for i = 2, #KEYS do
            local current = redis.call('GET', KEYS[i])
            if current and not tonumber(current) then
                return redis.error_reply('ERR value is not an integer or out of range')
            end
        end
        local changed
        if ARGV[2] == '1' then
            changed = redis.call('SADD', KEYS[1], ARGV[1])
        else
            changed = redis.call('SREM', KEYS[1], ARGV[1])
        end
        if changed == 0 then
            return {0}
        end
        local out = {1}
        for i = 2, #KEYS do
            local value = redis.call('INCRBY', KEYS[i], ARGV[i + 1])
            local clamped = 0
            if value < 0 then
                redis.call('SET', KEYS[i], 0, 'KEEPTTL')
                value = 0
                clamped = 1
            end
            table.insert(out, value)
            table.insert(out, clamped)
        end
        return out
        "#,
    )
});

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    database: i64,
    op_timeout: Duration,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, database: i64, op_timeout: Duration) -> Self {
        Self {
            conn,
            database,
            op_timeout,
        }
    }

    pub fn from_pool(pool: &RedisPool, op_timeout: Duration) -> Self {
        Self::new(pool.manager(), pool.database(), op_timeout)
    }

    pub fn database(&self) -> i64 {
        self.database
    }

    /// Bound a command by the operation timeout and map failures into the
    /// cache taxonomy.
    async fn run<T, F>(&self, operation: &'static str, command: F) -> CacheResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.op_timeout, command).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.classify(operation, err)),
            Err(_) => {
                warn!(
                    operation,
                    database = self.database,
                    timeout_ms = self.op_timeout.as_millis() as u64,
                    "Redis command timed out"
                );
                Err(CacheError::timed_out(operation, self.op_timeout))
            }
        }
    }

    fn classify(&self, operation: &'static str, err: RedisError) -> CacheError {
        match err.kind() {
            ErrorKind::TypeError => CacheError::Serialization(format!("{}: {}", operation, err)),
            ErrorKind::ResponseError if err.to_string().contains("not an integer") => {
                CacheError::Serialization(format!("{}: {}", operation, err))
            }
            _ => CacheError::unavailable(operation, err),
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        self.run("get", conn.get::<_, Option<Vec<u8>>>(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let millis = (ttl.as_millis() as u64).max(1);
                self.run("set", conn.pset_ex::<_, _, ()>(key, value, millis))
                    .await
            }
            None => self.run("set", conn.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        self.run("set_if_absent", conn.set_nx::<_, _, bool>(key, value))
            .await
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.run("del", conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn get_int(&self, key: &str) -> CacheResult<Option<i64>> {
        let mut conn = self.conn.clone();
        self.run("get_int", conn.get::<_, Option<i64>>(key)).await
    }

    async fn incr_clamped(&self, key: &str, delta: i64) -> CacheResult<Increment> {
        let mut conn = self.conn.clone();
        let mut invocation = INCR_CLAMPED.prepare_invoke();
        invocation.key(key).arg(delta);
        let (value, clamped): (i64, i64) = self
            .run(
                "incr_clamped",
                invocation.invoke_async::<_, (i64, i64)>(&mut conn),
            )
            .await?;

        Ok(Increment {
            value: value.max(0) as u64,
            clamped: clamped == 1,
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = self.run("set_add", conn.sadd(key, member)).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.run("set_remove", conn.srem(key, member)).await?;
        Ok(removed > 0)
    }

    async fn set_contains(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        self.run("set_contains", conn.sismember::<_, _, bool>(key, member))
            .await
    }

    async fn set_len(&self, key: &str) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        self.run("set_len", conn.scard::<_, u64>(key)).await
    }

    async fn set_update_counted(
        &self,
        key: &str,
        member: &str,
        change: Membership,
        counters: &[(String, i64)],
    ) -> CacheResult<Option<Vec<Increment>>> {
        let mut conn = self.conn.clone();
        let mut invocation = SET_UPDATE_COUNTED.prepare_invoke();
        invocation.key(key);
        for (counter_key, _) in counters {
            invocation.key(counter_key.as_str());
        }
        invocation
            .arg(member)
            .arg(if change == Membership::Insert { 1 } else { 0 });
        for (_, delta) in counters {
            invocation.arg(*delta);
        }

        let reply: Vec<i64> = self
            .run(
                "set_update_counted",
                invocation.invoke_async::<_, Vec<i64>>(&mut conn),
            )
            .await?;

        match reply.as_slice() {
            [1, rest @ ..] => Ok(Some(
                rest.chunks_exact(2)
                    .map(|pair| Increment {
                        value: pair[0].max(0) as u64,
                        clamped: pair[1] == 1,
                    })
                    .collect(),
            )),
            [0] => Ok(None),
            _ => Err(CacheError::Serialization(format!(
                "set_update_counted: unexpected reply {:?}",
                reply
            ))),
        }
    }

    async fn zset_put(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(member);
        self.run("zset_put", cmd.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn zset_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.run("zset_remove", conn.zrem(key, member)).await?;
        Ok(removed > 0)
    }

    async fn zset_score(&self, key: &str, member: &str) -> CacheResult<Option<f64>> {
        let mut conn = self.conn.clone();
        self.run("zset_score", conn.zscore::<_, _, Option<f64>>(key, member))
            .await
    }

    async fn zset_range(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> CacheResult<Vec<(String, f64)>> {
        if stop < start {
            return Ok(Vec::new());
        }
        // Redis reads negative indices from the tail; past isize::MAX there
        // is nothing to return anyway.
        let Ok(start) = isize::try_from(start) else {
            return Ok(Vec::new());
        };
        let stop = isize::try_from(stop).unwrap_or(isize::MAX);
        let mut conn = self.conn.clone();
        self.run(
            "zset_range",
            conn.zrange_withscores::<_, Vec<(String, f64)>>(key, start, stop),
        )
        .await
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        let pong: String = self.run("ping", cmd.query_async(&mut conn)).await?;
        if pong != "PONG" {
            return Err(CacheError::unavailable("ping", format!("unexpected reply {}", pong)));
        }
        Ok(())
    }
}
