//! Redis-backed remote store.
//!
//! Uses a multiplexed [`ConnectionManager`] that reconnects on its own; every
//! command is bounded by the configured command timeout. Atomic scripts are
//! Lua, loaded lazily by `EVALSHA` with an `EVAL` fallback.

use super::script::{AtomicScript, ScriptReply};
use super::RemoteStore;
use crate::cache::{SetCondition, TtlStatus};
use async_trait::async_trait;
use latchkey_core::{LatchkeyResult, RemoteConfig, RemoteError};
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, RedisError, Script, Value};
use std::future::Future;
use std::time::Duration;

// ============================================================================
// LUA SCRIPTS
// ============================================================================

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

// KEYS[1] = lock, KEYS[2] = queue; waiter heartbeats live at
// <queue>:waiter:<token>
const FAIR_ACQUIRE: &str = r#"
local prefix = KEYS[2] .. ':waiter:'
redis.call('SET', prefix .. ARGV[1], '1', 'PX', ARGV[2])
local queued = false
for _, waiter in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
    if waiter == ARGV[1] then
        queued = true
        break
    end
end
if not queued then
    redis.call('RPUSH', KEYS[2], ARGV[1])
end
redis.call('PEXPIRE', KEYS[2], ARGV[2])
local head = redis.call('LINDEX', KEYS[2], 0)
while head and head ~= ARGV[1] and redis.call('EXISTS', prefix .. head) == 0 do
    redis.call('LPOP', KEYS[2])
    head = redis.call('LINDEX', KEYS[2], 0)
end
if head ~= ARGV[1] then
    return 0
end
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    redis.call('LPOP', KEYS[2])
    redis.call('DEL', prefix .. ARGV[1])
    return 1
end
return 0
"#;

const QUEUE_REMOVE: &str = r#"
redis.call('DEL', KEYS[1] .. ':waiter:' .. ARGV[1])
return redis.call('LREM', KEYS[1], 0, ARGV[1])
"#;

const EXCLUSIVE_ACQUIRE: &str = r#"
if redis.call('SCARD', KEYS[2]) > 0 then
    return 0
end
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return 1
end
return 0
"#;

const SHARED_ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('PEXPIRE', KEYS[2], ARGV[2])
return 1
"#;

const DOWNGRADE: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('PEXPIRE', KEYS[2], ARGV[2])
return 1
"#;

const SHARED_RELEASE: &str = r#"
local removed = redis.call('SREM', KEYS[1], ARGV[1])
if redis.call('SCARD', KEYS[1]) == 0 then
    redis.call('DEL', KEYS[1])
end
return removed
"#;

// KEYS[1] = index, KEYS[2..] = row keys; ARGV[1] = token, ARGV[2] = ttl,
// ARGV[3..] = row ids in the same order as the row keys.
const LOCK_ROWS: &str = r#"
for i = 2, #KEYS do
    if redis.call('EXISTS', KEYS[i]) == 1 then
        return 0
    end
end
for i = 2, #KEYS do
    redis.call('SET', KEYS[i], ARGV[1], 'PX', ARGV[2])
    redis.call('SADD', KEYS[1], ARGV[i + 1])
end
if #KEYS > 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

const UNLOCK_ROWS: &str = r#"
local released = 0
for i = 2, #KEYS do
    if redis.call('GET', KEYS[i]) == ARGV[1] then
        redis.call('DEL', KEYS[i])
        redis.call('SREM', KEYS[1], ARGV[i])
        released = released + 1
    end
end
return released
"#;

const FORCE_UNLOCK_ROWS: &str = r#"
local released = 0
for _, row in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    released = released + redis.call('DEL', ARGV[1] .. row)
end
redis.call('DEL', KEYS[1])
return released
"#;

const LOCK_TABLE: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    if ARGV[2] == 'exclusive' or current ~= 'shared' then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('PEXPIRE', KEYS[2], ARGV[3])
return 1
"#;

const UNLOCK_TABLE: &str = r#"
local removed = redis.call('SREM', KEYS[2], ARGV[1])
if redis.call('SCARD', KEYS[2]) == 0 then
    redis.call('DEL', KEYS[1], KEYS[2])
end
return removed
"#;

// KEYS[1] = owner set, KEYS[2..] = keys renewed alongside it
const RENEW_MEMBERSHIP: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 0 then
    return 0
end
for i = 1, #KEYS do
    redis.call('PEXPIRE', KEYS[i], ARGV[2])
end
return 1
"#;

const SEMAPHORE_ACQUIRE: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or ARGV[2])
if current > 0 then
    redis.call('SET', KEYS[1], current - 1, 'PX', ARGV[3])
    redis.call('SADD', KEYS[2], ARGV[1])
    redis.call('PEXPIRE', KEYS[2], ARGV[3])
    return 1
end
return 0
"#;

const SEMAPHORE_RELEASE: &str = r#"
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
    return 0
end
local current = redis.call('GET', KEYS[1])
if current and tonumber(current) < tonumber(ARGV[2]) then
    redis.call('INCR', KEYS[1])
end
return 1
"#;

const VERSIONED_GET: &str = r#"
local value = redis.call('GET', KEYS[1])
local version = tonumber(redis.call('GET', KEYS[2]) or '0')
return {value, version}
"#;

// ARGV[3] = ttl in ms, or 0 for no expiry
const COMPARE_AND_SET_VERSION: &str = r#"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if current ~= tonumber(ARGV[2]) then
    return -1
end
local ttl = tonumber(ARGV[3])
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ttl)
else
    redis.call('SET', KEYS[1], ARGV[1])
end
local next = redis.call('INCR', KEYS[2])
redis.call('PERSIST', KEYS[2])
return next
"#;

const DELETE_VERSIONED: &str = r#"
local removed = redis.call('DEL', KEYS[1])
redis.call('INCR', KEYS[2])
redis.call('PERSIST', KEYS[2])
return removed
"#;

struct Scripts {
    compare_and_delete: Script,
    compare_and_expire: Script,
    fair_acquire: Script,
    queue_remove: Script,
    exclusive_acquire: Script,
    shared_acquire: Script,
    downgrade: Script,
    shared_release: Script,
    lock_rows: Script,
    unlock_rows: Script,
    force_unlock_rows: Script,
    lock_table: Script,
    unlock_table: Script,
    renew_membership: Script,
    semaphore_acquire: Script,
    semaphore_release: Script,
    versioned_get: Script,
    compare_and_set_version: Script,
    delete_versioned: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
            fair_acquire: Script::new(FAIR_ACQUIRE),
            queue_remove: Script::new(QUEUE_REMOVE),
            exclusive_acquire: Script::new(EXCLUSIVE_ACQUIRE),
            shared_acquire: Script::new(SHARED_ACQUIRE),
            downgrade: Script::new(DOWNGRADE),
            shared_release: Script::new(SHARED_RELEASE),
            lock_rows: Script::new(LOCK_ROWS),
            unlock_rows: Script::new(UNLOCK_ROWS),
            force_unlock_rows: Script::new(FORCE_UNLOCK_ROWS),
            lock_table: Script::new(LOCK_TABLE),
            unlock_table: Script::new(UNLOCK_TABLE),
            renew_membership: Script::new(RENEW_MEMBERSHIP),
            semaphore_acquire: Script::new(SEMAPHORE_ACQUIRE),
            semaphore_release: Script::new(SEMAPHORE_RELEASE),
            versioned_get: Script::new(VERSIONED_GET),
            compare_and_set_version: Script::new(COMPARE_AND_SET_VERSION),
            delete_versioned: Script::new(DELETE_VERSIONED),
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// [`RemoteStore`] over a Redis server.
pub struct RedisRemoteStore {
    conn: ConnectionManager,
    command_timeout: Duration,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRemoteStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

fn remote_error(key: &str, err: RedisError) -> RemoteError {
    if err.code() == Some("WRONGTYPE") {
        RemoteError::WrongType {
            key: key.to_string(),
        }
    } else {
        RemoteError::Unavailable {
            reason: err.to_string(),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

impl RedisRemoteStore {
    /// Open a client for `config.url` and establish the managed connection.
    pub async fn connect(config: &RemoteConfig) -> LatchkeyResult<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            RemoteError::Unavailable {
                reason: format!("invalid redis url: {e}"),
            }
        })?;
        let connect = client.get_connection_manager();
        let conn = tokio::time::timeout(config.command_timeout, connect)
            .await
            .map_err(|_| RemoteError::Unavailable {
                reason: "timed out connecting to redis".to_string(),
            })?
            .map_err(|e| remote_error("", e))?;

        tracing::info!(url = %config.url, "Connected to remote store");
        Ok(Self {
            conn,
            command_timeout: config.command_timeout,
            scripts: Scripts::load(),
        })
    }

    async fn bounded<T>(
        &self,
        key: &str,
        fut: impl Future<Output = Result<T, RedisError>>,
    ) -> LatchkeyResult<T> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => Ok(result.map_err(|e| remote_error(key, e))?),
            Err(_) => Err(RemoteError::Unavailable {
                reason: format!("command on {key} timed out after {:?}", self.command_timeout),
            }
            .into()),
        }
    }

    async fn query<T: FromRedisValue + Send>(&self, key: &str, cmd: redis::Cmd) -> LatchkeyResult<T> {
        let mut conn = self.conn.clone();
        self.bounded(key, async move {
            let value: T = cmd.query_async(&mut conn).await?;
            Ok(value)
        })
        .await
    }

    async fn eval<T, K>(
        &self,
        script: &Script,
        name: &str,
        keys: &[K],
        args: &[Vec<u8>],
    ) -> LatchkeyResult<T>
    where
        T: FromRedisValue + Send,
        K: AsRef<str> + Sync,
    {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_ref());
        }
        for arg in args {
            invocation.arg(arg.as_slice());
        }
        let mut conn = self.conn.clone();
        let result = tokio::time::timeout(self.command_timeout, async {
            let value: T = invocation.invoke_async(&mut conn).await?;
            Ok::<T, RedisError>(value)
        })
        .await;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.code() == Some("WRONGTYPE") => Err(RemoteError::WrongType {
                key: keys
                    .first()
                    .map(|k| k.as_ref().to_string())
                    .unwrap_or_default(),
            }
            .into()),
            Ok(Err(e)) => {
                tracing::warn!(script = name, error = %e, "Atomic script failed");
                Err(RemoteError::ScriptFailed {
                    script: name.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
            Err(_) => Err(RemoteError::Unavailable {
                reason: format!("script {name} timed out after {:?}", self.command_timeout),
            }
            .into()),
        }
    }

    async fn eval_int<K: AsRef<str> + Sync>(
        &self,
        script: &Script,
        name: &str,
        keys: &[K],
        args: &[Vec<u8>],
    ) -> LatchkeyResult<ScriptReply> {
        let n: i64 = self.eval(script, name, keys, args).await?;
        Ok(ScriptReply::Int(n))
    }
}

fn arg(value: impl ToString) -> Vec<u8> {
    value.to_string().into_bytes()
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    async fn get(&self, key: &str) -> LatchkeyResult<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(key, cmd).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> LatchkeyResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        match condition {
            SetCondition::Always => {}
            SetCondition::IfAbsent => {
                cmd.arg("NX");
            }
            SetCondition::IfPresent => {
                cmd.arg("XX");
            }
        }
        let reply: Value = self.query(key, cmd).await?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn delete(&self, keys: &[String]) -> LatchkeyResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.query(&keys[0], cmd).await
    }

    async fn exists(&self, key: &str) -> LatchkeyResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let n: u64 = self.query(key, cmd).await?;
        Ok(n > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> LatchkeyResult<bool> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(millis(ttl));
        let n: u64 = self.query(key, cmd).await?;
        Ok(n == 1)
    }

    async fn ttl(&self, key: &str) -> LatchkeyResult<TtlStatus> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let ms: i64 = self.query(key, cmd).await?;
        Ok(match ms {
            -2 => TtlStatus::Missing,
            -1 => TtlStatus::NoExpiry,
            ms => TtlStatus::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn keys(&self, pattern: &str) -> LatchkeyResult<Vec<String>> {
        let mut found = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(500);
            let (next, batch): (u64, Vec<String>) = self.query(pattern, cmd).await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn sadd(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let n: u64 = self.query(key, cmd).await?;
        Ok(n == 1)
    }

    async fn srem(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        let n: u64 = self.query(key, cmd).await?;
        Ok(n == 1)
    }

    async fn smembers(&self, key: &str) -> LatchkeyResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        let mut members: Vec<String> = self.query(key, cmd).await?;
        members.sort();
        Ok(members)
    }

    async fn scard(&self, key: &str) -> LatchkeyResult<u64> {
        let mut cmd = redis::cmd("SCARD");
        cmd.arg(key);
        self.query(key, cmd).await
    }

    async fn sismember(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(key).arg(member);
        let n: u64 = self.query(key, cmd).await?;
        Ok(n == 1)
    }

    async fn lpush(&self, key: &str, value: &str) -> LatchkeyResult<u64> {
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key).arg(value);
        self.query(key, cmd).await
    }

    async fn rpush(&self, key: &str, value: &str) -> LatchkeyResult<u64> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(value);
        self.query(key, cmd).await
    }

    async fn lindex(&self, key: &str, index: i64) -> LatchkeyResult<Option<String>> {
        let mut cmd = redis::cmd("LINDEX");
        cmd.arg(key).arg(index);
        self.query(key, cmd).await
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> LatchkeyResult<u64> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(key).arg(count).arg(value);
        self.query(key, cmd).await
    }

    async fn llen(&self, key: &str) -> LatchkeyResult<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.query(key, cmd).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> LatchkeyResult<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.query(key, cmd).await
    }

    async fn run_script(&self, script: &AtomicScript) -> LatchkeyResult<ScriptReply> {
        let s = &self.scripts;
        let name = script.name();
        match script {
            AtomicScript::CompareAndDelete { key, token } => {
                self.eval_int(&s.compare_and_delete, name, &[key], &[arg(token)])
                    .await
            }
            AtomicScript::CompareAndExpire { key, token, ttl } => {
                self.eval_int(
                    &s.compare_and_expire,
                    name,
                    &[key],
                    &[arg(token), arg(millis(*ttl))],
                )
                .await
            }
            AtomicScript::FairAcquire {
                lock_key,
                queue_key,
                token,
                ttl,
            } => {
                self.eval_int(
                    &s.fair_acquire,
                    name,
                    &[lock_key, queue_key],
                    &[arg(token), arg(millis(*ttl))],
                )
                .await
            }
            AtomicScript::QueueRemove { queue_key, token } => {
                self.eval_int(&s.queue_remove, name, &[queue_key], &[arg(token)])
                    .await
            }
            AtomicScript::ExclusiveAcquire {
                exclusive_key,
                shared_key,
                token,
                ttl,
            } => {
                self.eval_int(
                    &s.exclusive_acquire,
                    name,
                    &[exclusive_key, shared_key],
                    &[arg(token), arg(millis(*ttl))],
                )
                .await
            }
            AtomicScript::SharedAcquire {
                exclusive_key,
                shared_key,
                token,
                ttl,
            } => {
                self.eval_int(
                    &s.shared_acquire,
                    name,
                    &[exclusive_key, shared_key],
                    &[arg(token), arg(millis(*ttl))],
                )
                .await
            }
            AtomicScript::Downgrade {
                exclusive_key,
                shared_key,
                token,
                ttl,
            } => {
                self.eval_int(
                    &s.downgrade,
                    name,
                    &[exclusive_key, shared_key],
                    &[arg(token), arg(millis(*ttl))],
                )
                .await
            }
            AtomicScript::SharedRelease { shared_key, token } => {
                self.eval_int(&s.shared_release, name, &[shared_key], &[arg(token)])
                    .await
            }
            AtomicScript::LockRows {
                index_key,
                rows,
                token,
                ttl,
            } => {
                let mut keys: Vec<&str> = vec![index_key];
                keys.extend(rows.iter().map(|r| r.key.as_str()));
                let mut args = vec![arg(token), arg(millis(*ttl))];
                args.extend(rows.iter().map(|r| arg(&r.row_id)));
                self.eval_int(&s.lock_rows, name, &keys, &args).await
            }
            AtomicScript::UnlockRows {
                index_key,
                rows,
                token,
            } => {
                let mut keys: Vec<&str> = vec![index_key];
                keys.extend(rows.iter().map(|r| r.key.as_str()));
                let mut args = vec![arg(token)];
                args.extend(rows.iter().map(|r| arg(&r.row_id)));
                self.eval_int(&s.unlock_rows, name, &keys, &args).await
            }
            AtomicScript::ForceUnlockRows {
                index_key,
                row_key_prefix,
            } => {
                self.eval_int(
                    &s.force_unlock_rows,
                    name,
                    &[index_key],
                    &[arg(row_key_prefix)],
                )
                .await
            }
            AtomicScript::LockTable {
                mode_key,
                owners_key,
                token,
                mode,
                ttl,
            } => {
                self.eval_int(
                    &s.lock_table,
                    name,
                    &[mode_key, owners_key],
                    &[arg(token), arg(mode.as_wire_str()), arg(millis(*ttl))],
                )
                .await
            }
            AtomicScript::UnlockTable {
                mode_key,
                owners_key,
                token,
            } => {
                self.eval_int(
                    &s.unlock_table,
                    name,
                    &[mode_key, owners_key],
                    &[arg(token)],
                )
                .await
            }
            AtomicScript::RenewMembership {
                set_key,
                keys,
                token,
                ttl,
            } => {
                let mut all: Vec<&str> = vec![set_key];
                all.extend(keys.iter().map(String::as_str));
                self.eval_int(
                    &s.renew_membership,
                    name,
                    &all,
                    &[arg(token), arg(millis(*ttl))],
                )
                .await
            }
            AtomicScript::SemaphoreAcquire {
                counter_key,
                owners_key,
                token,
                count,
                ttl,
            } => {
                self.eval_int(
                    &s.semaphore_acquire,
                    name,
                    &[counter_key, owners_key],
                    &[arg(token), arg(count), arg(millis(*ttl))],
                )
                .await
            }
            AtomicScript::SemaphoreRelease {
                counter_key,
                owners_key,
                token,
                count,
            } => {
                self.eval_int(
                    &s.semaphore_release,
                    name,
                    &[counter_key, owners_key],
                    &[arg(token), arg(count)],
                )
                .await
            }
            AtomicScript::VersionedGet { key, version_key } => {
                let (value, version): (Option<Vec<u8>>, i64) = self
                    .eval(&s.versioned_get, name, &[key, version_key], &[])
                    .await?;
                Ok(ScriptReply::Versioned { value, version })
            }
            AtomicScript::CompareAndSetVersion {
                key,
                version_key,
                value,
                expected,
                ttl,
            } => {
                let ttl_ms = ttl.map(millis).unwrap_or(0);
                self.eval_int(
                    &s.compare_and_set_version,
                    name,
                    &[key, version_key],
                    &[value.clone(), arg(expected), arg(ttl_ms)],
                )
                .await
            }
            AtomicScript::DeleteVersioned { key, version_key } => {
                self.eval_int(&s.delete_versioned, name, &[key, version_key], &[])
                    .await
            }
        }
    }

    async fn ping(&self) -> LatchkeyResult<()> {
        let cmd = redis::cmd("PING");
        let _: String = self.query("", cmd).await?;
        Ok(())
    }
}
