//! In-process remote store.
//!
//! Implements the full [`RemoteStore`] contract, atomic scripts included, on
//! a single mutex-protected keyspace. Useful for tests, single-process
//! deployments and as the reference behavior the Redis scripts must match.
//!
//! Expiry uses `tokio::time::Instant`, so paused-clock tests can advance
//! lease and TTL deadlines deterministically. Expired keys are purged lazily
//! whenever they are touched.

use super::script::{waiter_key, AtomicScript, ScriptReply};
use super::RemoteStore;
use crate::cache::{KeyPattern, SetCondition, TtlStatus};
use async_trait::async_trait;
use latchkey_core::{CacheError, LatchkeyResult, LockMode, RemoteError};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expire_at: Option<Instant>,
}

/// The keyspace, borrowed mutably for the duration of one command or script.
struct Db<'a> {
    map: &'a mut HashMap<String, Slot>,
    now: Instant,
}

type DbResult<T> = Result<T, RemoteError>;

fn wrong_type(key: &str) -> RemoteError {
    RemoteError::WrongType {
        key: key.to_string(),
    }
}

impl<'a> Db<'a> {
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let expired = self
            .map
            .get(key)
            .is_some_and(|slot| slot.expire_at.is_some_and(|at| self.now >= at));
        if expired {
            self.map.remove(key);
            return None;
        }
        self.map.get_mut(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn del(&mut self, key: &str) -> bool {
        let existed = self.exists(key);
        self.map.remove(key);
        existed
    }

    fn pexpire(&mut self, key: &str, ttl: Duration) -> bool {
        let at = self.now + ttl;
        match self.live(key) {
            Some(slot) => {
                slot.expire_at = Some(at);
                true
            }
            None => false,
        }
    }

    fn ttl(&mut self, key: &str) -> TtlStatus {
        let now = self.now;
        match self.live(key) {
            None => TtlStatus::Missing,
            Some(Slot { expire_at: None, .. }) => TtlStatus::NoExpiry,
            Some(Slot {
                expire_at: Some(at),
                ..
            }) => TtlStatus::Expires(at.saturating_duration_since(now)),
        }
    }

    // ------------------------------------------------------------------ bytes

    fn get(&mut self, key: &str) -> DbResult<Option<Vec<u8>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Token comparison helper: does `key` hold exactly `expected`?
    fn holds(&mut self, key: &str, expected: &[u8]) -> DbResult<bool> {
        Ok(self.get(key)?.as_deref() == Some(expected))
    }

    fn get_int(&mut self, key: &str) -> DbResult<Option<i64>> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Some)
                .ok_or_else(|| RemoteError::ScriptFailed {
                    script: "integer read".to_string(),
                    reason: format!("value at {key} is not an integer"),
                }),
        }
    }

    /// `SET key value [PX ttl]`; like Redis, a plain SET clears any old TTL.
    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let expire_at = ttl.map(|d| self.now + d);
        self.map.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value),
                expire_at,
            },
        );
    }

    /// Overwrite the value but keep the current expiry.
    fn set_keep_ttl(&mut self, key: &str, value: Vec<u8>) {
        let expire_at = self.live(key).and_then(|slot| slot.expire_at);
        self.map.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value),
                expire_at,
            },
        );
    }

    fn set_nx(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) -> bool {
        if self.exists(key) {
            return false;
        }
        self.set(key, value.to_vec(), ttl);
        true
    }

    // ------------------------------------------------------------------- sets

    fn set_ref(&mut self, key: &str) -> DbResult<Option<&mut BTreeSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sadd(&mut self, key: &str, member: &str) -> DbResult<bool> {
        if let Some(set) = self.set_ref(key)? {
            return Ok(set.insert(member.to_string()));
        }
        let mut set = BTreeSet::new();
        set.insert(member.to_string());
        self.map.insert(
            key.to_string(),
            Slot {
                value: Value::Set(set),
                expire_at: None,
            },
        );
        Ok(true)
    }

    fn srem(&mut self, key: &str, member: &str) -> DbResult<bool> {
        let (removed, now_empty) = match self.set_ref(key)? {
            None => return Ok(false),
            Some(set) => (set.remove(member), set.is_empty()),
        };
        if now_empty {
            self.map.remove(key);
        }
        Ok(removed)
    }

    fn smembers(&mut self, key: &str) -> DbResult<Vec<String>> {
        Ok(self
            .set_ref(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn scard(&mut self, key: &str) -> DbResult<u64> {
        Ok(self.set_ref(key)?.map_or(0, |set| set.len() as u64))
    }

    fn sismember(&mut self, key: &str, member: &str) -> DbResult<bool> {
        Ok(self.set_ref(key)?.is_some_and(|set| set.contains(member)))
    }

    // ------------------------------------------------------------------ lists

    fn list_ref(&mut self, key: &str) -> DbResult<Option<&mut VecDeque<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn push(&mut self, key: &str, value: &str, front: bool) -> DbResult<u64> {
        if self.list_ref(key)?.is_none() {
            self.map.insert(
                key.to_string(),
                Slot {
                    value: Value::List(VecDeque::new()),
                    expire_at: None,
                },
            );
        }
        let list = self.list_ref(key)?.ok_or_else(|| wrong_type(key))?;
        if front {
            list.push_front(value.to_string());
        } else {
            list.push_back(value.to_string());
        }
        Ok(list.len() as u64)
    }

    fn lindex(&mut self, key: &str, index: i64) -> DbResult<Option<String>> {
        let Some(list) = self.list_ref(key)? else {
            return Ok(None);
        };
        let len = list.len() as i64;
        let idx = if index < 0 { len + index } else { index };
        if idx < 0 || idx >= len {
            return Ok(None);
        }
        Ok(list.get(idx as usize).cloned())
    }

    fn lpop(&mut self, key: &str) -> DbResult<Option<String>> {
        let (popped, now_empty) = match self.list_ref(key)? {
            None => return Ok(None),
            Some(list) => (list.pop_front(), list.is_empty()),
        };
        if now_empty {
            self.map.remove(key);
        }
        Ok(popped)
    }

    fn lrem(&mut self, key: &str, count: i64, value: &str) -> DbResult<u64> {
        let (removed, now_empty) = match self.list_ref(key)? {
            None => return Ok(0),
            Some(list) => {
                let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
                let mut removed = 0usize;
                if count >= 0 {
                    let mut i = 0;
                    while i < list.len() && removed < limit {
                        if list[i] == value {
                            list.remove(i);
                            removed += 1;
                        } else {
                            i += 1;
                        }
                    }
                } else {
                    let mut i = list.len();
                    while i > 0 && removed < limit {
                        i -= 1;
                        if list[i] == value {
                            list.remove(i);
                            removed += 1;
                        }
                    }
                }
                (removed as u64, list.is_empty())
            }
        };
        if now_empty {
            self.map.remove(key);
        }
        Ok(removed)
    }

    fn llen(&mut self, key: &str) -> DbResult<u64> {
        Ok(self.list_ref(key)?.map_or(0, |list| list.len() as u64))
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> DbResult<Vec<String>> {
        let Some(list) = self.list_ref(key)? else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if stop < 0 || start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    // ---------------------------------------------------------------- scripts

    fn run(&mut self, script: &AtomicScript) -> DbResult<ScriptReply> {
        use AtomicScript::*;
        let flag = |ok: bool| ScriptReply::Int(i64::from(ok));

        let reply = match script {
            CompareAndDelete { key, token } => {
                let owned = self.holds(key, token.as_bytes())?;
                if owned {
                    self.del(key);
                }
                flag(owned)
            }
            CompareAndExpire { key, token, ttl } => {
                let owned = self.holds(key, token.as_bytes())?;
                flag(owned && self.pexpire(key, *ttl))
            }
            FairAcquire {
                lock_key,
                queue_key,
                token,
                ttl,
            } => {
                let heartbeat = waiter_key(queue_key, token.as_str());
                self.set(&heartbeat, b"1".to_vec(), Some(*ttl));
                let queued = self
                    .list_ref(queue_key)?
                    .is_some_and(|list| list.iter().any(|t| t == token.as_str()));
                if !queued {
                    self.push(queue_key, token.as_str(), false)?;
                }
                self.pexpire(queue_key, *ttl);
                while let Some(head) = self.lindex(queue_key, 0)? {
                    if head == token.as_str() || self.exists(&waiter_key(queue_key, &head)) {
                        break;
                    }
                    self.lpop(queue_key)?;
                }
                let at_head = self.lindex(queue_key, 0)?.as_deref() == Some(token.as_str());
                if at_head && self.set_nx(lock_key, token.as_bytes(), Some(*ttl)) {
                    self.lpop(queue_key)?;
                    self.del(&heartbeat);
                    flag(true)
                } else {
                    flag(false)
                }
            }
            QueueRemove { queue_key, token } => {
                self.del(&waiter_key(queue_key, token.as_str()));
                ScriptReply::Int(self.lrem(queue_key, 0, token.as_str())? as i64)
            }
            ExclusiveAcquire {
                exclusive_key,
                shared_key,
                token,
                ttl,
            } => {
                let readers = self.scard(shared_key)?;
                flag(readers == 0 && self.set_nx(exclusive_key, token.as_bytes(), Some(*ttl)))
            }
            SharedAcquire {
                exclusive_key,
                shared_key,
                token,
                ttl,
            } => {
                if self.exists(exclusive_key) {
                    flag(false)
                } else {
                    self.sadd(shared_key, token.as_str())?;
                    self.pexpire(shared_key, *ttl);
                    flag(true)
                }
            }
            Downgrade {
                exclusive_key,
                shared_key,
                token,
                ttl,
            } => {
                if self.holds(exclusive_key, token.as_bytes())? {
                    self.del(exclusive_key);
                    self.sadd(shared_key, token.as_str())?;
                    self.pexpire(shared_key, *ttl);
                    flag(true)
                } else {
                    flag(false)
                }
            }
            SharedRelease { shared_key, token } => flag(self.srem(shared_key, token.as_str())?),
            LockRows {
                index_key,
                rows,
                token,
                ttl,
            } => {
                let mut any_locked = false;
                for row in rows {
                    if self.exists(&row.key) {
                        any_locked = true;
                        break;
                    }
                }
                if any_locked {
                    flag(false)
                } else {
                    for row in rows {
                        self.set(&row.key, token.as_bytes().to_vec(), Some(*ttl));
                        self.sadd(index_key, &row.row_id)?;
                    }
                    if !rows.is_empty() {
                        self.pexpire(index_key, *ttl);
                    }
                    flag(true)
                }
            }
            UnlockRows {
                index_key,
                rows,
                token,
            } => {
                let mut released = 0i64;
                for row in rows {
                    if self.holds(&row.key, token.as_bytes())? {
                        self.del(&row.key);
                        self.srem(index_key, &row.row_id)?;
                        released += 1;
                    }
                }
                ScriptReply::Int(released)
            }
            ForceUnlockRows {
                index_key,
                row_key_prefix,
            } => {
                let mut released = 0i64;
                for row_id in self.smembers(index_key)? {
                    if self.del(&format!("{row_key_prefix}{row_id}")) {
                        released += 1;
                    }
                }
                self.del(index_key);
                ScriptReply::Int(released)
            }
            LockTable {
                mode_key,
                owners_key,
                token,
                mode,
                ttl,
            } => {
                let current = self.get(mode_key)?;
                let granted = match (mode, current.as_deref()) {
                    (LockMode::Exclusive, None) => true,
                    (LockMode::Exclusive, Some(_)) => false,
                    (LockMode::Shared, None) => true,
                    (LockMode::Shared, Some(raw)) => raw == LockMode::Shared.as_wire_str().as_bytes(),
                };
                if granted {
                    self.set(mode_key, mode.as_wire_str().as_bytes().to_vec(), Some(*ttl));
                    self.sadd(owners_key, token.as_str())?;
                    self.pexpire(owners_key, *ttl);
                }
                flag(granted)
            }
            UnlockTable {
                mode_key,
                owners_key,
                token,
            } => {
                let removed = self.srem(owners_key, token.as_str())?;
                if self.scard(owners_key)? == 0 {
                    self.del(mode_key);
                    self.del(owners_key);
                }
                flag(removed)
            }
            RenewMembership {
                set_key,
                keys,
                token,
                ttl,
            } => {
                let member = self.sismember(set_key, token.as_str())?;
                if member {
                    self.pexpire(set_key, *ttl);
                    for key in keys {
                        self.pexpire(key, *ttl);
                    }
                }
                flag(member)
            }
            SemaphoreAcquire {
                counter_key,
                owners_key,
                token,
                count,
                ttl,
            } => {
                let current = self.get_int(counter_key)?.unwrap_or(i64::from(*count));
                if current > 0 {
                    self.set(counter_key, (current - 1).to_string().into_bytes(), Some(*ttl));
                    self.sadd(owners_key, token.as_str())?;
                    self.pexpire(owners_key, *ttl);
                    flag(true)
                } else {
                    flag(false)
                }
            }
            SemaphoreRelease {
                counter_key,
                owners_key,
                token,
                count,
            } => {
                if self.srem(owners_key, token.as_str())? {
                    if let Some(current) = self.get_int(counter_key)? {
                        if current < i64::from(*count) {
                            self.set_keep_ttl(counter_key, (current + 1).to_string().into_bytes());
                        }
                    }
                    flag(true)
                } else {
                    flag(false)
                }
            }
            VersionedGet { key, version_key } => ScriptReply::Versioned {
                value: self.get(key)?,
                version: self.get_int(version_key)?.unwrap_or(0),
            },
            CompareAndSetVersion {
                key,
                version_key,
                value,
                expected,
                ttl,
            } => {
                let current = self.get_int(version_key)?.unwrap_or(0);
                if current != *expected {
                    ScriptReply::Int(-1)
                } else {
                    let next = current + 1;
                    self.set(key, value.clone(), *ttl);
                    self.set(version_key, next.to_string().into_bytes(), None);
                    ScriptReply::Int(next)
                }
            }
            DeleteVersioned { key, version_key } => {
                let removed = self.del(key);
                let next = self.get_int(version_key)?.unwrap_or(0) + 1;
                self.set(version_key, next.to_string().into_bytes(), None);
                ScriptReply::Int(i64::from(removed))
            }
        };
        Ok(reply)
    }
}

/// Mutex-protected keyspace implementing [`RemoteStore`].
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    data: Mutex<HashMap<String, Slot>>,
    commands: AtomicU64,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands and scripts executed so far.
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.with_db(|db| {
            let keys: Vec<String> = db.map.keys().cloned().collect();
            Ok(keys.into_iter().filter(|k| db.exists(k)).count())
        })
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> LatchkeyResult<MutexGuard<'_, HashMap<String, Slot>>> {
        self.data.lock().map_err(|_| CacheError::LockPoisoned.into())
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut Db<'_>) -> DbResult<T>) -> LatchkeyResult<T> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock()?;
        let mut db = Db {
            map: &mut guard,
            now: Instant::now(),
        };
        Ok(f(&mut db)?)
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn get(&self, key: &str) -> LatchkeyResult<Option<Vec<u8>>> {
        self.with_db(|db| db.get(key))
    }

    async fn get_with_ttl(&self, key: &str) -> LatchkeyResult<Option<(Vec<u8>, TtlStatus)>> {
        self.with_db(|db| match db.get(key)? {
            Some(value) => Ok(Some((value, db.ttl(key)))),
            None => Ok(None),
        })
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> LatchkeyResult<bool> {
        self.with_db(|db| {
            if !condition.permits(db.exists(key)) {
                return Ok(false);
            }
            db.set(key, value.to_vec(), ttl);
            Ok(true)
        })
    }

    async fn delete(&self, keys: &[String]) -> LatchkeyResult<u64> {
        self.with_db(|db| Ok(keys.iter().filter(|k| db.del(k)).count() as u64))
    }

    async fn exists(&self, key: &str) -> LatchkeyResult<bool> {
        self.with_db(|db| Ok(db.exists(key)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> LatchkeyResult<bool> {
        self.with_db(|db| Ok(db.pexpire(key, ttl)))
    }

    async fn ttl(&self, key: &str) -> LatchkeyResult<TtlStatus> {
        self.with_db(|db| Ok(db.ttl(key)))
    }

    async fn keys(&self, pattern: &str) -> LatchkeyResult<Vec<String>> {
        let pattern = KeyPattern::new(pattern)?;
        self.with_db(|db| {
            let candidates: Vec<String> = db
                .map
                .keys()
                .filter(|k| pattern.matches(k))
                .cloned()
                .collect();
            let mut live: Vec<String> = candidates.into_iter().filter(|k| db.exists(k)).collect();
            live.sort();
            Ok(live)
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        self.with_db(|db| db.sadd(key, member))
    }

    async fn srem(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        self.with_db(|db| db.srem(key, member))
    }

    async fn smembers(&self, key: &str) -> LatchkeyResult<Vec<String>> {
        self.with_db(|db| db.smembers(key))
    }

    async fn scard(&self, key: &str) -> LatchkeyResult<u64> {
        self.with_db(|db| db.scard(key))
    }

    async fn sismember(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        self.with_db(|db| db.sismember(key, member))
    }

    async fn lpush(&self, key: &str, value: &str) -> LatchkeyResult<u64> {
        self.with_db(|db| db.push(key, value, true))
    }

    async fn rpush(&self, key: &str, value: &str) -> LatchkeyResult<u64> {
        self.with_db(|db| db.push(key, value, false))
    }

    async fn lindex(&self, key: &str, index: i64) -> LatchkeyResult<Option<String>> {
        self.with_db(|db| db.lindex(key, index))
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> LatchkeyResult<u64> {
        self.with_db(|db| db.lrem(key, count, value))
    }

    async fn llen(&self, key: &str) -> LatchkeyResult<u64> {
        self.with_db(|db| db.llen(key))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> LatchkeyResult<Vec<String>> {
        self.with_db(|db| db.lrange(key, start, stop))
    }

    async fn run_script(&self, script: &AtomicScript) -> LatchkeyResult<ScriptReply> {
        self.with_db(|db| db.run(script))
    }

    async fn ping(&self) -> LatchkeyResult<()> {
        self.lock().map(|_| ())
    }
}

// =============================================================================
// TESTS
// =============================================================================
