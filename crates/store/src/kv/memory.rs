//! In-process [`Kv`] with Redis-compatible semantics.
//!
//! Keys carry an optional deadline and are evicted lazily on access.
//! A batch holds the lock for its whole duration and restores every key it
//! touched if an op fails, so it is applied as a unit. Cost is proportional to
//! the keys a batch touches, not to the size of the store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;

use super::{Kv, WriteOp};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Db {
    entries: HashMap<String, Entry>,
}

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

impl Db {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|deadline| deadline <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => bail!(WRONGTYPE),
        }
    }

    fn set(&mut self, key: &str) -> Result<Option<&mut HashSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => bail!(WRONGTYPE),
        }
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(Some(l)),
            Some(_) => bail!(WRONGTYPE),
        }
    }

    fn zset(&mut self, key: &str) -> Result<Option<&mut HashMap<String, f64>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => bail!(WRONGTYPE),
        }
    }

    fn string(&mut self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => bail!(WRONGTYPE),
        }
    }

    fn insert(&mut self, key: &str, value: Value, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Containers disappear once empty, as in Redis.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            Some(Value::List(l)) => l.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn apply(&mut self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::HSet { key, fields } => {
                if self.hash(&key)?.is_none() {
                    self.insert(&key, Value::Hash(HashMap::new()), None);
                }
                if let Some(hash) = self.hash(&key)? {
                    hash.extend(fields);
                }
            }
            WriteOp::HDel { key, fields } => {
                if let Some(hash) = self.hash(&key)? {
                    for field in &fields {
                        hash.remove(field);
                    }
                }
                self.drop_if_empty(&key);
            }
            WriteOp::Del { key } => {
                self.entries.remove(&key);
            }
            WriteOp::SAdd { key, member } => {
                if self.set(&key)?.is_none() {
                    self.insert(&key, Value::Set(HashSet::new()), None);
                }
                if let Some(set) = self.set(&key)? {
                    set.insert(member);
                }
            }
            WriteOp::SRem { key, member } => {
                if let Some(set) = self.set(&key)? {
                    set.remove(&member);
                }
                self.drop_if_empty(&key);
            }
            WriteOp::LPush { key, value } => {
                if self.list(&key)?.is_none() {
                    self.insert(&key, Value::List(VecDeque::new()), None);
                }
                if let Some(list) = self.list(&key)? {
                    list.push_front(value);
                }
            }
            WriteOp::LRem { key, value } => {
                if let Some(list) = self.list(&key)? {
                    list.retain(|v| *v != value);
                }
                self.drop_if_empty(&key);
            }
            WriteOp::ZAdd { key, member, score } => {
                if self.zset(&key)?.is_none() {
                    self.insert(&key, Value::ZSet(HashMap::new()), None);
                }
                if let Some(zset) = self.zset(&key)? {
                    zset.insert(member, score);
                }
            }
            WriteOp::Expire { key, secs } => {
                if let Some(entry) = self.live(&key) {
                    entry.expires_at =
                        Some(Instant::now() + Duration::from_secs(secs.max(0) as u64));
                }
            }
            WriteOp::Set { key, value } => {
                self.insert(&key, Value::Str(value), None);
            }
            WriteOp::SetEx { key, value, secs } => {
                self.insert(&key, Value::Str(value), Some(Duration::from_secs(secs)));
            }
        }
        Ok(())
    }
}

/// Glob match supporting `*` and `?`, enough for key scans.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// In-memory implementation of Kv.
#[derive(Debug, Default)]
pub struct MemoryKv {
    db: Mutex<Db>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self) -> MutexGuard<'_, Db> {
        // A failed batch is rolled back before the guard drops.
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn ping(&self) -> Result<bool> {
        Ok(true)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.db().hash(key)?.cloned().unwrap_or_default())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.db().hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.db().string(key)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.db().live(key).is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut db = self.db();
        let existed = db.live(key).is_some();
        db.entries.remove(key);
        Ok(existed)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut db = self.db();
        if db.live(key).is_some() {
            return Ok(false);
        }
        db.insert(
            key,
            Value::Str(value.to_string()),
            Some(Duration::from_secs(ttl_secs)),
        );
        Ok(true)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut members: Vec<String> = self
            .db()
            .set(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.db().set(key)?.is_some_and(|s| s.contains(member)))
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        Ok(self.db().set(key)?.map_or(0, |s| s.len() as u64))
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .db()
            .list(key)?
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zremrangebyscore_below(&self, key: &str, max_exclusive: f64) -> Result<()> {
        let mut db = self.db();
        if let Some(zset) = db.zset(key)? {
            zset.retain(|_, score| *score >= max_exclusive);
        }
        db.drop_if_empty(key);
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.db().zset(key)?.map_or(0, |z| z.len() as u64))
    }

    async fn zmin_score(&self, key: &str) -> Result<Option<f64>> {
        Ok(self
            .db()
            .zset(key)?
            .and_then(|z| z.values().copied().min_by(f64::total_cmp)))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut db = self.db();
        let candidates: Vec<String> = db.entries.keys().cloned().collect();
        let mut keys: Vec<String> = candidates
            .into_iter()
            .filter(|k| glob_match(pattern, k))
            .filter(|k| db.live(k).is_some())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool> {
        let mut db = self.db();
        let Some(hash) = db.hash(key)? else {
            return Ok(false);
        };
        match hash.get_mut(field) {
            Some(current) if current == expected => {
                *current = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut db = self.db();
        // Prior state of each touched key, restored if any op fails.
        let mut undo: HashMap<String, Option<Entry>> = HashMap::new();
        for op in ops {
            if !undo.contains_key(op.key()) {
                let prior = db.entries.get(op.key()).cloned();
                undo.insert(op.key().to_string(), prior);
            }
            if let Err(err) = db.apply(op) {
                for (key, prior) in undo {
                    match prior {
                        Some(entry) => db.entries.insert(key, entry),
                        None => db.entries.remove(&key),
                    };
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hset(key: &str, fields: &[(&str, &str)]) -> WriteOp {
        WriteOp::HSet {
            key: key.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn hset_merges_fields() {
        let kv = MemoryKv::new();
        kv.batch(vec![hset("user:1", &[("name", "Aisha"), ("age", "27")])])
            .await
            .unwrap();
        kv.batch(vec![hset("user:1", &[("age", "28")])]).await.unwrap();

        let record = kv.hgetall("user:1").await.unwrap();
        assert_eq!(record["name"], "Aisha");
        assert_eq!(record["age"], "28");
    }

    #[tokio::test]
    async fn missing_hash_is_empty() {
        let kv = MemoryKv::new();
        assert!(kv.hgetall("user:nope").await.unwrap().is_empty());
        assert_eq!(kv.hget("user:nope", "email").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_batch_applies_nothing() {
        let kv = MemoryKv::new();
        kv.batch(vec![WriteOp::Set {
            key: "plain".into(),
            value: "x".into(),
        }])
        .await
        .unwrap();

        let result = kv
            .batch(vec![
                WriteOp::SAdd {
                    key: "users".into(),
                    member: "1".into(),
                },
                WriteOp::SAdd {
                    key: "plain".into(),
                    member: "1".into(),
                },
            ])
            .await;

        assert!(result.is_err());
        assert!(!kv.sismember("users", "1").await.unwrap());
    }

    #[tokio::test]
    async fn failing_batch_restores_touched_keys() {
        let kv = MemoryKv::new();
        kv.batch(vec![
            hset("user:1", &[("name", "Aisha")]),
            WriteOp::Set {
                key: "plain".into(),
                value: "x".into(),
            },
        ])
        .await
        .unwrap();

        let result = kv
            .batch(vec![
                hset("user:1", &[("name", "Zara"), ("city", "Lahore")]),
                WriteOp::Del {
                    key: "plain".into(),
                },
                WriteOp::Set {
                    key: "plain".into(),
                    value: "y".into(),
                },
                WriteOp::SAdd {
                    key: "user:1".into(),
                    member: "oops".into(),
                },
            ])
            .await;

        assert!(result.is_err());
        let record = kv.hgetall("user:1").await.unwrap();
        assert_eq!(record["name"], "Aisha");
        assert!(!record.contains_key("city"));
        assert_eq!(kv.get("plain").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn lpush_orders_newest_first() {
        let kv = MemoryKv::new();
        for id in ["a", "b", "c"] {
            kv.batch(vec![WriteOp::LPush {
                key: "list".into(),
                value: id.into(),
            }])
            .await
            .unwrap();
        }

        assert_eq!(kv.lrange_all("list").await.unwrap(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn zset_trim_and_min() {
        let kv = MemoryKv::new();
        for (member, score) in [("a", 10.0), ("b", 20.0), ("c", 30.0)] {
            kv.batch(vec![WriteOp::ZAdd {
                key: "z".into(),
                member: member.into(),
                score,
            }])
            .await
            .unwrap();
        }

        kv.zremrangebyscore_below("z", 20.0).await.unwrap();

        assert_eq!(kv.zcard("z").await.unwrap(), 2);
        assert_eq!(kv.zmin_score("z").await.unwrap(), Some(20.0));
    }

    #[tokio::test]
    async fn set_nx_ex_only_sets_once() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_ex("marker", "1", 60).await.unwrap());
        assert!(!kv.set_nx_ex("marker", "1", 60).await.unwrap());
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let kv = MemoryKv::new();
        kv.batch(vec![WriteOp::SetEx {
            key: "gone".into(),
            value: "x".into(),
            secs: 0,
        }])
        .await
        .unwrap();

        assert_eq!(kv.get("gone").await.unwrap(), None);
        assert!(!kv.exists("gone").await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_set_swaps_once() {
        let kv = MemoryKv::new();
        kv.batch(vec![hset("verification:a@b.c:login", &[("isUsed", "false")])])
            .await
            .unwrap();

        let key = "verification:a@b.c:login";
        assert!(kv.hash_compare_and_set(key, "isUsed", "false", "true").await.unwrap());
        assert!(!kv.hash_compare_and_set(key, "isUsed", "false", "true").await.unwrap());
        assert_eq!(kv.hget(key, "isUsed").await.unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn scan_matches_glob() {
        let kv = MemoryKv::new();
        kv.batch(vec![
            hset("user:1", &[("name", "a")]),
            hset("user:2", &[("name", "b")]),
            WriteOp::SAdd {
                key: "user:1:shortlist".into(),
                member: "2".into(),
            },
            hset("interest:9", &[("status", "pending")]),
        ])
        .await
        .unwrap();

        let keys = kv.scan_keys("user:*").await.unwrap();
        assert_eq!(keys, vec!["user:1", "user:1:shortlist", "user:2"]);
    }

    #[test]
    fn glob_handles_wildcards() {
        assert!(glob_match("user:*", "user:123"));
        assert!(glob_match("*:shortlist", "user:1:shortlist"));
        assert!(glob_match("user:?", "user:1"));
        assert!(!glob_match("user:?", "user:12"));
        assert!(!glob_match("interest:*", "user:1"));
    }
}
