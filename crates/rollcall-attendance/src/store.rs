//! # Record store
//!
//! One hash per student under `student:{reg_number}`, holding string fields
//! (`name`, `major`, `face_embedding`, `last_attendance`, `total_attendance`,
//! `registration_date`). Counters only move through the store's atomic
//! increment so concurrent markers never lose an update.
//!
//! [`RedisStore`] is the deployed backend; [`MemoryStore`] keeps the same
//! semantics in-process.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use redis::Commands;
use thiserror::Error;

pub const STUDENT_KEY_PREFIX: &str = "student:";
pub const STUDENT_KEY_PATTERN: &str = "student:*";
/// Channel notified after every successful registration.
pub const DATA_UPDATE_CHANNEL: &str = "data_update";

pub fn student_key(reg_number: &str) -> String {
    format!("{STUDENT_KEY_PREFIX}{reg_number}")
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("field {field} of {key} is not an integer")]
    NotAnInteger { key: String, field: String },
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Keyed hash-map store.
pub trait RecordStore: Send + Sync {
    /// All fields of `key`; empty when the key does not exist.
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    fn hash_set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// Atomically add `by` to an integer field (missing counts as 0) and
    /// return the new value.
    fn hash_increment(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    /// Write `fields` and add `by` to `counter` as one step, returning the
    /// new counter value.
    ///
    /// Backends that can do both atomically override this. The fallback
    /// writes the fields first so a failed write never leaves the counter
    /// bumped.
    fn hash_set_and_increment(
        &self,
        key: &str,
        fields: &[(&str, String)],
        counter: &str,
        by: i64,
    ) -> Result<i64, StoreError> {
        self.hash_set_fields(key, fields)?;
        self.hash_increment(key, counter, by)
    }

    /// Keys matching a glob pattern (`*`, `?`).
    fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;
}

/// Redis-backed store over one lazily (re)established connection.
///
/// Every command runs with the configured read/write timeout. A connection
/// that fails with an I/O or timeout error is dropped and re-opened on the
/// next call.
pub struct RedisStore {
    client: redis::Client,
    timeout: Duration,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisStore {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            timeout,
            conn: Mutex::new(None),
        })
    }

    /// Round-trip a PING, establishing the connection if needed.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| redis::cmd("PING").query::<String>(conn).map(|_| ()))
    }

    fn connect(&self) -> Result<redis::Connection, StoreError> {
        let conn = self.client.get_connection_with_timeout(self.timeout)?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        tracing::info!(timeout_ms = self.timeout.as_millis() as u64, "redis connection established");
        Ok(conn)
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, StoreError> {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(self.connect()?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(StoreError::Unavailable("no redis connection".into()));
        };

        match op(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
                    tracing::warn!(error = %err, "dropping redis connection");
                    *slot = None;
                }
                Err(err.into())
            }
        }
    }
}

impl RecordStore for RedisStore {
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_connection(|conn| conn.hgetall(key))
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.with_connection(|conn| conn.hget(key, field))
    }

    fn hash_set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.with_connection(|conn| conn.hset_multiple(key, fields))
    }

    fn hash_increment(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        self.with_connection(|conn| conn.hincr(key, field, by))
    }

    fn hash_set_and_increment(
        &self,
        key: &str,
        fields: &[(&str, String)],
        counter: &str,
        by: i64,
    ) -> Result<i64, StoreError> {
        self.with_connection(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            if !fields.is_empty() {
                pipe.hset_multiple(key, fields).ignore();
            }
            pipe.hincr(key, counter, by)
                .query::<(i64,)>(conn)
                .map(|(total,)| total)
        })
    }

    fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.with_connection(|conn| conn.keys(pattern))
    }

    fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| conn.publish::<_, _, i64>(channel, message).map(|_| ()))
    }
}

/// In-process store with Redis hash semantics.
///
/// Keys enumerate in sorted order. [`MemoryStore::set_available`] simulates
/// an unreachable backend: every call then fails with
/// [`StoreError::Unavailable`].
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, HashMap<String, String>>>,
    published: Mutex<Vec<(String, String)>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Messages published so far, as `(channel, message)`.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, HashMap<String, String>>>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl RecordStore for MemoryStore {
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.records()?.get(key).cloned().unwrap_or_default())
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records()?.get(key).and_then(|r| r.get(field).cloned()))
    }

    fn hash_set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut records = self.records()?;
        let record = records.entry(key.to_string()).or_default();
        for (field, value) in fields {
            record.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    fn hash_increment(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut records = self.records()?;
        let record = records.entry(key.to_string()).or_default();
        let current = match record.get(field) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
                field: field.to_string(),
            })?,
        };
        let next = current + by;
        record.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    fn hash_set_and_increment(
        &self,
        key: &str,
        fields: &[(&str, String)],
        counter: &str,
        by: i64,
    ) -> Result<i64, StoreError> {
        let mut records = self.records()?;
        let record = records.entry(key.to_string()).or_default();
        // Validate the counter before touching anything.
        let current = match record.get(counter) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
                field: counter.to_string(),
            })?,
        };
        for (field, value) in fields {
            record.insert(field.to_string(), value.clone());
        }
        let next = current + by;
        record.insert(counter.to_string(), next.to_string());
        Ok(next)
    }

    fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records()?
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

/// Glob match with `*` (any run) and `?` (any one char).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Last `*` position in the pattern and the text index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, at)) = backtrack {
            pi = star + 1;
            ti = at + 1;
            backtrack = Some((star, at + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
