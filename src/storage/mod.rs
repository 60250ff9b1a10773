//! Storage contract for rate limiter state.
//!
//! Engines never cache state between calls: every decision re-reads the
//! [`PersistedState`] for its key and commits through
//! [`Storage::compare_and_set`]. The storage layer is the only lock boundary.

mod memory;

pub use memory::{MemoryStorage, MemoryStorageConfig};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A batch of request weight recorded at one instant (sliding window).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub at: DateTime<Utc>,
    pub weight: u64,
}

/// Backend-agnostic state persisted per rate key.
///
/// Only the fields of the algorithm owning the key are meaningful:
/// - token bucket: `tokens`, `last_refill`
/// - fixed window: `count`, `window_start`
/// - sliding window: `timestamps`
/// - leaky bucket: `level`, `last_leak`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
    pub count: i64,
    pub window_start: DateTime<Utc>,
    pub timestamps: Vec<WindowEntry>,
    pub level: f64,
    pub last_leak: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Write version, assigned by the store. Callers never set it.
    #[serde(default)]
    pub version: u64,
}

impl PersistedState {
    /// Empty state created at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_refill: now,
            window_start: now,
            last_leak: now,
            created_at: now,
            updated_at: now,
            ..Self::default()
        }
    }
}

/// Key-addressed state store.
///
/// Implementations must be safe for concurrent use. A `ttl` of `None` means
/// the entry never expires; expired entries are invisible to every operation.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Name used in error context ("memory", "redis", ...).
    fn backend(&self) -> &str;

    /// Fetch the state for `key`, `None` if absent.
    async fn get(&self, key: &str) -> StorageResult<Option<PersistedState>>;

    /// Unconditionally store `state` for `key`.
    async fn set(&self, key: &str, state: PersistedState, ttl: Option<Duration>) -> StorageResult<()>;

    /// Store `state` only if the current version matches `expected_version`
    /// (`None` meaning the key must be absent). Returns whether the write won.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        state: PersistedState,
        ttl: Option<Duration>,
    ) -> StorageResult<bool>;

    /// Atomically add `amount` to the key's counter, creating it if absent.
    async fn incr(&self, key: &str, amount: i64, ttl: Option<Duration>) -> StorageResult<i64>;

    /// Remove `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Fetch several keys; the result is aligned with `keys`.
    async fn get_multi(&self, keys: &[String]) -> StorageResult<Vec<Option<PersistedState>>>;

    async fn set_multi(
        &self,
        states: Vec<(String, PersistedState)>,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Keys matching a glob pattern (`*`, `?`). Diagnostic use only.
    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>>;

    /// Liveness probe.
    async fn ping(&self) -> StorageResult<()>;

    /// Release resources. Later calls fail.
    async fn close(&self) -> StorageResult<()>;
}

/// Compile a glob pattern (`*`, `?`) into an anchored regex.
pub fn glob_pattern(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}
