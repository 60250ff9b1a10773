//! In-process, memory-bounded storage backend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{glob_pattern, PersistedState, Storage, StorageResult};
use crate::clock::{self, Clock, SystemClock};
use crate::error::StorageError;

const BACKEND: &str = "memory";

/// Default maximum number of tracked keys.
pub const DEFAULT_MAX_KEYS: usize = 10_000;
/// Default interval between expired-entry sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Upper bound on live keys. Inserting past it evicts the least recently
    /// written key. Concurrent inserts may overshoot by the number of racing
    /// writers.
    pub max_keys: usize,
    /// Sweep interval used by [`MemoryStorage::spawn_janitor`].
    pub cleanup_interval: Duration,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_keys: DEFAULT_MAX_KEYS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    state: PersistedState,
    expires_at: Option<DateTime<Utc>>,
    /// Write sequence, used to pick eviction victims.
    touched: u64,
}

impl Slot {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Thread-safe in-memory store backed by a sharded map.
#[derive(Debug)]
pub struct MemoryStorage {
    slots: DashMap<String, Slot>,
    config: MemoryStorageConfig,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl MemoryStorage {
    /// Create a store with default limits and the system clock.
    pub fn new() -> Self {
        Self::with_config(MemoryStorageConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_config(config: MemoryStorageConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            config,
            clock,
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &MemoryStorageConfig {
        &self.config
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(removed, "Purged expired entries");
        }
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) every `cleanup_interval`
    /// until the store is closed or dropped.
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let every = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match store.upgrade() {
                        Some(store) => {
                            store.purge_expired();
                        }
                        None => break,
                    },
                }
            }
            trace!("Memory storage janitor stopped");
        })
    }

    fn ensure_open(&self, operation: &'static str) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::new(BACKEND, operation, "storage is closed"));
        }
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.filter(|t| !t.is_zero()).map(|t| clock::add(now, t))
    }

    /// Make space for `key` if it is new and the store is full.
    fn make_room(&self, key: &str) {
        if self.slots.len() < self.config.max_keys || self.slots.contains_key(key) {
            return;
        }
        if self.purge_expired() > 0 && self.slots.len() < self.config.max_keys {
            return;
        }

        let victim = self
            .slots
            .iter()
            .min_by_key(|e| e.value().touched)
            .map(|e| e.key().clone());
        if let Some(victim) = victim {
            debug!(key = %victim, "Evicting least recently written key");
            self.slots.remove(&victim);
        }
    }

    fn stamp(&self, mut state: PersistedState, now: DateTime<Utc>, ttl: Option<Duration>) -> Slot {
        let touched = self.next_sequence();
        state.version = touched;
        Slot {
            state,
            expires_at: self.expiry(now, ttl),
            touched,
        }
    }

    fn live_state(&self, key: &str, now: DateTime<Utc>) -> Option<PersistedState> {
        self.slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.state.clone())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn get(&self, key: &str) -> StorageResult<Option<PersistedState>> {
        self.ensure_open("get").map_err(|e| e.with_key(key))?;
        Ok(self.live_state(key, self.clock.now()))
    }

    async fn set(&self, key: &str, state: PersistedState, ttl: Option<Duration>) -> StorageResult<()> {
        self.ensure_open("set").map_err(|e| e.with_key(key))?;
        let now = self.clock.now();
        self.make_room(key);
        let slot = self.stamp(state, now, ttl);
        self.slots.insert(key.to_string(), slot);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        state: PersistedState,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        self.ensure_open("compare_and_set").map_err(|e| e.with_key(key))?;
        let now = self.clock.now();
        self.make_room(key);

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let current_version = current.is_live(now).then_some(current.state.version);
                if current_version != expected_version {
                    trace!(key, ?expected_version, ?current_version, "Version conflict");
                    return Ok(false);
                }
                let slot = self.stamp(state, now, ttl);
                occupied.insert(slot);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected_version.is_some() {
                    return Ok(false);
                }
                let slot = self.stamp(state, now, ttl);
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn incr(&self, key: &str, amount: i64, ttl: Option<Duration>) -> StorageResult<i64> {
        self.ensure_open("incr").map_err(|e| e.with_key(key))?;
        let now = self.clock.now();
        self.make_room(key);

        let touched = self.next_sequence();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            state: PersistedState::new(now),
            expires_at: self.expiry(now, ttl),
            touched,
        });

        if !slot.is_live(now) {
            slot.state = PersistedState::new(now);
            slot.expires_at = self.expiry(now, ttl);
        }
        slot.state.count = slot.state.count.checked_add(amount).ok_or_else(|| {
            StorageError::new(BACKEND, "incr", "counter overflow").with_key(key)
        })?;
        slot.state.updated_at = now;
        slot.state.version = touched;
        slot.touched = touched;
        Ok(slot.state.count)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_open("delete").map_err(|e| e.with_key(key))?;
        self.slots.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.ensure_open("exists").map_err(|e| e.with_key(key))?;
        let now = self.clock.now();
        Ok(self.slots.get(key).is_some_and(|slot| slot.is_live(now)))
    }

    async fn get_multi(&self, keys: &[String]) -> StorageResult<Vec<Option<PersistedState>>> {
        self.ensure_open("get_multi")?;
        let now = self.clock.now();
        Ok(keys.iter().map(|key| self.live_state(key, now)).collect())
    }

    async fn set_multi(
        &self,
        states: Vec<(String, PersistedState)>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.ensure_open("set_multi")?;
        let now = self.clock.now();
        for (key, state) in states {
            self.make_room(&key);
            let slot = self.stamp(state, now, ttl);
            self.slots.insert(key, slot);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        self.ensure_open("keys")?;
        let matcher = glob_pattern(pattern).map_err(|e| StorageError::new(BACKEND, "keys", e))?;
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|e| e.value().is_live(now) && matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> StorageResult<()> {
        self.ensure_open("ping")
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            self.slots.clear();
            debug!("Memory storage closed");
        }
        Ok(())
    }
}
