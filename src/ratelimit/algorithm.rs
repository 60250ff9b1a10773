//! Algorithm contract shared by the rate limiting engines.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::clock::Clock;
use crate::error::{InvalidConfigError, LimitExceededError, RateKeeperError, Result};
use crate::scope::Scope;
use crate::storage::{PersistedState, Storage};

/// How many optimistic read-modify-write rounds an engine attempts per call.
pub const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Tolerance for floating point drift in token and level arithmetic.
pub(crate) const EPSILON: f64 = 1e-9;

/// Default cap on stored sliding window entries per key.
pub const DEFAULT_MAX_TIMESTAMPS: usize = 10_000;

/// The available admission algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    LeakyBucket,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::TokenBucket => "token_bucket",
            AlgorithmKind::FixedWindow => "fixed_window",
            AlgorithmKind::SlidingWindow => "sliding_window",
            AlgorithmKind::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmKind {
    type Err = InvalidConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "token_bucket" => Ok(AlgorithmKind::TokenBucket),
            "fixed_window" => Ok(AlgorithmKind::FixedWindow),
            "sliding_window" => Ok(AlgorithmKind::SlidingWindow),
            "leaky_bucket" => Ok(AlgorithmKind::LeakyBucket),
            other => Err(InvalidConfigError::new(
                "algorithm",
                other,
                "must be one of: token_bucket, fixed_window, sliding_window, leaky_bucket",
            )),
        }
    }
}

/// Validated engine configuration.
///
/// `rate` is counted per `window`. Which of the remaining fields matter
/// depends on the algorithm:
/// - token bucket: `burst_size` (bucket capacity, defaults to `rate` when 0)
/// - fixed window: `align_windows` (epoch-aligned instead of first-request-aligned)
/// - sliding window: `max_timestamps` (entry cap before coarsening)
/// - leaky bucket: `capacity` (queue capacity, defaults to 1 when 0)
///
/// `key_prefix` namespaces every storage key the engine touches, so engines
/// sharing one store never read each other's state. Decisions still report
/// the caller's key.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmConfig {
    pub kind: AlgorithmKind,
    pub rate: u64,
    pub window: Duration,
    pub burst_size: u64,
    pub capacity: u64,
    pub max_timestamps: usize,
    pub align_windows: bool,
    pub key_prefix: String,
}

impl AlgorithmConfig {
    pub fn new(kind: AlgorithmKind, rate: u64, window: Duration) -> Self {
        Self {
            kind,
            rate,
            window,
            burst_size: 0,
            capacity: 0,
            max_timestamps: DEFAULT_MAX_TIMESTAMPS,
            align_windows: false,
            key_prefix: String::new(),
        }
    }

    pub fn token_bucket(rate: u64, window: Duration) -> Self {
        Self::new(AlgorithmKind::TokenBucket, rate, window)
    }

    pub fn fixed_window(rate: u64, window: Duration) -> Self {
        Self::new(AlgorithmKind::FixedWindow, rate, window)
    }

    pub fn sliding_window(rate: u64, window: Duration) -> Self {
        Self::new(AlgorithmKind::SlidingWindow, rate, window)
    }

    pub fn leaky_bucket(rate: u64, window: Duration) -> Self {
        Self::new(AlgorithmKind::LeakyBucket, rate, window)
    }

    pub fn with_burst_size(mut self, burst_size: u64) -> Self {
        self.burst_size = burst_size;
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_timestamps(mut self, max_timestamps: usize) -> Self {
        self.max_timestamps = max_timestamps;
        self
    }

    pub fn with_aligned_windows(mut self, align: bool) -> Self {
        self.align_windows = align;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Check every field. Engines call this on construction.
    pub fn validate(&self) -> std::result::Result<(), InvalidConfigError> {
        if self.rate == 0 {
            return Err(InvalidConfigError::new("rate", self.rate, "must be positive"));
        }
        if self.window.is_zero() {
            return Err(InvalidConfigError::new(
                "window",
                format!("{:?}", self.window),
                "must be positive",
            ));
        }
        if self.kind == AlgorithmKind::FixedWindow && self.rate > i64::MAX as u64 {
            return Err(InvalidConfigError::new(
                "rate",
                self.rate,
                "fixed window counters hold at most i64::MAX",
            ));
        }
        if self.kind == AlgorithmKind::SlidingWindow && self.max_timestamps < 2 {
            return Err(InvalidConfigError::new(
                "max_timestamps",
                self.max_timestamps,
                "must be at least 2",
            ));
        }
        Ok(())
    }

    /// Token bucket capacity.
    pub fn effective_burst(&self) -> u64 {
        if self.burst_size == 0 {
            self.rate
        } else {
            self.burst_size
        }
    }

    /// Leaky bucket queue capacity.
    pub fn effective_capacity(&self) -> u64 {
        if self.capacity == 0 {
            1
        } else {
            self.capacity
        }
    }

    /// Units per second.
    pub fn rate_per_sec(&self) -> f64 {
        self.rate as f64 / self.window.as_secs_f64()
    }
}

/// Derived, user-facing view of one key's limiter state. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionState {
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    pub current: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Duration,
    pub algorithm: AlgorithmKind,
}

/// Outcome of an [`Algorithm::allow`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub admitted: bool,
    pub state: DecisionState,
    /// Populated when the request was rejected.
    pub exceeded: Option<LimitExceededError>,
    /// Set when the decision came from a fallback policy instead of primary storage.
    pub degraded: bool,
}

impl Decision {
    pub fn admit(state: DecisionState) -> Self {
        Self {
            admitted: true,
            state,
            exceeded: None,
            degraded: false,
        }
    }

    pub fn reject(state: DecisionState, window: Duration) -> Self {
        let exceeded = LimitExceededError {
            key: state.key.clone(),
            limit: state.limit,
            used: state.current,
            window,
            retry_after: state.retry_after,
            reset_at: state.reset_at,
        };
        Self {
            admitted: false,
            state,
            exceeded: Some(exceeded),
            degraded: false,
        }
    }

    pub fn into_degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}

/// A stateful admission algorithm.
///
/// Engines hold no locks across calls; per-key atomicity comes from the
/// storage layer's compare-and-set.
#[async_trait]
pub trait Algorithm: Send + Sync {
    fn kind(&self) -> AlgorithmKind;

    /// Maximum units a key can hold or consume at once.
    fn limit(&self) -> u64;

    fn window(&self) -> Duration;

    /// Decide on a request of `cost` units, consuming capacity only when admitted.
    ///
    /// Fails with [`RateKeeperError::Contention`] rather than deciding when
    /// every one of the [`MAX_UPDATE_ATTEMPTS`] compare-and-set rounds loses
    /// to a concurrent writer. Nothing is consumed in that case, so callers
    /// may retry.
    async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision>;

    /// Credit back `cost` units consumed by an earlier admission.
    async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()>;

    /// Undo `admission`, an earlier admitted decision for `key`, crediting
    /// `cost` back to whichever state served it.
    async fn revert(&self, scope: &Scope, key: &str, cost: u64, admission: &Decision) -> Result<()> {
        let _ = admission;
        self.refund(scope, key, cost).await
    }

    /// Current state for `key` without mutating anything.
    async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState>;

    /// Forget all state for `key`. Idempotent.
    async fn reset(&self, scope: &Scope, key: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// What a read-modify-write step decided to do with the current state.
pub(crate) enum Step<T> {
    /// Write the new state, then return the value.
    Commit(PersistedState, T),
    /// Leave storage untouched.
    Skip(T),
}

/// Storage, clock and config shared by every engine.
#[derive(Clone)]
pub(crate) struct EngineCore {
    pub(crate) config: AlgorithmConfig,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCore")
            .field("config", &self.config)
            .field("backend", &self.storage.backend())
            .field("clock", &self.clock)
            .finish()
    }
}

impl EngineCore {
    pub(crate) fn new(
        expected: AlgorithmKind,
        config: AlgorithmConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, InvalidConfigError> {
        if config.kind != expected {
            return Err(InvalidConfigError::new(
                "algorithm",
                config.kind,
                format!("engine requires {expected}"),
            ));
        }
        config.validate()?;
        Ok(Self {
            config,
            storage,
            clock,
        })
    }

    /// Reject costs that are zero or can never fit in `capacity`.
    pub(crate) fn check_cost(&self, key: &str, cost: u64, capacity: u64) -> Result<()> {
        if cost == 0 {
            return Err(RateKeeperError::InvalidCost {
                key: key.to_string(),
                cost,
            });
        }
        if cost > capacity {
            return Err(RateKeeperError::CostExceedsCapacity {
                key: key.to_string(),
                cost,
                capacity,
            });
        }
        Ok(())
    }

    /// Where `key` lives in storage.
    pub(crate) fn storage_key<'a>(&self, key: &'a str) -> Cow<'a, str> {
        if self.config.key_prefix.is_empty() {
            Cow::Borrowed(key)
        } else {
            Cow::Owned(format!("{}{key}", self.config.key_prefix))
        }
    }

    pub(crate) async fn load(&self, scope: &Scope, key: &str) -> Result<Option<PersistedState>> {
        scope.run(self.storage.get(&self.storage_key(key))).await
    }

    /// Optimistically update `key`: read, let `step` decide, commit with
    /// compare-and-set, and retry when another writer got there first.
    pub(crate) async fn update<T, F>(
        &self,
        scope: &Scope,
        key: &str,
        ttl: Duration,
        mut step: F,
    ) -> Result<T>
    where
        F: FnMut(Option<&PersistedState>, DateTime<Utc>) -> Step<T> + Send,
        T: Send,
    {
        let stored = self.storage_key(key);
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = scope.run(self.storage.get(&stored)).await?;
            let now = self.clock.now();

            match step(current.as_ref(), now) {
                Step::Skip(value) => return Ok(value),
                Step::Commit(mut next, value) => {
                    next.updated_at = now;
                    let expected = current.as_ref().map(|s| s.version);
                    let won = scope
                        .run(self.storage.compare_and_set(&stored, expected, next, Some(ttl)))
                        .await?;
                    if won {
                        return Ok(value);
                    }
                    trace!(key, attempt, "Concurrent update detected, retrying");
                }
            }
        }

        Err(RateKeeperError::Contention {
            key: key.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    pub(crate) async fn reset(&self, scope: &Scope, key: &str) -> Result<()> {
        scope.run(self.storage.delete(&self.storage_key(key))).await
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.storage.close().await.map_err(Into::into)
    }
}
