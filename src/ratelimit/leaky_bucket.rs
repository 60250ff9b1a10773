//! Leaky bucket engine.
//!
//! A request adds `cost` to the bucket's level, and the level drains at
//! `rate / window`. A request is admitted only if it fits under `capacity`.
//! Unlike the token bucket, a fresh key starts empty with room for only
//! `capacity` units, so output is smoothed rather than bursty.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::algorithm::{
    Algorithm, AlgorithmConfig, AlgorithmKind, Decision, DecisionState, EngineCore, Step, EPSILON,
};
use crate::clock::{self, Clock};
use crate::error::{InvalidConfigError, Result};
use crate::scope::Scope;
use crate::storage::{PersistedState, Storage};

#[derive(Debug, Clone)]
pub struct LeakyBucket {
    core: EngineCore,
}

impl LeakyBucket {
    pub fn new(
        config: AlgorithmConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, InvalidConfigError> {
        let core = EngineCore::new(AlgorithmKind::LeakyBucket, config, storage, clock)?;
        Ok(Self { core })
    }

    pub fn config(&self) -> &AlgorithmConfig {
        &self.core.config
    }

    fn capacity(&self) -> f64 {
        self.core.config.effective_capacity() as f64
    }

    fn time_to_drain(&self, amount: f64) -> Duration {
        clock::secs_f64(amount / self.core.config.rate_per_sec())
    }

    fn ttl(&self) -> Duration {
        self.time_to_drain(self.capacity()) + self.core.config.window
    }

    /// Apply the drain owed since `last_leak`. Absent keys start empty.
    fn leak(&self, current: Option<&PersistedState>, now: DateTime<Utc>) -> PersistedState {
        match current {
            None => PersistedState::new(now),
            Some(state) => {
                let mut next = state.clone();
                let elapsed = clock::elapsed(now, state.last_leak).as_secs_f64();
                next.level = (state.level - elapsed * self.core.config.rate_per_sec()).max(0.0);
                if now > state.last_leak {
                    next.last_leak = now;
                }
                next
            }
        }
    }

    fn snapshot(&self, key: &str, level: f64, now: DateTime<Utc>, retry_after: Duration) -> DecisionState {
        let limit = self.core.config.effective_capacity();
        let level = level.max(0.0);
        let current = ((level - EPSILON).ceil().max(0.0) as u64).min(limit);
        let remaining = ((self.capacity() - level + EPSILON).floor().max(0.0) as u64).min(limit);
        DecisionState {
            key: key.to_string(),
            limit,
            remaining,
            current,
            reset_at: clock::add(now, self.time_to_drain(level)),
            retry_after,
            algorithm: AlgorithmKind::LeakyBucket,
        }
    }
}

#[async_trait]
impl Algorithm for LeakyBucket {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::LeakyBucket
    }

    fn limit(&self) -> u64 {
        self.core.config.effective_capacity()
    }

    fn window(&self) -> Duration {
        self.core.config.window
    }

    async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
        self.core.check_cost(key, cost, self.limit())?;
        let added = cost as f64;
        let capacity = self.capacity();

        trace!(key, cost, "Checking leaky bucket");

        let decision = self
            .core
            .update(scope, key, self.ttl(), |current, now| {
                let mut next = self.leak(current, now);
                if next.level + added <= capacity + EPSILON {
                    next.level = (next.level + added).min(capacity);
                    let state = self.snapshot(key, next.level, now, Duration::ZERO);
                    Step::Commit(next, Decision::admit(state))
                } else {
                    let retry_after = self.time_to_drain(next.level + added - capacity);
                    let state = self.snapshot(key, next.level, now, retry_after);
                    Step::Skip(Decision::reject(state, self.core.config.window))
                }
            })
            .await?;

        if !decision.admitted {
            debug!(
                key,
                cost,
                retry_after_ms = decision.state.retry_after.as_millis() as u64,
                "Leaky bucket full"
            );
        }
        Ok(decision)
    }

    async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()> {
        self.core
            .update(scope, key, self.ttl(), |current, now| match current {
                None => Step::Skip(()),
                Some(_) => {
                    let mut next = self.leak(current, now);
                    next.level = (next.level - cost as f64).max(0.0);
                    Step::Commit(next, ())
                }
            })
            .await
    }

    async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState> {
        let current = self.core.load(scope, key).await?;
        let now = self.core.clock.now();
        let level = self.leak(current.as_ref(), now).level;
        let overflow = level + 1.0 - self.capacity();
        let retry_after = if overflow <= EPSILON {
            Duration::ZERO
        } else {
            self.time_to_drain(overflow)
        };
        Ok(self.snapshot(key, level, now, retry_after))
    }

    async fn reset(&self, scope: &Scope, key: &str) -> Result<()> {
        self.core.reset(scope, key).await
    }

    async fn close(&self) -> Result<()> {
        self.core.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::RateKeeperError;
    use crate::ratelimit::TokenBucket;
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;

    fn setup(config: AlgorithmConfig) -> (Arc<MockClock>, Arc<MemoryStorage>, LeakyBucket) {
        let clock = Arc::new(MockClock::at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let storage = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
        let bucket = LeakyBucket::new(config, storage.clone(), clock.clone()).unwrap();
        (clock, storage, bucket)
    }

    #[tokio::test]
    async fn test_smooths_instead_of_bursting() {
        let (clock, storage, leaky) = setup(AlgorithmConfig::leaky_bucket(10, Duration::from_secs(1)));
        let token = TokenBucket::new(
            AlgorithmConfig::token_bucket(10, Duration::from_secs(1)),
            storage,
            clock.clone(),
        )
        .unwrap();
        let scope = Scope::background();

        let mut token_admitted = 0;
        let mut leaky_admitted = 0;
        for _ in 0..10 {
            token_admitted += token.allow(&scope, "tb", 1).await.unwrap().admitted as u32;
            leaky_admitted += leaky.allow(&scope, "lb", 1).await.unwrap().admitted as u32;
        }
        assert_eq!(token_admitted, 10);
        assert_eq!(leaky_admitted, 1);

        let decision = leaky.allow(&scope, "lb", 1).await.unwrap();
        assert_eq!(decision.state.retry_after, Duration::from_millis(100));

        for _ in 0..20 {
            clock.advance(Duration::from_millis(100));
            assert!(leaky.allow(&scope, "lb", 1).await.unwrap().admitted);
            assert!(!leaky.allow(&scope, "lb", 1).await.unwrap().admitted);
        }
    }

    #[tokio::test]
    async fn test_level_never_exceeds_capacity() {
        let (clock, storage, bucket) = setup(
            AlgorithmConfig::leaky_bucket(2, Duration::from_secs(1)).with_capacity(5),
        );
        let scope = Scope::background();

        for i in 0..50u64 {
            let _ = bucket.allow(&scope, "k", 1 + i % 3).await.unwrap();
            let level = storage.get("k").await.unwrap().map_or(0.0, |s| s.level);
            assert!(level <= 5.0 + 1e-9, "level {level} after step {i}");
            clock.advance(Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_spaced_admissions_never_accumulate() {
        let (clock, storage, bucket) = setup(
            AlgorithmConfig::leaky_bucket(2, Duration::from_secs(1)).with_capacity(4),
        );
        let scope = Scope::background();

        for _ in 0..6 {
            assert!(bucket.allow(&scope, "k", 3).await.unwrap().admitted);
            let level = storage.get("k").await.unwrap().unwrap().level;
            assert!((level - 3.0).abs() < 1e-9, "level {level}");
            // capacity / rate
            clock.advance(Duration::from_secs(2));
            assert_eq!(bucket.state(&scope, "k").await.unwrap().current, 0);
        }
    }

    #[tokio::test]
    async fn test_rejection_reports_drain_time() {
        let (clock, storage, bucket) = setup(
            AlgorithmConfig::leaky_bucket(4, Duration::from_secs(1)).with_capacity(4),
        );
        let scope = Scope::background();

        assert!(bucket.allow(&scope, "k", 4).await.unwrap().admitted);
        let before = storage.get("k").await.unwrap();

        let decision = bucket.allow(&scope, "k", 2).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.state.retry_after, Duration::from_millis(500));
        assert_eq!(decision.state.current, 4);
        assert_eq!(decision.state.remaining, 0);
        assert_eq!(decision.state.reset_at, clock.now() + chrono::Duration::seconds(1));
        assert_eq!(storage.get("k").await.unwrap(), before);

        clock.advance(Duration::from_millis(500));
        assert!(bucket.allow(&scope, "k", 2).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_refund_lowers_level() {
        let (_, _, bucket) = setup(
            AlgorithmConfig::leaky_bucket(1, Duration::from_secs(1)).with_capacity(3),
        );
        let scope = Scope::background();

        bucket.allow(&scope, "k", 3).await.unwrap();
        bucket.refund(&scope, "k", 2).await.unwrap();
        let state = bucket.state(&scope, "k").await.unwrap();
        assert_eq!(state.current, 1);
        assert_eq!(state.remaining, 2);

        bucket.refund(&scope, "k", 5).await.unwrap();
        assert_eq!(bucket.state(&scope, "k").await.unwrap().current, 0);
    }

    #[tokio::test]
    async fn test_cost_above_capacity() {
        let (_, _, bucket) = setup(AlgorithmConfig::leaky_bucket(10, Duration::from_secs(1)));
        let err = bucket.allow(&Scope::background(), "k", 2).await.unwrap_err();
        assert!(matches!(err, RateKeeperError::CostExceedsCapacity { capacity: 1, .. }));
    }
}
