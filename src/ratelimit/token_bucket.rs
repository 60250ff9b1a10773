//! Token bucket engine.
//!
//! Tokens refill continuously at `rate / window` up to `burst_size`, and each
//! request spends `cost` tokens. Refill is lazy: it is computed from the time
//! elapsed since `last_refill` whenever the key is read, and it is committed
//! even when the request is rejected.

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

/// Token bucket rate limiter. Permits bursts up to `burst_size`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    core: EngineCore,
}

impl TokenBucket {
    pub fn new(
        config: AlgorithmConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, InvalidConfigError> {
        let core = EngineCore::new(AlgorithmKind::TokenBucket, config, storage, clock)?;
        Ok(Self { core })
    }

    pub fn config(&self) -> &AlgorithmConfig {
        &self.core.config
    }

    fn burst(&self) -> f64 {
        self.core.config.effective_burst() as f64
    }

    /// Seconds needed to accumulate `tokens`.
    fn time_for(&self, tokens: f64) -> Duration {
        clock::secs_f64(tokens / self.core.config.rate_per_sec())
    }

    /// Entries expire once an untouched bucket would be full again anyway.
    fn ttl(&self) -> Duration {
        self.time_for(self.burst()) + self.core.config.window
    }

    /// Apply the refill owed since `last_refill`. Absent keys start full.
    fn refill(&self, current: Option<&PersistedState>, now: DateTime<Utc>) -> PersistedState {
        match current {
            None => PersistedState {
                tokens: self.burst(),
                ..PersistedState::new(now)
            },
            Some(state) => {
                let mut next = state.clone();
                let elapsed = clock::elapsed(now, state.last_refill).as_secs_f64();
                next.tokens = (state.tokens + elapsed * self.core.config.rate_per_sec()).min(self.burst());
                if now > state.last_refill {
                    next.last_refill = now;
                }
                next
            }
        }
    }

    fn snapshot(&self, key: &str, tokens: f64, now: DateTime<Utc>, retry_after: Duration) -> DecisionState {
        let limit = self.core.config.effective_burst();
        let remaining = (tokens.max(0.0) + EPSILON).floor() as u64;
        DecisionState {
            key: key.to_string(),
            limit,
            remaining: remaining.min(limit),
            current: limit.saturating_sub(remaining),
            reset_at: clock::add(now, self.time_for(self.burst() - tokens)),
            retry_after,
            algorithm: AlgorithmKind::TokenBucket,
        }
    }
}

#[async_trait]
impl Algorithm for TokenBucket {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::TokenBucket
    }

    fn limit(&self) -> u64 {
        self.core.config.effective_burst()
    }

    fn window(&self) -> Duration {
        self.core.config.window
    }

    async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
        self.core.check_cost(key, cost, self.limit())?;
        let wanted = cost as f64;

        trace!(key, cost, "Checking token bucket");

        let decision = self
            .core
            .update(scope, key, self.ttl(), |current, now| {
                let mut next = self.refill(current, now);
                if next.tokens + EPSILON >= wanted {
                    next.tokens = (next.tokens - wanted).max(0.0);
                    let state = self.snapshot(key, next.tokens, now, Duration::ZERO);
                    Step::Commit(next, Decision::admit(state))
                } else {
                    let retry_after = self.time_for(wanted - next.tokens);
                    let state = self.snapshot(key, next.tokens, now, retry_after);
                    let decision = Decision::reject(state, self.core.config.window);
                    // Persist the refill: the elapsed time has genuinely passed.
                    if current.is_some() {
                        Step::Commit(next, decision)
                    } else {
                        Step::Skip(decision)
                    }
                }
            })
            .await?;

        if !decision.admitted {
            debug!(
                key,
                cost,
                retry_after_ms = decision.state.retry_after.as_millis() as u64,
                "Token bucket exhausted"
            );
        }
        Ok(decision)
    }

    async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()> {
        let burst = self.burst();
        self.core
            .update(scope, key, self.ttl(), |current, now| match current {
                // An absent bucket is already full.
                None => Step::Skip(()),
                Some(_) => {
                    let mut next = self.refill(current, now);
                    next.tokens = (next.tokens + cost as f64).min(burst);
                    Step::Commit(next, ())
                }
            })
            .await
    }

    async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState> {
        let current = self.core.load(scope, key).await?;
        let now = self.core.clock.now();
        let tokens = self.refill(current.as_ref(), now).tokens;
        let retry_after = if tokens + EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            self.time_for(1.0 - tokens)
        };
        Ok(self.snapshot(key, tokens, now, retry_after))
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
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;

    fn setup(rate: u64, window: Duration, burst: u64) -> (Arc<MockClock>, TokenBucket) {
        let clock = Arc::new(MockClock::at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let storage = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
        let config = AlgorithmConfig::token_bucket(rate, window).with_burst_size(burst);
        let bucket = TokenBucket::new(config, storage, clock.clone()).unwrap();
        (clock, bucket)
    }

    #[tokio::test]
    async fn test_burst_then_reject_then_recover() {
        let (clock, bucket) = setup(10, Duration::from_secs(1), 10);
        let scope = Scope::background();

        for expected_remaining in (0..10).rev() {
            let decision = bucket.allow(&scope, "user:1", 1).await.unwrap();
            assert!(decision.admitted);
            assert_eq!(decision.state.remaining, expected_remaining);
            assert_eq!(decision.state.retry_after, Duration::ZERO);
        }

        let decision = bucket.allow(&scope, "user:1", 1).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.state.retry_after, Duration::from_millis(100));
        let exceeded = decision.exceeded.unwrap();
        assert_eq!(exceeded.limit, 10);
        assert_eq!(exceeded.used, 10);

        clock.advance(Duration::from_secs(1));
        let decision = bucket.allow(&scope, "user:1", 1).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.state.remaining, 9);
    }

    #[tokio::test]
    async fn test_steady_rate_is_sustainable() {
        let (clock, bucket) = setup(10, Duration::from_secs(1), 1);
        let scope = Scope::background();

        for _ in 0..500 {
            let decision = bucket.allow(&scope, "steady", 1).await.unwrap();
            assert!(decision.admitted);
            clock.advance(Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_burst_size_defaults_to_rate() {
        let (_, bucket) = setup(5, Duration::from_secs(1), 0);
        assert_eq!(bucket.limit(), 5);
    }

    #[tokio::test]
    async fn test_rejection_commits_refill_but_not_cost() {
        let (clock, bucket) = setup(10, Duration::from_secs(1), 10);
        let scope = Scope::background();

        bucket.allow(&scope, "k", 10).await.unwrap();
        clock.advance(Duration::from_millis(300));

        let decision = bucket.allow(&scope, "k", 5).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.state.remaining, 3);
        assert_eq!(decision.state.retry_after, Duration::from_millis(200));

        let stored = bucket.core.storage.get("k").await.unwrap().unwrap();
        assert!((stored.tokens - 3.0).abs() < 1e-6);
        assert_eq!(stored.last_refill, clock.now());
    }

    #[tokio::test]
    async fn test_zero_cost_is_rejected_without_state() {
        let (_, bucket) = setup(10, Duration::from_secs(1), 10);
        let err = bucket.allow(&Scope::background(), "k", 0).await.unwrap_err();
        assert!(matches!(err, RateKeeperError::InvalidCost { cost: 0, .. }));
        assert!(!bucket.core.storage.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_cost_above_burst_is_distinct_from_rejection() {
        let (_, bucket) = setup(10, Duration::from_secs(1), 10);
        let err = bucket.allow(&Scope::background(), "k", 11).await.unwrap_err();
        assert!(matches!(
            err,
            RateKeeperError::CostExceedsCapacity { cost: 11, capacity: 10, .. }
        ));
        assert!(!bucket.core.storage.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_state_is_read_only() {
        let (clock, bucket) = setup(10, Duration::from_secs(1), 10);
        let scope = Scope::background();

        let fresh = bucket.state(&scope, "k").await.unwrap();
        assert_eq!(fresh.remaining, 10);
        assert_eq!(fresh.reset_at, clock.now());
        assert!(!bucket.core.storage.exists("k").await.unwrap());

        bucket.allow(&scope, "k", 4).await.unwrap();
        let before = bucket.core.storage.get("k").await.unwrap();
        let state = bucket.state(&scope, "k").await.unwrap();
        assert_eq!(state.remaining, 6);
        assert_eq!(state.current, 4);
        assert_eq!(state.reset_at, clock.now() + chrono::Duration::milliseconds(400));
        assert_eq!(bucket.core.storage.get("k").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_refund_restores_tokens() {
        let (_, bucket) = setup(10, Duration::from_secs(1), 10);
        let scope = Scope::background();

        bucket.allow(&scope, "k", 6).await.unwrap();
        bucket.refund(&scope, "k", 6).await.unwrap();
        assert_eq!(bucket.state(&scope, "k").await.unwrap().remaining, 10);

        // Refunds never overfill the bucket.
        bucket.refund(&scope, "k", 3).await.unwrap();
        assert_eq!(bucket.state(&scope, "k").await.unwrap().remaining, 10);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (_, bucket) = setup(10, Duration::from_secs(1), 10);
        let scope = Scope::background();

        bucket.allow(&scope, "k", 10).await.unwrap();
        bucket.reset(&scope, "k").await.unwrap();
        bucket.reset(&scope, "k").await.unwrap();
        assert!(bucket.allow(&scope, "k", 10).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_overspend() {
        let clock = Arc::new(MockClock::new());
        let storage = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
        let bucket = Arc::new(
            TokenBucket::new(AlgorithmConfig::token_bucket(50, Duration::from_secs(60)), storage, clock)
                .unwrap(),
        );

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::spawn(async move {
                    loop {
                        match bucket.allow(&Scope::background(), "shared", 1).await {
                            Ok(decision) => return decision.admitted,
                            Err(RateKeeperError::Contention { .. }) => continue,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let clock = Arc::new(MockClock::new());
        let storage = Arc::new(MemoryStorage::new());
        let err = TokenBucket::new(
            AlgorithmConfig::fixed_window(10, Duration::from_secs(1)),
            storage,
            clock,
        )
        .unwrap_err();
        assert_eq!(err.field, "algorithm");
    }
}
