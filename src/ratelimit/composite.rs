//! Composite admission across several rate dimensions.
//!
//! A request is admitted only if every dimension admits it. Dimensions are
//! evaluated in order with real, state-consuming calls. The first denial
//! stops evaluation, and the dimensions that already admitted get their cost
//! refunded in reverse order.
//!
//! Refunds are not transactional. A concurrent request on the same key can
//! observe the consumed capacity between admission and refund, and a refund
//! that fails leaves that capacity consumed until it naturally recovers.
//! Failed refunds are reported on the decision. Put the dimension most likely
//! to deny first to keep refunds rare.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::algorithm::{Algorithm, Decision, DecisionState};
use super::context::{KeyStrategy, RequestContext};
use crate::error::{InvalidConfigError, LimitExceededError, RateKeeperError, Result};
use crate::scope::Scope;

/// One rate dimension: how to key the request and which limiter enforces it.
#[derive(Clone)]
pub struct Dimension {
    strategy: KeyStrategy,
    limiter: Arc<dyn Algorithm>,
}

impl Dimension {
    pub fn new(strategy: KeyStrategy, limiter: impl Algorithm + 'static) -> Self {
        Self {
            strategy,
            limiter: Arc::new(limiter),
        }
    }

    pub fn strategy(&self) -> &KeyStrategy {
        &self.strategy
    }

    pub fn limiter(&self) -> &Arc<dyn Algorithm> {
        &self.limiter
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dimension")
            .field("strategy", &self.strategy)
            .field("algorithm", &self.limiter.kind())
            .field("limit", &self.limiter.limit())
            .finish()
    }
}

/// What one dimension decided for a composite request.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionOutcome {
    pub strategy: KeyStrategy,
    pub key: String,
    pub decision: Decision,
    /// Set when this dimension's admission was credited back.
    pub refunded: bool,
}

/// A refund that could not be applied during compensation.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundFailure {
    pub strategy: KeyStrategy,
    pub key: String,
    pub error: String,
}

/// Aggregate outcome of [`CompositeLimiter::allow`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeDecision {
    pub admitted: bool,
    /// The denying dimension's state, or the most restrictive state when admitted.
    pub state: DecisionState,
    pub exceeded: Option<LimitExceededError>,
    pub denied_by: Option<KeyStrategy>,
    /// Outcomes in evaluation order. Dimensions after a denial are absent.
    pub dimensions: Vec<DimensionOutcome>,
    pub refund_failures: Vec<RefundFailure>,
    /// Set when any dimension was answered by a fallback policy.
    pub degraded: bool,
}

/// Enforces several dimensions as one logical gate.
#[derive(Debug, Clone)]
pub struct CompositeLimiter {
    dimensions: Vec<Dimension>,
}

impl CompositeLimiter {
    /// Dimensions are evaluated in the given order. At least one is required
    /// and each strategy may appear only once.
    pub fn new(dimensions: Vec<Dimension>) -> std::result::Result<Self, InvalidConfigError> {
        if dimensions.is_empty() {
            return Err(InvalidConfigError::new("dimensions", "[]", "at least one dimension is required"));
        }
        let mut seen = HashSet::new();
        for dimension in &dimensions {
            if !seen.insert(dimension.strategy.clone()) {
                return Err(InvalidConfigError::new(
                    "dimensions",
                    &dimension.strategy,
                    "strategy configured more than once",
                ));
            }
        }
        Ok(Self { dimensions })
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Derive every dimension's key up front. A missing key is a
    /// configuration error for this request, never a silent pass.
    fn keys(&self, ctx: &RequestContext) -> Result<Vec<String>> {
        self.dimensions
            .iter()
            .map(|d| {
                ctx.key(&d.strategy).ok_or_else(|| RateKeeperError::EmptyKey {
                    strategy: d.strategy.to_string(),
                })
            })
            .collect()
    }

    /// Admit `ctx` only if every dimension admits `cost`.
    pub async fn allow(&self, scope: &Scope, ctx: &RequestContext, cost: u64) -> Result<CompositeDecision> {
        let keys = self.keys(ctx)?;
        let mut outcomes: Vec<DimensionOutcome> = Vec::with_capacity(self.dimensions.len());
        let mut tightest: Option<DecisionState> = None;

        for (dimension, key) in self.dimensions.iter().zip(&keys) {
            let decision = match dimension.limiter.allow(scope, key, cost).await {
                Ok(decision) => decision,
                // Cancelled: leave state as of the last committed call.
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(
                        strategy = %dimension.strategy,
                        key = %key,
                        error = %e,
                        "Composite dimension failed, compensating"
                    );
                    let refund_failures = self.compensate(scope, &mut outcomes, cost).await;
                    if refund_failures.is_empty() {
                        return Err(e);
                    }
                    return Err(RateKeeperError::CompensationFailed {
                        source: Box::new(e),
                        refund_failures,
                    });
                }
            };

            let denial = (!decision.admitted).then(|| (decision.state.clone(), decision.exceeded.clone()));
            if denial.is_none() && tightest.as_ref().map_or(true, |t| Self::tighter(&decision.state, t)) {
                tightest = Some(decision.state.clone());
            }
            outcomes.push(DimensionOutcome {
                strategy: dimension.strategy.clone(),
                key: key.clone(),
                decision,
                refunded: false,
            });

            if let Some((state, exceeded)) = denial {
                debug!(strategy = %dimension.strategy, key = %key, "Composite request denied");
                let refund_failures = self.compensate(scope, &mut outcomes, cost).await;
                return Ok(CompositeDecision {
                    admitted: false,
                    state,
                    exceeded,
                    denied_by: Some(dimension.strategy.clone()),
                    degraded: Self::any_degraded(&outcomes),
                    dimensions: outcomes,
                    refund_failures,
                });
            }
        }

        let state = tightest.ok_or_else(|| {
            InvalidConfigError::new("dimensions", "[]", "at least one dimension is required")
        })?;
        Ok(CompositeDecision {
            admitted: true,
            state,
            exceeded: None,
            denied_by: None,
            degraded: Self::any_degraded(&outcomes),
            dimensions: outcomes,
            refund_failures: Vec::new(),
        })
    }

    /// Revert every admitted outcome, newest first, against the state that
    /// served it.
    async fn compensate(&self, scope: &Scope, outcomes: &mut [DimensionOutcome], cost: u64) -> Vec<RefundFailure> {
        let mut failures = Vec::new();
        for (index, outcome) in outcomes.iter_mut().enumerate().rev() {
            if !outcome.decision.admitted {
                continue;
            }
            let limiter = &self.dimensions[index].limiter;
            match limiter.revert(scope, &outcome.key, cost, &outcome.decision).await {
                Ok(()) => outcome.refunded = true,
                Err(e) => {
                    warn!(
                        strategy = %outcome.strategy,
                        key = %outcome.key,
                        error = %e,
                        "Compensating refund failed"
                    );
                    failures.push(RefundFailure {
                        strategy: outcome.strategy.clone(),
                        key: outcome.key.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    /// Fewer units remaining wins; ties go to the earlier reset.
    fn tighter(a: &DecisionState, b: &DecisionState) -> bool {
        (a.remaining, a.reset_at) < (b.remaining, b.reset_at)
    }

    fn any_degraded(outcomes: &[DimensionOutcome]) -> bool {
        outcomes.iter().any(|o| o.decision.degraded)
    }

    /// Each dimension's current state for `ctx`, in evaluation order.
    pub async fn states(&self, scope: &Scope, ctx: &RequestContext) -> Result<Vec<(KeyStrategy, DecisionState)>> {
        let keys = self.keys(ctx)?;
        let mut states = Vec::with_capacity(keys.len());
        for (dimension, key) in self.dimensions.iter().zip(&keys) {
            states.push((dimension.strategy.clone(), dimension.limiter.state(scope, key).await?));
        }
        Ok(states)
    }

    /// Reset every dimension's key for `ctx`.
    pub async fn reset(&self, scope: &Scope, ctx: &RequestContext) -> Result<()> {
        let keys = self.keys(ctx)?;
        for (dimension, key) in self.dimensions.iter().zip(&keys) {
            dimension.limiter.reset(scope, key).await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        for dimension in &self.dimensions {
            dimension.limiter.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::error::StorageError;
    use crate::ratelimit::{
        AlgorithmConfig, AlgorithmKind, BreakerConfig, CircuitBreaker, CircuitState, Engine,
        FallbackController, FallbackStrategy, Route,
    };
    use crate::storage::testing::FlakyStorage;
    use crate::storage::{MemoryStorage, Storage};
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext::new()
            .with_ip("10.0.0.1")
            .with_user("42")
            .with_endpoint("/search")
            .with_custom("tenant", "acme")
    }

    fn strategy(index: usize) -> KeyStrategy {
        match index {
            0 => KeyStrategy::Ip,
            1 => KeyStrategy::User,
            2 => KeyStrategy::Endpoint,
            _ => KeyStrategy::Custom("tenant".to_string()),
        }
    }

    const KINDS: [AlgorithmKind; 4] = [
        AlgorithmKind::TokenBucket,
        AlgorithmKind::FixedWindow,
        AlgorithmKind::SlidingWindow,
        AlgorithmKind::LeakyBucket,
    ];

    fn engine(kind: AlgorithmKind, storage: &Arc<dyn Storage>, clock: &Arc<dyn Clock>) -> Engine {
        let config = AlgorithmConfig::new(kind, 5, Duration::from_secs(10)).with_capacity(5);
        Engine::new(config, storage.clone(), clock.clone()).unwrap()
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut all = Vec::new();
        for (i, &head) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                all.push(tail);
            }
        }
        all
    }

    fn setup(kinds: &[AlgorithmKind]) -> CompositeLimiter {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
        let dimensions = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| Dimension::new(strategy(i), engine(*kind, &storage, &clock)))
            .collect();
        CompositeLimiter::new(dimensions).unwrap()
    }

    async fn currents(limiter: &CompositeLimiter) -> Vec<u64> {
        limiter
            .states(&Scope::background(), &ctx())
            .await
            .unwrap()
            .into_iter()
            .map(|(_, s)| s.current)
            .collect()
    }

    #[tokio::test]
    async fn test_all_dimensions_admit() {
        let limiter = setup(&KINDS);
        let decision = limiter.allow(&Scope::background(), &ctx(), 2).await.unwrap();

        assert!(decision.admitted);
        assert_eq!(decision.dimensions.len(), 4);
        assert!(decision.dimensions.iter().all(|o| o.decision.admitted && !o.refunded));
        assert_eq!(currents(&limiter).await, vec![2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_aggregate_state_is_most_restrictive() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
        let wide = Engine::new(
            AlgorithmConfig::fixed_window(100, Duration::from_secs(60)),
            storage.clone(),
            clock.clone(),
        )
        .unwrap();
        let narrow = Engine::new(
            AlgorithmConfig::fixed_window(3, Duration::from_secs(1)),
            storage,
            clock,
        )
        .unwrap();
        let limiter = CompositeLimiter::new(vec![
            Dimension::new(KeyStrategy::Global, wide),
            Dimension::new(KeyStrategy::User, narrow),
        ])
        .unwrap();

        let decision = limiter.allow(&Scope::background(), &ctx(), 1).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.state.key, "user:42");
        assert_eq!(decision.state.remaining, 2);
    }

    #[tokio::test]
    async fn test_denial_compensates_in_every_order() {
        for n in 2..=4 {
            let indices: Vec<usize> = (0..n).collect();
            for order in permutations(&indices) {
                for exhausted in 0..n {
                    let kinds: Vec<AlgorithmKind> = order.iter().map(|&i| KINDS[i]).collect();
                    let limiter = setup(&kinds);
                    let scope = Scope::background();

                    // Use up some capacity everywhere, then exhaust one dimension.
                    limiter.allow(&scope, &ctx(), 1).await.unwrap();
                    let key = ctx().key(limiter.dimensions()[exhausted].strategy()).unwrap();
                    let target = limiter.dimensions()[exhausted].limiter().clone();
                    while target.allow(&scope, &key, 1).await.unwrap().admitted {}

                    let before = currents(&limiter).await;
                    let decision = limiter.allow(&scope, &ctx(), 2).await.unwrap();
                    let after = currents(&limiter).await;

                    assert!(!decision.admitted, "order {order:?} exhausted {exhausted}");
                    assert_eq!(decision.denied_by.as_ref(), Some(limiter.dimensions()[exhausted].strategy()));
                    assert_eq!(decision.dimensions.len(), exhausted + 1);
                    assert!(decision.refund_failures.is_empty());
                    assert!(decision.dimensions[..exhausted].iter().all(|o| o.refunded));
                    for (i, (b, a)) in before.iter().zip(&after).enumerate() {
                        assert!(a <= b, "order {order:?} dimension {i}: {b} -> {a}");
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_an_error() {
        let limiter = setup(&KINDS[..2]);
        let err = limiter
            .allow(&Scope::background(), &RequestContext::new().with_ip("1.1.1.1"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RateKeeperError::EmptyKey { ref strategy } if strategy == "user"));
        // Nothing was consumed on the dimension that did have a key.
        let state = limiter.dimensions()[0]
            .limiter()
            .state(&Scope::background(), "ip:1.1.1.1")
            .await
            .unwrap();
        assert_eq!(state.current, 0);
    }

    #[test]
    fn test_duplicate_strategies_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let err = CompositeLimiter::new(vec![
            Dimension::new(KeyStrategy::Ip, engine(AlgorithmKind::FixedWindow, &storage, &clock)),
            Dimension::new(KeyStrategy::Ip, engine(AlgorithmKind::TokenBucket, &storage, &clock)),
        ])
        .unwrap_err();
        assert_eq!(err.field, "dimensions");
        assert!(CompositeLimiter::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_storage_error_compensates_then_surfaces() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let healthy: Arc<dyn Storage> = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
        let flaky = Arc::new(FlakyStorage::new(Arc::new(MemoryStorage::with_config(
            Default::default(),
            clock.clone(),
        ))));
        flaky.set_failing(true);
        let flaky_storage: Arc<dyn Storage> = flaky.clone();

        let limiter = CompositeLimiter::new(vec![
            Dimension::new(KeyStrategy::Ip, engine(AlgorithmKind::FixedWindow, &healthy, &clock)),
            Dimension::new(KeyStrategy::User, engine(AlgorithmKind::FixedWindow, &flaky_storage, &clock)),
        ])
        .unwrap();

        let err = limiter.allow(&Scope::background(), &ctx(), 2).await.unwrap_err();
        assert!(err.is_storage());
        let state = limiter.dimensions()[0]
            .limiter()
            .state(&Scope::background(), "ip:10.0.0.1")
            .await
            .unwrap();
        assert_eq!(state.current, 0);
    }

    #[tokio::test]
    async fn test_cancellation_skips_compensation() {
        let limiter = setup(&KINDS[..2]);
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let scope = Scope::background().with_cancellation(token);

        let err = limiter.allow(&scope, &ctx(), 1).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(currents(&limiter).await, vec![0, 0]);
    }

    fn guarded(
        config: AlgorithmConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        strategy: FallbackStrategy,
        breaker: &CircuitBreaker,
    ) -> FallbackController {
        FallbackController::new(config, storage, clock, strategy, breaker.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_refund_is_reported_with_the_error() {
        let clock = Arc::new(MockClock::new());
        let healthy = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
        let flaky = Arc::new(FlakyStorage::new(Arc::new(MemoryStorage::with_config(
            Default::default(),
            clock.clone(),
        ))));
        let breaker = CircuitBreaker::new(BreakerConfig::new(1, Duration::from_secs(5)).unwrap(), clock.clone());
        let config = AlgorithmConfig::fixed_window(5, Duration::from_secs(60));
        let limiter = CompositeLimiter::new(vec![
            Dimension::new(
                KeyStrategy::Ip,
                guarded(config.clone(), healthy.clone(), clock.clone(), FallbackStrategy::DenyAll, &breaker),
            ),
            Dimension::new(
                KeyStrategy::User,
                guarded(config, flaky.clone(), clock.clone(), FallbackStrategy::DenyAll, &breaker),
            ),
        ])
        .unwrap();
        let scope = Scope::background();

        // The user dimension's failure opens the shared breaker, so the ip
        // admission cannot be credited back.
        flaky.set_failing(true);
        match limiter.allow(&scope, &ctx(), 1).await.unwrap_err() {
            RateKeeperError::CompensationFailed { source, refund_failures } => {
                assert!(matches!(*source, RateKeeperError::Unavailable { operation: "allow", .. }));
                assert_eq!(refund_failures.len(), 1);
                assert_eq!(refund_failures[0].strategy, KeyStrategy::Ip);
                assert_eq!(refund_failures[0].key, "ip:10.0.0.1");
            }
            other => panic!("expected a compensation failure, got {other:?}"),
        }
        assert_eq!(healthy.get("ip:10.0.0.1").await.unwrap().unwrap().count, 1);

        // Once storage recovers the caller can retry the refund.
        flaky.set_failing(false);
        clock.advance(Duration::from_secs(5));
        limiter.dimensions()[0]
            .limiter()
            .refund(&scope, "ip:10.0.0.1", 1)
            .await
            .unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(healthy.get("ip:10.0.0.1").await.unwrap().unwrap().count, 0);
    }

    /// Lets the breaker cool down and close through a successful probe,
    /// then denies.
    struct RecoveringDenier {
        breaker: CircuitBreaker,
        clock: Arc<MockClock>,
        inner: Engine,
    }

    #[async_trait::async_trait]
    impl Algorithm for RecoveringDenier {
        fn kind(&self) -> AlgorithmKind {
            self.inner.kind()
        }

        fn limit(&self) -> u64 {
            self.inner.limit()
        }

        fn window(&self) -> Duration {
            self.inner.window()
        }

        async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
            self.clock.advance(self.breaker.config().cooldown());
            if let Route::Primary { probe } = self.breaker.route() {
                self.breaker.record_success(probe);
            }
            self.inner.allow(scope, key, cost).await
        }

        async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()> {
            self.inner.refund(scope, key, cost).await
        }

        async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState> {
            self.inner.state(scope, key).await
        }

        async fn reset(&self, scope: &Scope, key: &str) -> Result<()> {
            self.inner.reset(scope, key).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_shadow_admission_is_refunded_to_shadow_after_recovery() {
        let clock = Arc::new(MockClock::new());
        let primary = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
        let breaker = CircuitBreaker::new(BreakerConfig::new(1, Duration::from_secs(5)).unwrap(), clock.clone());
        let outage = StorageError::new("memory", "get", "connection refused");
        let scope = Scope::background();

        let ip = guarded(
            AlgorithmConfig::fixed_window(5, Duration::from_secs(60)),
            primary.clone(),
            clock.clone(),
            FallbackStrategy::LocalMemory,
            &breaker,
        );
        let exhausted = Engine::new(
            AlgorithmConfig::fixed_window(1, Duration::from_secs(60)),
            Arc::new(MemoryStorage::with_config(Default::default(), clock.clone())),
            clock.clone(),
        )
        .unwrap();
        assert!(exhausted.allow(&scope, "user:42", 1).await.unwrap().admitted);
        let limiter = CompositeLimiter::new(vec![
            Dimension::new(KeyStrategy::Ip, ip),
            Dimension::new(
                KeyStrategy::User,
                RecoveringDenier {
                    breaker: breaker.clone(),
                    clock: clock.clone(),
                    inner: exhausted,
                },
            ),
        ])
        .unwrap();

        breaker.trip(&outage);
        let decision = limiter.allow(&scope, &ctx(), 1).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.denied_by, Some(KeyStrategy::User));
        assert!(decision.dimensions[0].decision.degraded);
        assert!(decision.dimensions[0].refunded);
        assert!(decision.refund_failures.is_empty());
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Primary was never charged, so it was not credited either.
        assert!(!primary.exists("ip:10.0.0.1").await.unwrap());

        // The shadow got its capacity back.
        breaker.trip(&outage);
        let shadow = limiter.dimensions()[0].limiter().state(&scope, "ip:10.0.0.1").await.unwrap();
        assert_eq!(shadow.current, 0);
    }
}
