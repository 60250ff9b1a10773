//! Single-dimension rate limiter with decision hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use super::algorithm::{Algorithm, AlgorithmConfig, AlgorithmKind, Decision, DecisionState};
use super::breaker::{BreakerConfig, CircuitBreaker, CircuitState, OpenHook};
use super::context::{KeyStrategy, RequestContext};
use super::fallback::{FallbackController, FallbackStrategy};
use crate::clock::{self, Clock, SystemClock};
use crate::error::{InvalidConfigError, RateKeeperError, Result};
use crate::scope::Scope;
use crate::storage::{MemoryStorage, Storage};

/// Context handed to `on_allow` / `on_limit` hooks for each decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitInfo {
    pub key: String,
    pub allowed: bool,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub reset_in: Duration,
    pub cost: u64,
    pub algorithm: AlgorithmKind,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub type LimitHook = Arc<dyn Fn(&LimitInfo) + Send + Sync>;

/// The main entry point: one algorithm, guarded by a circuit breaker, with
/// optional hooks fired on every decision.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    controller: FallbackController,
    clock: Arc<dyn Clock>,
    on_allow: Option<LimitHook>,
    on_limit: Option<LimitHook>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("controller", &self.controller)
            .field("on_allow", &self.on_allow.is_some())
            .field("on_limit", &self.on_limit.is_some())
            .finish()
    }
}

impl RateLimiter {
    pub fn builder(config: AlgorithmConfig) -> RateLimiterBuilder {
        RateLimiterBuilder::new(config)
    }

    pub fn controller(&self) -> &FallbackController {
        &self.controller
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.controller.breaker()
    }

    pub fn kind(&self) -> AlgorithmKind {
        self.controller.kind()
    }

    /// Decide on `cost` units for `key`.
    pub async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
        self.decide(scope, key, cost, &HashMap::new()).await
    }

    /// Decide on `cost` units for the key `strategy` derives from `ctx`.
    /// The context's metadata is passed through to the hooks.
    pub async fn allow_request(
        &self,
        scope: &Scope,
        ctx: &RequestContext,
        strategy: &KeyStrategy,
        cost: u64,
    ) -> Result<Decision> {
        let key = ctx.key(strategy).ok_or_else(|| RateKeeperError::EmptyKey {
            strategy: strategy.to_string(),
        })?;
        self.decide(scope, &key, cost, &ctx.metadata).await
    }

    async fn decide(
        &self,
        scope: &Scope,
        key: &str,
        cost: u64,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<Decision> {
        trace!(key, cost, "Checking rate limit");

        let decision = self.controller.allow(scope, key, cost).await?;

        let hook = if decision.admitted {
            &self.on_allow
        } else {
            debug!(key, remaining = decision.state.remaining, "Rate limit exceeded");
            &self.on_limit
        };
        if let Some(hook) = hook {
            hook(&self.limit_info(&decision, cost, metadata));
        }

        Ok(decision)
    }

    fn limit_info(
        &self,
        decision: &Decision,
        cost: u64,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> LimitInfo {
        let state = &decision.state;
        LimitInfo {
            key: state.key.clone(),
            allowed: decision.admitted,
            limit: state.limit,
            used: state.current,
            remaining: state.remaining,
            reset_at: state.reset_at,
            reset_in: clock::elapsed(state.reset_at, self.clock.now()),
            cost,
            algorithm: state.algorithm,
            metadata: metadata.clone(),
        }
    }

    /// Credit back capacity from an earlier admission.
    pub async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()> {
        self.controller.refund(scope, key, cost).await
    }

    /// Undo `admission`, crediting the state that served it: primary storage,
    /// or the local shadow for a degraded decision.
    pub async fn revert(&self, scope: &Scope, key: &str, cost: u64, admission: &Decision) -> Result<()> {
        self.controller.revert(scope, key, cost, admission).await
    }

    pub async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState> {
        self.controller.state(scope, key).await
    }

    pub async fn reset(&self, scope: &Scope, key: &str) -> Result<()> {
        self.controller.reset(scope, key).await
    }

    pub async fn check_liveness(&self, scope: &Scope) -> Result<CircuitState> {
        self.controller.check_liveness(scope).await
    }

    pub async fn close(&self) -> Result<()> {
        self.controller.close().await
    }
}

/// Builder for [`RateLimiter`]. Everything but the algorithm has a default:
/// a fresh [`MemoryStorage`], the system clock, [`FallbackStrategy::AllowAll`]
/// and a default [`BreakerConfig`].
pub struct RateLimiterBuilder {
    config: AlgorithmConfig,
    storage: Option<Arc<dyn Storage>>,
    clock: Arc<dyn Clock>,
    strategy: FallbackStrategy,
    breaker_config: BreakerConfig,
    breaker: Option<CircuitBreaker>,
    on_allow: Option<LimitHook>,
    on_limit: Option<LimitHook>,
    on_fallback: Option<OpenHook>,
}

impl RateLimiterBuilder {
    pub fn new(config: AlgorithmConfig) -> Self {
        Self {
            config,
            storage: None,
            clock: Arc::new(SystemClock),
            strategy: FallbackStrategy::default(),
            breaker_config: BreakerConfig::default(),
            breaker: None,
            on_allow: None,
            on_limit: None,
            on_fallback: None,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn fallback(mut self, strategy: FallbackStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Share an existing breaker instead of creating one. Overrides
    /// [`breaker_config`](Self::breaker_config) and `on_fallback`.
    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn on_allow(mut self, hook: impl Fn(&LimitInfo) + Send + Sync + 'static) -> Self {
        self.on_allow = Some(Arc::new(hook));
        self
    }

    pub fn on_limit(mut self, hook: impl Fn(&LimitInfo) + Send + Sync + 'static) -> Self {
        self.on_limit = Some(Arc::new(hook));
        self
    }

    /// Called once each time primary storage is declared unavailable.
    pub fn on_fallback(mut self, hook: impl Fn(&crate::error::StorageError) + Send + Sync + 'static) -> Self {
        self.on_fallback = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> std::result::Result<RateLimiter, InvalidConfigError> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::with_config(Default::default(), self.clock.clone())),
        };
        let breaker = match (self.breaker, self.on_fallback) {
            (Some(breaker), _) => breaker,
            (None, Some(hook)) => CircuitBreaker::with_open_hook(self.breaker_config, self.clock.clone(), hook),
            (None, None) => CircuitBreaker::new(self.breaker_config, self.clock.clone()),
        };
        let controller = FallbackController::new(
            self.config,
            storage,
            self.clock.clone(),
            self.strategy,
            breaker,
        )?;

        Ok(RateLimiter {
            controller,
            clock: self.clock,
            on_allow: self.on_allow,
            on_limit: self.on_limit,
        })
    }
}
