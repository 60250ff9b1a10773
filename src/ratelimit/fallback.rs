//! Fallback controller: an engine wrapped in a circuit breaker.
//!
//! Calls go to the primary engine while the breaker is closed. When primary
//! storage fails often enough to open the breaker, calls are answered by the
//! configured [`FallbackStrategy`] until a probe finds storage healthy again.
//! Shadow state kept during an outage is never reconciled with primary state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::algorithm::{Algorithm, AlgorithmConfig, AlgorithmKind, Decision, DecisionState};
use super::breaker::{CircuitBreaker, CircuitState, ProbeGuard, Route};
use super::Engine;
use crate::clock::Clock;
use crate::error::{InvalidConfigError, RateKeeperError, Result};
use crate::scope::Scope;
use crate::storage::{MemoryStorage, Storage};

/// Behaviour while primary storage is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Fail open: admit everything.
    #[default]
    AllowAll,
    /// Fail closed: refuse with [`RateKeeperError::Unavailable`].
    DenyAll,
    /// Enforce limits against process-local state.
    LocalMemory,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::AllowAll => "allow_all",
            FallbackStrategy::DenyAll => "deny_all",
            FallbackStrategy::LocalMemory => "local_memory",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackStrategy {
    type Err = InvalidConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "allow_all" => Ok(FallbackStrategy::AllowAll),
            "deny_all" => Ok(FallbackStrategy::DenyAll),
            "local_memory" => Ok(FallbackStrategy::LocalMemory),
            other => Err(InvalidConfigError::new(
                "fallback_strategy",
                other,
                "must be one of: allow_all, deny_all, local_memory",
            )),
        }
    }
}

struct Shadow {
    engine: Engine,
    storage: Arc<MemoryStorage>,
}

/// An [`Engine`] guarded by a [`CircuitBreaker`] and a fallback policy.
pub struct FallbackController {
    primary: Engine,
    storage: Arc<dyn Storage>,
    shadow: Option<Shadow>,
    strategy: FallbackStrategy,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackController")
            .field("primary", &self.primary)
            .field("strategy", &self.strategy)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl FallbackController {
    /// Build the primary engine over `storage` and, for
    /// [`FallbackStrategy::LocalMemory`], a shadow engine over a private
    /// in-memory store. The breaker may be shared with other controllers
    /// using the same storage.
    pub fn new(
        config: AlgorithmConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        strategy: FallbackStrategy,
        breaker: CircuitBreaker,
    ) -> std::result::Result<Self, InvalidConfigError> {
        let primary = Engine::new(config, storage.clone(), clock.clone())?;
        let shadow = match strategy {
            FallbackStrategy::LocalMemory => {
                let shadow_storage = Arc::new(MemoryStorage::with_config(Default::default(), clock.clone()));
                let engine = primary.with_storage(shadow_storage.clone(), clock.clone())?;
                Some(Shadow {
                    engine,
                    storage: shadow_storage,
                })
            }
            _ => None,
        };

        Ok(Self {
            primary,
            storage,
            shadow,
            strategy,
            breaker,
            clock,
        })
    }

    pub fn strategy(&self) -> FallbackStrategy {
        self.strategy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn config(&self) -> &AlgorithmConfig {
        self.primary.config()
    }

    /// Primary storage, for liveness probing.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Ping primary storage through the breaker.
    pub async fn check_liveness(&self, scope: &Scope) -> Result<CircuitState> {
        self.breaker.check_liveness(scope, self.storage.as_ref()).await
    }

    /// Feed a primary call's outcome to the breaker. `None` means the call
    /// should be answered by the fallback policy instead.
    fn settle<T>(&self, key: &str, result: Result<T>, probe: Option<ProbeGuard>) -> Option<Result<T>> {
        match result {
            Ok(value) => {
                self.breaker.record_success(probe);
                Some(Ok(value))
            }
            Err(RateKeeperError::Storage(err)) => match self.breaker.record_failure(&err, probe) {
                CircuitState::Closed => Some(Err(err.into())),
                state => {
                    warn!(
                        key,
                        error = %err,
                        breaker = %state,
                        strategy = %self.strategy,
                        "Primary storage unavailable, using fallback"
                    );
                    None
                }
            },
            // Storage answered; it just kept losing races.
            Err(err @ RateKeeperError::Contention { .. }) => {
                self.breaker.record_success(probe);
                Some(Err(err))
            }
            Err(err) => Some(Err(err)),
        }
    }

    fn unavailable(key: &str, operation: &'static str) -> RateKeeperError {
        RateKeeperError::Unavailable {
            key: key.to_string(),
            operation,
        }
    }

    /// State reported by [`FallbackStrategy::AllowAll`]: a full, untouched limit.
    fn open_state(&self, key: &str) -> DecisionState {
        DecisionState {
            key: key.to_string(),
            limit: self.primary.limit(),
            remaining: self.primary.limit(),
            current: 0,
            reset_at: self.clock.now(),
            retry_after: Duration::ZERO,
            algorithm: self.primary.kind(),
        }
    }

    async fn fallback_allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
        scope.check()?;
        debug!(key, cost, strategy = %self.strategy, "Serving decision from fallback");
        match (&self.shadow, self.strategy) {
            (Some(shadow), _) => Ok(shadow.engine.allow(scope, key, cost).await?.into_degraded()),
            (None, FallbackStrategy::DenyAll) => Err(Self::unavailable(key, "allow")),
            (None, _) => Ok(Decision::admit(self.open_state(key)).into_degraded()),
        }
    }
}

#[async_trait]
impl Algorithm for FallbackController {
    fn kind(&self) -> AlgorithmKind {
        self.primary.kind()
    }

    fn limit(&self) -> u64 {
        self.primary.limit()
    }

    fn window(&self) -> Duration {
        self.primary.window()
    }

    async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
        if let Route::Primary { probe } = self.breaker.route() {
            let result = self.primary.allow(scope, key, cost).await;
            if let Some(result) = self.settle(key, result, probe) {
                return result;
            }
        }
        self.fallback_allow(scope, key, cost).await
    }

    async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()> {
        if let Route::Primary { probe } = self.breaker.route() {
            let result = self.primary.refund(scope, key, cost).await;
            if let Some(result) = self.settle(key, result, probe) {
                return result;
            }
        }
        scope.check()?;
        match &self.shadow {
            Some(shadow) => shadow.engine.refund(scope, key, cost).await,
            None => Err(Self::unavailable(key, "refund")),
        }
    }

    async fn revert(&self, scope: &Scope, key: &str, cost: u64, admission: &Decision) -> Result<()> {
        if admission.degraded {
            scope.check()?;
            return match &self.shadow {
                Some(shadow) => shadow.engine.refund(scope, key, cost).await,
                // Admitted without consuming anything.
                None => Ok(()),
            };
        }
        if let Route::Primary { probe } = self.breaker.route() {
            let result = self.primary.refund(scope, key, cost).await;
            if let Some(result) = self.settle(key, result, probe) {
                return result;
            }
        }
        // The capacity was taken from primary storage, which cannot be reached.
        Err(Self::unavailable(key, "refund"))
    }

    async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState> {
        if let Route::Primary { probe } = self.breaker.route() {
            let result = self.primary.state(scope, key).await;
            if let Some(result) = self.settle(key, result, probe) {
                return result;
            }
        }
        scope.check()?;
        match (&self.shadow, self.strategy) {
            (Some(shadow), _) => shadow.engine.state(scope, key).await,
            (None, FallbackStrategy::DenyAll) => Err(Self::unavailable(key, "state")),
            (None, _) => Ok(self.open_state(key)),
        }
    }

    async fn reset(&self, scope: &Scope, key: &str) -> Result<()> {
        if let Route::Primary { probe } = self.breaker.route() {
            let result = self.primary.reset(scope, key).await;
            if let Some(result) = self.settle(key, result, probe) {
                return result;
            }
        }
        scope.check()?;
        if let Some(shadow) = &self.shadow {
            shadow.engine.reset(scope, key).await?;
        }
        // The primary key could not be cleared.
        Err(Self::unavailable(key, "reset"))
    }

    async fn close(&self) -> Result<()> {
        if let Some(shadow) = &self.shadow {
            shadow.storage.close().await?;
        }
        self.primary.close().await
    }
}
