//! Fixed window engine.
//!
//! Counts admitted cost per window and resets the count when the window
//! elapses. Windows start at the first request after a reset unless
//! `align_windows` pins them to epoch multiples of the window length.
//!
//! Up to twice the rate can pass around a window boundary (the end of one
//! window plus the start of the next). That is the trade-off this algorithm
//! makes for constant memory, and it is kept as is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::algorithm::{
    Algorithm, AlgorithmConfig, AlgorithmKind, Decision, DecisionState, EngineCore, Step,
};
use crate::clock::{self, Clock};
use crate::error::{InvalidConfigError, Result};
use crate::scope::Scope;
use crate::storage::{PersistedState, Storage};

/// Fixed window counter.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    core: EngineCore,
}

impl FixedWindow {
    pub fn new(
        config: AlgorithmConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, InvalidConfigError> {
        let core = EngineCore::new(AlgorithmKind::FixedWindow, config, storage, clock)?;
        Ok(Self { core })
    }

    pub fn config(&self) -> &AlgorithmConfig {
        &self.core.config
    }

    /// Start of a window opened at `now`.
    fn window_start_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if !self.core.config.align_windows {
            return now;
        }
        let window_ms = (self.core.config.window.as_millis() as i64).max(1);
        let now_ms = now.timestamp_millis();
        DateTime::from_timestamp_millis(now_ms - now_ms.rem_euclid(window_ms)).unwrap_or(now)
    }

    fn window_end(&self, state: &PersistedState) -> DateTime<Utc> {
        clock::add(state.window_start, self.core.config.window)
    }

    /// The state of the window containing `now`, opening a new one if needed.
    fn current_window(&self, current: Option<&PersistedState>, now: DateTime<Utc>) -> PersistedState {
        match current {
            Some(state) if now < self.window_end(state) => state.clone(),
            Some(state) => PersistedState {
                count: 0,
                window_start: self.window_start_for(now),
                created_at: state.created_at,
                ..PersistedState::new(now)
            },
            None => PersistedState {
                window_start: self.window_start_for(now),
                ..PersistedState::new(now)
            },
        }
    }

    fn snapshot(&self, key: &str, state: &PersistedState, now: DateTime<Utc>, retry_after: Duration) -> DecisionState {
        let limit = self.core.config.rate;
        let used = state.count.max(0) as u64;
        let reset_at = self.window_end(state);
        DecisionState {
            key: key.to_string(),
            limit,
            remaining: limit.saturating_sub(used),
            current: used,
            reset_at,
            retry_after: if retry_after.is_zero() {
                retry_after
            } else {
                clock::elapsed(reset_at, now)
            },
            algorithm: AlgorithmKind::FixedWindow,
        }
    }
}

#[async_trait]
impl Algorithm for FixedWindow {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::FixedWindow
    }

    fn limit(&self) -> u64 {
        self.core.config.rate
    }

    fn window(&self) -> Duration {
        self.core.config.window
    }

    async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
        self.core.check_cost(key, cost, self.limit())?;

        trace!(key, cost, "Checking fixed window");

        let decision = self
            .core
            .update(scope, key, self.core.config.window, |current, now| {
                let mut next = self.current_window(current, now);
                let used = next.count.max(0) as u64;
                if used.checked_add(cost).is_some_and(|t| t <= self.core.config.rate) {
                    next.count = next.count.saturating_add(i64::try_from(cost).unwrap_or(i64::MAX));
                    let state = self.snapshot(key, &next, now, Duration::ZERO);
                    Step::Commit(next, Decision::admit(state))
                } else {
                    let state = self.snapshot(key, &next, now, Duration::MAX);
                    Step::Skip(Decision::reject(state, self.core.config.window))
                }
            })
            .await?;

        if !decision.admitted {
            debug!(
                key,
                count = decision.state.current,
                limit = decision.state.limit,
                "Fixed window limit exceeded"
            );
        }
        Ok(decision)
    }

    async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()> {
        self.core
            .update(scope, key, self.core.config.window, |current, now| match current {
                // Only the window that took the cost can give it back.
                Some(state) if now < self.window_end(state) => {
                    let mut next = state.clone();
                    next.count = next.count.saturating_sub(i64::try_from(cost).unwrap_or(i64::MAX)).max(0);
                    Step::Commit(next, ())
                }
                _ => Step::Skip(()),
            })
            .await
    }

    async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState> {
        let current = self.core.load(scope, key).await?;
        let now = self.core.clock.now();
        let window = self.current_window(current.as_ref(), now);
        let retry_after = if (window.count.max(0) as u64) < self.core.config.rate {
            Duration::ZERO
        } else {
            Duration::MAX
        };
        Ok(self.snapshot(key, &window, now, retry_after))
    }

    async fn reset(&self, scope: &Scope, key: &str) -> Result<()> {
        self.core.reset(scope, key).await
    }

    async fn close(&self) -> Result<()> {
        self.core.close().await
    }
}
