//! Sliding window log engine.
//!
//! Keeps a log of admitted request weights and admits a request when the
//! weight logged within the trailing window, plus the request's cost, fits in
//! `rate`. The log is bounded by `max_timestamps`: past that, the two oldest
//! entries are merged into the later one. Merging moves weight forward in
//! time, so it can only over-count and never admits more than `rate`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::algorithm::{
    Algorithm, AlgorithmConfig, AlgorithmKind, Decision, DecisionState, EngineCore, Step,
};
use crate::clock::{self, Clock};
use crate::error::{InvalidConfigError, Result};
use crate::scope::Scope;
use crate::storage::{PersistedState, Storage, WindowEntry};

/// Metadata key counting how many entries were merged away on a key.
pub const COARSENED_METADATA_KEY: &str = "coarsened";

/// Sliding window log limiter.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    core: EngineCore,
}

impl SlidingWindow {
    pub fn new(
        config: AlgorithmConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, InvalidConfigError> {
        let core = EngineCore::new(AlgorithmKind::SlidingWindow, config, storage, clock)?;
        Ok(Self { core })
    }

    pub fn config(&self) -> &AlgorithmConfig {
        &self.core.config
    }

    /// Drop entries that have left the window. Returns whether any were removed.
    fn prune(&self, state: &mut PersistedState, now: DateTime<Utc>) -> bool {
        let window = self.core.config.window;
        let before = state.timestamps.len();
        state.timestamps.retain(|e| now < clock::add(e.at, window));
        state.timestamps.len() != before
    }

    fn total(state: &PersistedState) -> u64 {
        state.timestamps.iter().fold(0u64, |sum, e| sum.saturating_add(e.weight))
    }

    /// Log `weight` at `at`, keeping entries ordered by time.
    fn record(&self, state: &mut PersistedState, at: DateTime<Utc>, weight: u64) {
        let idx = state.timestamps.partition_point(|e| e.at <= at);
        if idx > 0 && state.timestamps[idx - 1].at == at {
            let entry = &mut state.timestamps[idx - 1];
            entry.weight = entry.weight.saturating_add(weight);
        } else {
            state.timestamps.insert(idx, WindowEntry { at, weight });
        }
        self.coarsen(state);
    }

    fn coarsen(&self, state: &mut PersistedState) {
        let max = self.core.config.max_timestamps;
        let mut merged = 0u64;
        while state.timestamps.len() > max {
            let oldest = state.timestamps.remove(0);
            state.timestamps[0].weight = state.timestamps[0].weight.saturating_add(oldest.weight);
            merged += 1;
        }
        if merged > 0 {
            let total = state
                .metadata
                .get(COARSENED_METADATA_KEY)
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                + merged;
            state
                .metadata
                .insert(COARSENED_METADATA_KEY.to_string(), total.into());
            warn!(
                entries = state.timestamps.len(),
                merged = total,
                "Sliding window log at capacity, coarsening oldest entries"
            );
        }
    }

    /// Time until enough of the oldest weight leaves the window to fit `cost`.
    fn retry_after(&self, state: &PersistedState, cost: u64, now: DateTime<Utc>) -> Duration {
        let used = Self::total(state);
        let need = cost.saturating_sub(self.core.config.rate.saturating_sub(used));
        let mut freed: u64 = 0;
        for entry in &state.timestamps {
            freed = freed.saturating_add(entry.weight);
            if freed >= need {
                return clock::elapsed(clock::add(entry.at, self.core.config.window), now);
            }
        }
        Duration::ZERO
    }

    fn snapshot(&self, key: &str, state: &PersistedState, now: DateTime<Utc>, retry_after: Duration) -> DecisionState {
        let limit = self.core.config.rate;
        let used = Self::total(state);
        let reset_at = state
            .timestamps
            .last()
            .map_or(now, |newest| clock::add(newest.at, self.core.config.window));
        DecisionState {
            key: key.to_string(),
            limit,
            remaining: limit.saturating_sub(used),
            current: used,
            reset_at,
            retry_after,
            algorithm: AlgorithmKind::SlidingWindow,
        }
    }
}

#[async_trait]
impl Algorithm for SlidingWindow {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::SlidingWindow
    }

    fn limit(&self) -> u64 {
        self.core.config.rate
    }

    fn window(&self) -> Duration {
        self.core.config.window
    }

    async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
        self.core.check_cost(key, cost, self.limit())?;

        trace!(key, cost, "Checking sliding window");

        let decision = self
            .core
            .update(scope, key, self.core.config.window, |current, now| {
                let mut next = current.cloned().unwrap_or_else(|| PersistedState::new(now));
                let pruned = self.prune(&mut next, now);

                if Self::total(&next).checked_add(cost).is_some_and(|t| t <= self.core.config.rate) {
                    self.record(&mut next, now, cost);
                    let state = self.snapshot(key, &next, now, Duration::ZERO);
                    return Step::Commit(next, Decision::admit(state));
                }

                let retry_after = self.retry_after(&next, cost, now);
                let state = self.snapshot(key, &next, now, retry_after);
                let decision = Decision::reject(state, self.core.config.window);
                // Only expired entries are dropped; the live weight is untouched.
                if pruned {
                    Step::Commit(next, decision)
                } else {
                    Step::Skip(decision)
                }
            })
            .await?;

        if !decision.admitted {
            debug!(
                key,
                current = decision.state.current,
                limit = decision.state.limit,
                "Sliding window limit exceeded"
            );
        }
        Ok(decision)
    }

    async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()> {
        self.core
            .update(scope, key, self.core.config.window, |current, now| {
                let Some(state) = current else {
                    return Step::Skip(());
                };
                let mut next = state.clone();
                self.prune(&mut next, now);
                // Give back the most recent weight first.
                let mut owed = cost;
                while owed > 0 {
                    let Some(newest) = next.timestamps.last_mut() else {
                        break;
                    };
                    let take = owed.min(newest.weight);
                    newest.weight -= take;
                    owed -= take;
                    if newest.weight == 0 {
                        next.timestamps.pop();
                    }
                }
                Step::Commit(next, ())
            })
            .await
    }

    async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState> {
        let current = self.core.load(scope, key).await?;
        let now = self.core.clock.now();
        let mut view = current.unwrap_or_else(|| PersistedState::new(now));
        self.prune(&mut view, now);
        let retry_after = if Self::total(&view) < self.core.config.rate {
            Duration::ZERO
        } else {
            self.retry_after(&view, 1, now)
        };
        Ok(self.snapshot(key, &view, now, retry_after))
    }

    async fn reset(&self, scope: &Scope, key: &str) -> Result<()> {
        self.core.reset(scope, key).await
    }

    async fn close(&self) -> Result<()> {
        self.core.close().await
    }
}
