//! Closed set of engines behind one type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::algorithm::{Algorithm, AlgorithmConfig, AlgorithmKind, Decision, DecisionState};
use super::{FixedWindow, LeakyBucket, SlidingWindow, TokenBucket};
use crate::clock::Clock;
use crate::error::{InvalidConfigError, Result};
use crate::scope::Scope;
use crate::storage::Storage;

/// Any of the built-in engines, chosen by [`AlgorithmConfig::kind`].
#[derive(Debug, Clone)]
pub enum Engine {
    TokenBucket(TokenBucket),
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindow),
    LeakyBucket(LeakyBucket),
}

macro_rules! dispatch {
    ($self:expr, $engine:ident => $body:expr) => {
        match $self {
            Engine::TokenBucket($engine) => $body,
            Engine::FixedWindow($engine) => $body,
            Engine::SlidingWindow($engine) => $body,
            Engine::LeakyBucket($engine) => $body,
        }
    };
}

impl Engine {
    pub fn new(
        config: AlgorithmConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, InvalidConfigError> {
        Ok(match config.kind {
            AlgorithmKind::TokenBucket => Engine::TokenBucket(TokenBucket::new(config, storage, clock)?),
            AlgorithmKind::FixedWindow => Engine::FixedWindow(FixedWindow::new(config, storage, clock)?),
            AlgorithmKind::SlidingWindow => {
                Engine::SlidingWindow(SlidingWindow::new(config, storage, clock)?)
            }
            AlgorithmKind::LeakyBucket => Engine::LeakyBucket(LeakyBucket::new(config, storage, clock)?),
        })
    }

    pub fn config(&self) -> &AlgorithmConfig {
        dispatch!(self, e => e.config())
    }

    /// The same engine configuration over a different store and clock.
    pub fn with_storage(
        &self,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, InvalidConfigError> {
        Self::new(self.config().clone(), storage, clock)
    }
}

#[async_trait]
impl Algorithm for Engine {
    fn kind(&self) -> AlgorithmKind {
        dispatch!(self, e => e.kind())
    }

    fn limit(&self) -> u64 {
        dispatch!(self, e => e.limit())
    }

    fn window(&self) -> Duration {
        dispatch!(self, e => e.window())
    }

    async fn allow(&self, scope: &Scope, key: &str, cost: u64) -> Result<Decision> {
        dispatch!(self, e => e.allow(scope, key, cost).await)
    }

    async fn refund(&self, scope: &Scope, key: &str, cost: u64) -> Result<()> {
        dispatch!(self, e => e.refund(scope, key, cost).await)
    }

    async fn state(&self, scope: &Scope, key: &str) -> Result<DecisionState> {
        dispatch!(self, e => e.state(scope, key).await)
    }

    async fn reset(&self, scope: &Scope, key: &str) -> Result<()> {
        dispatch!(self, e => e.reset(scope, key).await)
    }

    async fn close(&self) -> Result<()> {
        dispatch!(self, e => e.close().await)
    }
}
