//! Ratekeeper - Rate Limiting Decision Engine
//!
//! This crate decides whether a request identified by a key may proceed,
//! using one of four algorithms (token bucket, fixed window, sliding window,
//! leaky bucket) over a pluggable state store. Several limits can be
//! combined into one composite gate, and a circuit breaker switches to a
//! configured fallback policy while the store is failing.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod scope;
pub mod storage;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::RateKeeperConfig;
pub use error::{InvalidConfigError, LimitExceededError, RateKeeperError, Result, StorageError};
pub use ratelimit::{
    Algorithm, AlgorithmConfig, AlgorithmKind, CompositeDecision, CompositeLimiter, Decision,
    DecisionState, FallbackStrategy, KeyStrategy, RateLimiter, RequestContext,
};
pub use scope::Scope;
pub use storage::{MemoryStorage, MemoryStorageConfig, PersistedState, Storage};
