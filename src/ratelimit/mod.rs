//! Rate limiting engines, coordination and fallback.

mod algorithm;
mod breaker;
mod composite;
mod context;
mod engine;
mod fallback;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod sliding_window;
mod token_bucket;

pub use algorithm::{
    Algorithm, AlgorithmConfig, AlgorithmKind, Decision, DecisionState, DEFAULT_MAX_TIMESTAMPS,
    MAX_UPDATE_ATTEMPTS,
};
pub use breaker::{
    BreakerConfig, CircuitBreaker, CircuitState, OpenHook, ProbeGuard, Route, DEFAULT_COOLDOWN,
    DEFAULT_FAILURE_THRESHOLD,
};
pub use composite::{CompositeDecision, CompositeLimiter, Dimension, DimensionOutcome, RefundFailure};
pub use context::{KeyStrategy, RequestContext};
pub use engine::Engine;
pub use fallback::{FallbackController, FallbackStrategy};
pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use limiter::{LimitHook, LimitInfo, RateLimiter, RateLimiterBuilder};
pub use sliding_window::{SlidingWindow, COARSENED_METADATA_KEY};
pub use token_bucket::TokenBucket;
