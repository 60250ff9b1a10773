//! Error types for Ratekeeper.
//!
//! A rejected request is not an error: it is reported through
//! [`Decision`](crate::ratelimit::Decision) with `admitted == false`, and the
//! [`LimitExceededError`] record rides along with it. Everything in
//! [`RateKeeperError`] is a genuine failure of the call itself.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ratelimit::RefundFailure;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RateKeeperError {
    /// Configuration errors. Raised at construction, never per request.
    #[error(transparent)]
    InvalidConfig(#[from] InvalidConfigError),

    /// Configuration could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),

    /// Storage backend failures, wrapped with backend/operation/key context.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A cost of zero was requested.
    #[error("invalid cost {cost} for key {key:?}: cost must be at least 1")]
    InvalidCost { key: String, cost: u64 },

    /// The cost can never be admitted because it exceeds the engine's capacity.
    #[error("cost {cost} for key {key:?} exceeds capacity {capacity}; it can never be admitted")]
    CostExceedsCapacity { key: String, cost: u64, capacity: u64 },

    /// A composite dimension derived no key from the request context.
    #[error("strategy {strategy:?} derived no rate key from the request context")]
    EmptyKey { strategy: String },

    /// Optimistic updates kept racing with concurrent writers.
    #[error("gave up on key {key:?} after {attempts} conflicting concurrent updates")]
    Contention { key: String, attempts: usize },

    /// Primary storage is unavailable and the active policy refuses the call.
    #[error("primary storage unavailable: {operation} for key {key:?} refused while degraded")]
    Unavailable { key: String, operation: &'static str },

    /// A composite dimension failed, and undoing the admissions before it
    /// failed too. `source` is the dimension's error.
    #[error("{source} ({} compensating refunds failed)", .refund_failures.len())]
    CompensationFailed {
        source: Box<RateKeeperError>,
        refund_failures: Vec<RefundFailure>,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline elapsed before the operation completed.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateKeeperError {
    /// Whether this error came from the storage backend.
    pub fn is_storage(&self) -> bool {
        match self {
            RateKeeperError::Storage(_) => true,
            RateKeeperError::CompensationFailed { source, .. } => source.is_storage(),
            _ => false,
        }
    }

    /// Whether this error was caused by caller cancellation or deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            RateKeeperError::Cancelled | RateKeeperError::DeadlineExceeded
        )
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateKeeperError>;

/// An invalid configuration field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration: {field} = {value} ({reason})")]
pub struct InvalidConfigError {
    /// Name of the offending field.
    pub field: String,
    /// The rejected value, rendered for display.
    pub value: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl InvalidConfigError {
    pub fn new(field: impl Into<String>, value: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// A failed storage call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "storage error [{backend}/{operation}]{}: {cause}",
    .key.as_ref().map(|k| format!(" for key {k:?}")).unwrap_or_default()
)]
pub struct StorageError {
    /// Backend that failed (e.g. "memory").
    pub backend: String,
    /// Operation that failed (e.g. "get", "set", "incr").
    pub operation: &'static str,
    /// Key being accessed, when the operation is key-addressed.
    pub key: Option<String>,
    /// Underlying cause.
    pub cause: String,
}

impl StorageError {
    pub fn new(backend: impl Into<String>, operation: &'static str, cause: impl fmt::Display) -> Self {
        Self {
            backend: backend.into(),
            operation,
            key: None,
            cause: cause.to_string(),
        }
    }

    /// Attach the key that was being accessed.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Details about a rejected request, carried alongside the decision.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "rate limit exceeded for key {key:?}: {used}/{limit} used, retry after {}ms",
    .retry_after.as_millis()
)]
pub struct LimitExceededError {
    pub key: String,
    pub limit: u64,
    pub used: u64,
    pub window: Duration,
    pub retry_after: Duration,
    pub reset_at: DateTime<Utc>,
}
