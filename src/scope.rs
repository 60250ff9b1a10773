//! Cancellation and deadline propagation.
//!
//! Every public operation takes a [`Scope`]. Each storage call an engine makes
//! runs through [`Scope::run`], so a cancelled or expired scope aborts at the
//! next storage boundary and leaves persisted state as of the last committed
//! write.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RateKeeperError, Result};

/// Cancellation token plus optional deadline for one logical operation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Scope {
    /// A scope that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Set the deadline `timeout` from now (keeps an earlier existing deadline).
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Set an absolute deadline (keeps an earlier existing deadline).
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the scope is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(RateKeeperError::Cancelled);
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(RateKeeperError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the scope is cancelled or expires first.
    ///
    /// Cancellation wins ties, so a cancelled scope never starts new work.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<RateKeeperError>,
    {
        self.check()?;

        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(RateKeeperError::Cancelled),
            _ = expired => Err(RateKeeperError::DeadlineExceeded),
            res = fut => res.map_err(Into::into),
        }
    }
}
