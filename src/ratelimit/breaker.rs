//! Circuit breaker guarding primary storage.
//!
//! ```text
//! Closed --N consecutive storage failures--> Open
//! Open   --cooldown elapsed, next call------> HalfOpen (one probe in flight)
//! HalfOpen --probe succeeds--> Closed
//! HalfOpen --probe fails-----> Open
//! ```
//!
//! All transitions happen under one mutex, so a flood of simultaneous
//! failures trips the breaker exactly once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::error::{InvalidConfigError, RateKeeperError, Result, StorageError};
use crate::scope::Scope;
use crate::storage::Storage;

/// Default consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default time the breaker stays open before probing primary storage.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Called once per transition into `Open`, with the error that caused it.
pub type OpenHook = Arc<dyn Fn(&StorageError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Primary storage is healthy.
    Closed,
    /// Primary storage is considered down; calls use the fallback policy.
    Open,
    /// One probe call is testing primary storage.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Validated breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    failure_threshold: u32,
    cooldown: Duration,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> std::result::Result<Self, InvalidConfigError> {
        if failure_threshold == 0 {
            return Err(InvalidConfigError::new(
                "failure_threshold",
                failure_threshold,
                "must be at least 1",
            ));
        }
        if cooldown.is_zero() {
            return Err(InvalidConfigError::new(
                "cooldown",
                format!("{cooldown:?}"),
                "must be positive",
            ));
        }
        Ok(Self {
            failure_threshold,
            cooldown,
        })
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

struct Shared {
    inner: Mutex<Inner>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    on_open: Option<OpenHook>,
}

/// Where a call should be served from.
#[derive(Debug)]
pub enum Route {
    /// Use primary storage. `probe` is set when this call is the half-open probe.
    Primary { probe: Option<ProbeGuard> },
    /// Use the fallback policy.
    Fallback,
}

/// Shared circuit breaker. Clones observe and drive the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("inner", &*self.shared.inner.lock())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, None)
    }

    /// Like [`new`](Self::new), firing `on_open` whenever the breaker opens.
    pub fn with_open_hook(config: BreakerConfig, clock: Arc<dyn Clock>, on_open: OpenHook) -> Self {
        Self::build(config, clock, Some(on_open))
    }

    fn build(config: BreakerConfig, clock: Arc<dyn Clock>, on_open: Option<OpenHook>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    opened_at: None,
                }),
                config,
                clock,
                on_open,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.shared.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.inner.lock().consecutive_failures
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.shared.config
    }

    /// Decide where the next call goes.
    ///
    /// Once the cooldown has elapsed, the first caller becomes the probe and
    /// moves the breaker to `HalfOpen`. Everyone else keeps using the fallback
    /// until the probe resolves.
    pub fn route(&self) -> Route {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            CircuitState::Closed => Route::Primary { probe: None },
            CircuitState::HalfOpen => Route::Fallback,
            CircuitState::Open => {
                if self.cooldown_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker half-open, probing primary storage");
                    Route::Primary {
                        probe: Some(ProbeGuard::new(self.shared.clone())),
                    }
                } else {
                    Route::Fallback
                }
            }
        }
    }

    fn cooldown_elapsed(&self, inner: &Inner) -> bool {
        match inner.opened_at {
            Some(at) => clock::elapsed(self.shared.clock.now(), at) >= self.shared.config.cooldown,
            None => true,
        }
    }

    /// Record a successful primary call. A successful probe closes the breaker.
    pub fn record_success(&self, probe: Option<ProbeGuard>) {
        let mut inner = self.shared.inner.lock();
        inner.consecutive_failures = 0;
        if let Some(mut probe) = probe {
            probe.disarm();
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                info!("Circuit breaker closed, primary storage recovered");
            }
        }
    }

    /// Record a failed primary call and return the resulting state.
    ///
    /// The caller should mask the error with the fallback policy unless the
    /// breaker is still `Closed`.
    pub fn record_failure(&self, error: &StorageError, probe: Option<ProbeGuard>) -> CircuitState {
        let mut inner = self.shared.inner.lock();
        let opened = match probe {
            Some(mut probe) => {
                probe.disarm();
                warn!(error = %error, "Circuit breaker probe failed, reopening");
                self.open(&mut inner)
            }
            None if inner.state == CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.shared.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        error = %error,
                        "Circuit breaker opened"
                    );
                    self.open(&mut inner)
                } else {
                    debug!(
                        failures = inner.consecutive_failures,
                        threshold = self.shared.config.failure_threshold,
                        "Primary storage call failed"
                    );
                    false
                }
            }
            // Late failure from a call routed before the breaker opened.
            None => false,
        };
        let state = inner.state;
        drop(inner);

        if opened {
            self.fire_open_hook(error);
        }
        state
    }

    /// Force the breaker open. Returns false if it was already open.
    pub fn trip(&self, error: &StorageError) -> bool {
        let opened = {
            let mut inner = self.shared.inner.lock();
            if inner.state == CircuitState::Open {
                false
            } else {
                warn!(error = %error, "Circuit breaker tripped");
                self.open(&mut inner)
            }
        };
        if opened {
            self.fire_open_hook(error);
        }
        opened
    }

    fn open(&self, inner: &mut Inner) -> bool {
        inner.opened_at = Some(self.shared.clock.now());
        let was_open = inner.state == CircuitState::Open;
        inner.state = CircuitState::Open;
        !was_open
    }

    fn fire_open_hook(&self, error: &StorageError) {
        if let Some(hook) = &self.shared.on_open {
            hook(error);
        }
    }

    /// Ping `storage` and update the breaker with the outcome.
    ///
    /// A failed ping while closed opens the breaker immediately. While open,
    /// the ping only runs once the cooldown has elapsed and it acts as the
    /// half-open probe. Returns the state after the check.
    pub async fn check_liveness(&self, scope: &Scope, storage: &dyn Storage) -> Result<CircuitState> {
        let probe = match self.route() {
            Route::Fallback => return Ok(self.state()),
            Route::Primary { probe } => probe,
        };

        match scope.run(storage.ping()).await {
            Ok(()) => {
                self.record_success(probe);
            }
            Err(RateKeeperError::Storage(err)) => {
                if probe.is_some() {
                    self.record_failure(&err, probe);
                } else {
                    self.trip(&err);
                }
            }
            Err(other) => return Err(other),
        }
        Ok(self.state())
    }

    /// Run [`check_liveness`](Self::check_liveness) every `interval` until
    /// `shutdown` is cancelled.
    pub fn spawn_liveness_task(
        &self,
        storage: Arc<dyn Storage>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let breaker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let scope = Scope::background().with_cancellation(shutdown.clone());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = breaker.check_liveness(&scope, storage.as_ref()).await {
                            debug!(error = %e, "Liveness check interrupted");
                        }
                    }
                }
            }
            debug!("Liveness task stopped");
        })
    }
}

/// Marks the single in-flight half-open probe.
///
/// Dropping an unresolved probe (for example when its caller is cancelled)
/// returns the breaker to `Open` without restarting the cooldown, so the next
/// call probes again.
pub struct ProbeGuard {
    shared: Arc<Shared>,
    armed: bool,
}

impl ProbeGuard {
    fn new(shared: Arc<Shared>) -> Self {
        Self { shared, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl fmt::Debug for ProbeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeGuard").field("armed", &self.armed).finish()
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.shared.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            debug!("Circuit breaker probe abandoned");
        }
    }
}
