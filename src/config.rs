//! Configuration management for Ratekeeper.
//!
//! Settings are read from an optional YAML file and overridden by
//! `RATEKEEPER__SECTION__FIELD` environment variables, then validated in
//! full before anything is built.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::error::{InvalidConfigError, RateKeeperError, Result};
use crate::ratelimit::{
    AlgorithmConfig, AlgorithmKind, BreakerConfig, CircuitBreaker, CompositeLimiter, Dimension,
    FallbackController, FallbackStrategy, KeyStrategy, OpenHook, RateLimiter, DEFAULT_MAX_TIMESTAMPS,
};
use crate::storage::{MemoryStorage, MemoryStorageConfig};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Storage namespace of the single-key limiter.
pub const LIMITER_KEY_PREFIX: &str = "limiter:";
/// Storage namespace of the composite dimensions. Dimension keys already
/// carry their strategy name.
pub const COMPOSITE_KEY_PREFIX: &str = "composite:";

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateKeeperConfig {
    /// Limiter used for single-key decisions.
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Composite dimensions, evaluated in order. Empty disables composite mode.
    #[serde(default)]
    pub dimensions: Vec<DimensionSettings>,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub fallback: FallbackSettings,
}

/// Algorithm settings for one limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// One of token_bucket, fixed_window, sliding_window, leaky_bucket.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Units admitted per window.
    #[serde(default = "default_rate")]
    pub rate: u64,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Token bucket capacity; 0 means `rate`.
    #[serde(default)]
    pub burst_size: u64,

    /// Leaky bucket capacity; 0 means 1.
    #[serde(default)]
    pub capacity: u64,

    /// Sliding window entry cap per key.
    #[serde(default = "default_max_timestamps")]
    pub max_timestamps: usize,

    /// Fixed window: align windows to epoch multiples of the window length.
    #[serde(default)]
    pub align_windows: bool,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            rate: default_rate(),
            window_ms: default_window_ms(),
            burst_size: 0,
            capacity: 0,
            max_timestamps: default_max_timestamps(),
            align_windows: false,
        }
    }
}

fn default_algorithm() -> String {
    AlgorithmKind::TokenBucket.as_str().to_string()
}

fn default_rate() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    1000
}

fn default_max_timestamps() -> usize {
    DEFAULT_MAX_TIMESTAMPS
}

impl LimiterSettings {
    /// Parse and validate into an engine configuration.
    pub fn algorithm_config(&self) -> std::result::Result<AlgorithmConfig, InvalidConfigError> {
        let kind: AlgorithmKind = self.algorithm.parse()?;
        let config = AlgorithmConfig::new(kind, self.rate, Duration::from_millis(self.window_ms))
            .with_burst_size(self.burst_size)
            .with_capacity(self.capacity)
            .with_max_timestamps(self.max_timestamps)
            .with_aligned_windows(self.align_windows);
        config.validate()?;
        Ok(config)
    }
}

/// One composite dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSettings {
    /// ip, user, endpoint, session, global, or the name of a custom field.
    pub strategy: KeyStrategy,

    #[serde(default)]
    pub limiter: LimiterSettings,
}

/// Storage backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Maximum tracked keys before eviction.
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Expired-entry sweep interval in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_keys: default_max_keys(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_max_keys() -> usize {
    10_000
}

fn default_cleanup_interval() -> u64 {
    300
}

impl StorageSettings {
    pub fn memory_config(&self) -> MemoryStorageConfig {
        MemoryStorageConfig {
            max_keys: self.max_keys,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }

    fn validate(&self) -> std::result::Result<(), InvalidConfigError> {
        if self.backend != "memory" {
            return Err(InvalidConfigError::new(
                "storage.backend",
                &self.backend,
                "only the memory backend is built in",
            ));
        }
        if self.max_keys == 0 {
            return Err(InvalidConfigError::new("storage.max_keys", 0, "must be positive"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(InvalidConfigError::new(
                "storage.cleanup_interval_secs",
                0,
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker and fallback policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSettings {
    /// One of allow_all, deny_all, local_memory.
    #[serde(default = "default_fallback_strategy")]
    pub strategy: String,

    /// Consecutive storage failures before falling back.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time to wait before probing primary storage again.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Background liveness ping interval. Disabled when unset.
    #[serde(default)]
    pub probe_interval_ms: Option<u64>,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            strategy: default_fallback_strategy(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            probe_interval_ms: None,
        }
    }
}

fn default_fallback_strategy() -> String {
    FallbackStrategy::AllowAll.as_str().to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    5000
}

impl FallbackSettings {
    pub fn fallback_strategy(&self) -> std::result::Result<FallbackStrategy, InvalidConfigError> {
        self.strategy.parse()
    }

    pub fn breaker_config(&self) -> std::result::Result<BreakerConfig, InvalidConfigError> {
        BreakerConfig::new(self.failure_threshold, Duration::from_millis(self.cooldown_ms))
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        self.probe_interval_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> std::result::Result<(), InvalidConfigError> {
        self.fallback_strategy()?;
        self.breaker_config()?;
        if self.probe_interval_ms == Some(0) {
            return Err(InvalidConfigError::new(
                "fallback.probe_interval_ms",
                0,
                "must be positive when set",
            ));
        }
        Ok(())
    }
}

impl RateKeeperConfig {
    /// Load from an optional YAML file plus environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RateKeeperError::ConfigLoad(e.to_string()))?;

        let config: RateKeeperConfig = settings
            .try_deserialize()
            .map_err(|e| RateKeeperError::ConfigLoad(e.to_string()))?;
        config.validate()?;

        info!(
            algorithm = %config.limiter.algorithm,
            dimensions = config.dimensions.len(),
            fallback = %config.fallback.strategy,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse YAML text and validate.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: RateKeeperConfig =
            serde_yaml::from_str(contents).map_err(|e| RateKeeperError::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, failing on the first invalid one.
    pub fn validate(&self) -> std::result::Result<(), InvalidConfigError> {
        self.limiter.algorithm_config()?;

        let mut seen = HashSet::new();
        for dimension in &self.dimensions {
            dimension.limiter.algorithm_config()?;
            if !seen.insert(&dimension.strategy) {
                return Err(InvalidConfigError::new(
                    "dimensions",
                    &dimension.strategy,
                    "strategy configured more than once",
                ));
            }
        }

        self.storage.validate()?;
        self.fallback.validate()
    }

    /// The primary store described by `storage`.
    pub fn build_storage(&self, clock: Arc<dyn Clock>) -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::with_config(self.storage.memory_config(), clock))
    }

    /// The shared breaker for everything built over one store.
    pub fn build_breaker(
        &self,
        clock: Arc<dyn Clock>,
        on_fallback: Option<OpenHook>,
    ) -> std::result::Result<CircuitBreaker, InvalidConfigError> {
        let config = self.fallback.breaker_config()?;
        Ok(match on_fallback {
            Some(hook) => CircuitBreaker::with_open_hook(config, clock, hook),
            None => CircuitBreaker::new(config, clock),
        })
    }

    /// The single-key limiter.
    pub fn build_limiter(
        &self,
        storage: Arc<MemoryStorage>,
        clock: Arc<dyn Clock>,
        breaker: CircuitBreaker,
    ) -> std::result::Result<RateLimiter, InvalidConfigError> {
        RateLimiter::builder(self.limiter.algorithm_config()?.with_key_prefix(LIMITER_KEY_PREFIX))
            .storage(storage)
            .clock(clock)
            .fallback(self.fallback.fallback_strategy()?)
            .breaker(breaker)
            .build()
    }

    /// The composite limiter, or `None` when no dimensions are configured.
    pub fn build_composite(
        &self,
        storage: Arc<MemoryStorage>,
        clock: Arc<dyn Clock>,
        breaker: CircuitBreaker,
    ) -> std::result::Result<Option<CompositeLimiter>, InvalidConfigError> {
        if self.dimensions.is_empty() {
            return Ok(None);
        }
        let strategy = self.fallback.fallback_strategy()?;
        let dimensions = self
            .dimensions
            .iter()
            .map(|d| -> std::result::Result<Dimension, InvalidConfigError> {
                let controller = FallbackController::new(
                    d.limiter.algorithm_config()?.with_key_prefix(COMPOSITE_KEY_PREFIX),
                    storage.clone(),
                    clock.clone(),
                    strategy,
                    breaker.clone(),
                )?;
                Ok(Dimension::new(d.strategy.clone(), controller))
            })
            .collect::<std::result::Result<Vec<_>, InvalidConfigError>>()?;
        CompositeLimiter::new(dimensions).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::{Algorithm, RequestContext};
    use crate::scope::Scope;
    use crate::storage::Storage;

    const FULL: &str = r#"
limiter:
  algorithm: sliding_window
  rate: 50
  window_ms: 60000
  max_timestamps: 500
dimensions:
  - strategy: ip
    limiter:
      algorithm: token_bucket
      rate: 10
      burst_size: 20
  - strategy: tenant
    limiter:
      algorithm: fixed_window
      rate: 2
      window_ms: 10000
storage:
  max_keys: 256
fallback:
  strategy: local_memory
  failure_threshold: 3
  cooldown_ms: 2000
  probe_interval_ms: 1000
"#;

    #[test]
    fn test_defaults() {
        let config = RateKeeperConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limiter.algorithm, "token_bucket");
        assert_eq!(config.limiter.rate, 100);
        assert_eq!(config.storage.max_keys, 10_000);
        assert_eq!(config.storage.cleanup_interval_secs, 300);
        assert_eq!(config.fallback.fallback_strategy().unwrap(), FallbackStrategy::AllowAll);
        assert_eq!(config.fallback.failure_threshold, 5);
        assert!(config.fallback.probe_interval().is_none());
    }

    #[test]
    fn test_full_yaml() {
        let config = RateKeeperConfig::from_yaml(FULL).unwrap();

        let limiter = config.limiter.algorithm_config().unwrap();
        assert_eq!(limiter.kind, AlgorithmKind::SlidingWindow);
        assert_eq!(limiter.window, Duration::from_secs(60));
        assert_eq!(limiter.max_timestamps, 500);

        assert_eq!(config.dimensions.len(), 2);
        assert_eq!(config.dimensions[0].strategy, KeyStrategy::Ip);
        assert_eq!(config.dimensions[0].limiter.algorithm_config().unwrap().effective_burst(), 20);
        assert_eq!(config.dimensions[1].strategy, KeyStrategy::Custom("tenant".into()));

        assert_eq!(config.storage.memory_config().max_keys, 256);
        assert_eq!(config.fallback.fallback_strategy().unwrap(), FallbackStrategy::LocalMemory);
        assert_eq!(config.fallback.probe_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_invalid_fields_are_named() {
        let cases = [
            ("limiter: {algorithm: gcra}", "algorithm"),
            ("limiter: {rate: 0}", "rate"),
            ("limiter: {window_ms: 0}", "window"),
            ("fallback: {strategy: retry}", "fallback_strategy"),
            ("fallback: {failure_threshold: 0}", "failure_threshold"),
            ("storage: {backend: redis}", "storage.backend"),
            (
                "dimensions: [{strategy: ip}, {strategy: ip}]",
                "dimensions",
            ),
        ];
        for (yaml, field) in cases {
            match RateKeeperConfig::from_yaml(yaml) {
                Err(RateKeeperError::InvalidConfig(err)) => assert_eq!(err.field, field, "{yaml}"),
                other => panic!("expected invalid {field} for {yaml}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_malformed_yaml_is_a_load_error() {
        let err = RateKeeperConfig::from_yaml("limiter: [").unwrap_err();
        assert!(matches!(err, RateKeeperError::ConfigLoad(_)));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("ratekeeper-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  algorithm: fixed_window\n  rate: 7\n").unwrap();
        std::env::set_var("RATEKEEPER__LIMITER__RATE", "9");

        let loaded = RateKeeperConfig::load(Some(&path));
        std::env::remove_var("RATEKEEPER__LIMITER__RATE");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.limiter.algorithm, "fixed_window");
        assert_eq!(config.limiter.rate, 9);
        assert_eq!(config.limiter.window_ms, 1000);
    }

    #[tokio::test]
    async fn test_build_composite_shares_breaker() {
        let config = RateKeeperConfig::from_yaml(FULL).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let storage = config.build_storage(clock.clone());
        let breaker = config.build_breaker(clock.clone(), None).unwrap();

        let limiter = config
            .build_limiter(storage.clone(), clock.clone(), breaker.clone())
            .unwrap();
        assert_eq!(limiter.kind(), AlgorithmKind::SlidingWindow);

        let composite = config
            .build_composite(storage, clock, breaker)
            .unwrap()
            .unwrap();
        assert_eq!(composite.dimensions().len(), 2);
        assert_eq!(composite.dimensions()[1].limiter().limit(), 2);

        let ctx = RequestContext::new().with_ip("1.2.3.4").with_custom("tenant", "acme");
        let scope = Scope::background();
        assert!(composite.allow(&scope, &ctx, 1).await.unwrap().admitted);
        assert!(composite.allow(&scope, &ctx, 1).await.unwrap().admitted);
        let denied = composite.allow(&scope, &ctx, 1).await.unwrap();
        assert_eq!(denied.denied_by, Some(KeyStrategy::Custom("tenant".into())));
    }

    #[tokio::test]
    async fn test_limiter_and_composite_keep_separate_state() {
        let yaml = r#"
limiter:
  algorithm: token_bucket
  rate: 10
dimensions:
  - strategy: ip
    limiter:
      algorithm: sliding_window
      rate: 5
"#;
        let config = RateKeeperConfig::from_yaml(yaml).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let storage = config.build_storage(clock.clone());
        let breaker = config.build_breaker(clock.clone(), None).unwrap();
        let limiter = config
            .build_limiter(storage.clone(), clock.clone(), breaker.clone())
            .unwrap();
        let composite = config
            .build_composite(storage.clone(), clock, breaker)
            .unwrap()
            .unwrap();

        let ctx = RequestContext::new().with_ip("1.2.3.4");
        let scope = Scope::background();
        assert!(composite.allow(&scope, &ctx, 1).await.unwrap().admitted);

        let decision = limiter.allow_request(&scope, &ctx, &KeyStrategy::Ip, 1).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.state.key, "ip:1.2.3.4");
        assert_eq!(decision.state.remaining, 9);

        let composite_state = composite.states(&scope, &ctx).await.unwrap();
        assert_eq!(composite_state[0].1.current, 1);

        let keys = storage.keys("*").await.unwrap();
        assert_eq!(keys, vec!["composite:ip:1.2.3.4", "limiter:ip:1.2.3.4"]);
    }

    #[test]
    fn test_no_dimensions_builds_no_composite() {
        let config = RateKeeperConfig::default();
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let storage = config.build_storage(clock.clone());
        let breaker = config.build_breaker(clock.clone(), None).unwrap();
        assert!(config.build_composite(storage, clock, breaker).unwrap().is_none());
    }
}
