use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::clock::{Clock, SystemClock};
use ratekeeper::config::RateKeeperConfig;
use ratekeeper::error::StorageError;
use ratekeeper::ratelimit::{CompositeLimiter, DecisionState, KeyStrategy, OpenHook, RateLimiter, RequestContext};
use ratekeeper::scope::Scope;
use ratekeeper::storage::Storage;

#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about = "Rate limiting decision engine")]
struct Cli {
    /// YAML configuration file. Environment overrides use RATEKEEPER__SECTION__FIELD.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "ratekeeper=debug".
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Answer JSON-line requests from stdin with JSON-line decisions on stdout.
    Run {
        /// Per-request deadline in milliseconds.
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
    /// Load and validate the configuration, then exit.
    Validate,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Op {
    #[default]
    Allow,
    State,
    Refund,
    Reset,
}

/// One stdin line.
///
/// `key` addresses the single limiter directly; `context` with `strategy`
/// derives the key; `context` alone goes through the composite limiter.
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    op: Op,
    key: Option<String>,
    context: Option<RequestContext>,
    strategy: Option<KeyStrategy>,
    #[serde(default = "default_cost")]
    cost: u64,
}

fn default_cost() -> u64 {
    1
}

/// One stdout line.
#[derive(Debug, Default, Serialize)]
struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    admitted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u128>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    denied_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Report {
    fn from_state(state: &DecisionState) -> Self {
        Self {
            key: Some(state.key.clone()),
            limit: Some(state.limit),
            remaining: Some(state.remaining),
            reset_at: Some(state.reset_at),
            retry_after_ms: Some(state.retry_after.as_millis()),
            ..Self::default()
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

struct Service {
    limiter: RateLimiter,
    composite: Option<CompositeLimiter>,
}

impl Service {
    async fn handle(&self, scope: &Scope, request: Request) -> ratekeeper::Result<Report> {
        match (&request.key, &request.context, &request.strategy) {
            (Some(key), _, _) => self.handle_key(scope, request.op, key, request.cost).await,
            (None, Some(ctx), Some(strategy)) => {
                let key = ctx
                    .key(strategy)
                    .ok_or_else(|| ratekeeper::RateKeeperError::EmptyKey {
                        strategy: strategy.to_string(),
                    })?;
                if request.op == Op::Allow {
                    let decision = self.limiter.allow_request(scope, ctx, strategy, request.cost).await?;
                    let mut report = Report::from_state(&decision.state);
                    report.admitted = Some(decision.admitted);
                    report.degraded = decision.degraded;
                    return Ok(report);
                }
                self.handle_key(scope, request.op, &key, request.cost).await
            }
            (None, Some(ctx), None) => self.handle_composite(scope, request.op, ctx, request.cost).await,
            (None, None, _) => Ok(Report::failed("request needs a key or a context")),
        }
    }

    async fn handle_key(&self, scope: &Scope, op: Op, key: &str, cost: u64) -> ratekeeper::Result<Report> {
        match op {
            Op::Allow => {
                let decision = self.limiter.allow(scope, key, cost).await?;
                let mut report = Report::from_state(&decision.state);
                report.admitted = Some(decision.admitted);
                report.degraded = decision.degraded;
                Ok(report)
            }
            Op::State => Ok(Report::from_state(&self.limiter.state(scope, key).await?)),
            Op::Refund => {
                self.limiter.refund(scope, key, cost).await?;
                Ok(Report {
                    key: Some(key.to_string()),
                    ..Report::default()
                })
            }
            Op::Reset => {
                self.limiter.reset(scope, key).await?;
                Ok(Report {
                    key: Some(key.to_string()),
                    ..Report::default()
                })
            }
        }
    }

    async fn handle_composite(
        &self,
        scope: &Scope,
        op: Op,
        ctx: &RequestContext,
        cost: u64,
    ) -> ratekeeper::Result<Report> {
        let Some(composite) = &self.composite else {
            return Ok(Report::failed("no composite dimensions configured"));
        };
        match op {
            Op::Allow => {
                let decision = composite.allow(scope, ctx, cost).await?;
                for failure in &decision.refund_failures {
                    warn!(
                        strategy = %failure.strategy,
                        key = %failure.key,
                        error = %failure.error,
                        "Compensating refund failed"
                    );
                }
                let mut report = Report::from_state(&decision.state);
                report.admitted = Some(decision.admitted);
                report.degraded = decision.degraded;
                report.denied_by = decision.denied_by.map(|s| s.to_string());
                Ok(report)
            }
            Op::State => {
                let states = composite.states(scope, ctx).await?;
                let tightest = states
                    .iter()
                    .map(|(_, state)| state)
                    .min_by_key(|state| state.remaining);
                Ok(tightest.map(Report::from_state).unwrap_or_default())
            }
            Op::Reset => {
                composite.reset(scope, ctx).await?;
                Ok(Report::default())
            }
            Op::Refund => Ok(Report::failed("refund needs a key")),
        }
    }

    async fn close(&self) -> ratekeeper::Result<()> {
        if let Some(composite) = &self.composite {
            composite.close().await?;
        }
        self.limiter.close().await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = RateKeeperConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Command::Run { timeout_ms: 1000 }) {
        Command::Validate => {
            info!("Configuration is valid");
            Ok(())
        }
        Command::Run { timeout_ms } => run(config, Duration::from_millis(timeout_ms)).await,
    }
}

fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log filter")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(config: RateKeeperConfig, timeout: Duration) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = config.build_storage(clock.clone());
    let janitor = storage.spawn_janitor();

    let on_fallback: OpenHook = Arc::new(|err: &StorageError| {
        warn!(
            backend = %err.backend,
            operation = err.operation,
            error = %err,
            "Storage unavailable, switching to fallback"
        );
    });
    let breaker = config.build_breaker(clock.clone(), Some(on_fallback))?;
    let limiter = config.build_limiter(storage.clone(), clock.clone(), breaker.clone())?;
    let composite = config.build_composite(storage.clone(), clock.clone(), breaker.clone())?;

    let shutdown = CancellationToken::new();
    let liveness = config.fallback.probe_interval().map(|every| {
        let primary: Arc<dyn Storage> = storage.clone();
        breaker.spawn_liveness_task(primary, every, shutdown.clone())
    });

    info!(
        algorithm = %limiter.kind(),
        dimensions = config.dimensions.len(),
        fallback = %limiter.controller().strategy(),
        "Ratekeeper ready, reading requests from stdin"
    );

    let service = Service { limiter, composite };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        let line = tokio::select! {
            _ = &mut signal => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let scope = Scope::background()
            .with_cancellation(shutdown.child_token())
            .with_timeout(timeout);
        let report = match serde_json::from_str::<Request>(&line) {
            Ok(request) => match service.handle(&scope, request).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Request failed");
                    Report::failed(e)
                }
            },
            Err(e) => Report::failed(format!("malformed request: {e}")),
        };

        let mut out = serde_json::to_vec(&report)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    shutdown.cancel();
    if let Err(e) = service.close().await {
        error!(error = %e, "Error closing limiters");
    }
    if let Some(task) = liveness {
        let _ = task.await;
    }
    let _ = janitor.await;

    info!("Ratekeeper stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
