//! One addressable physical database plus its rolling health state.
//!
//! Health is mutated only by the execution path ([`Repository::record_success`] and
//! [`Repository::record_failure`]) and read by fallback policies. All counters are
//! atomics so concurrent sessions against the same repository never lose updates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::RepositoryConfig;
use crate::db::provider::{ConnectionProvider, ProviderRegistry, ProviderSettings};
use crate::error::DalResult;

/// Weight of the newest sample in the smoothed latency, in percent.
const LATENCY_SMOOTHING_PCT: u64 = 20;

pub struct Repository {
    name: String,
    engine: String,
    enabled: bool,
    sequence: i32,
    provider: Arc<dyn ConnectionProvider>,
    epoch: Instant,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    consecutive_successes: AtomicU64,
    consecutive_failures: AtomicU64,
    last_latency_us: AtomicU64,
    avg_latency_us: AtomicU64,
    /// Microseconds after `epoch` plus one; zero means never failed
    last_failure_us: AtomicU64,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("enabled", &self.enabled)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a repository's health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryHealth {
    pub name: String,
    pub engine: String,
    pub enabled: bool,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_successes: u64,
    pub consecutive_failures: u64,
    pub last_latency: Option<Duration>,
    pub average_latency: Option<Duration>,
    pub since_last_failure: Option<Duration>,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        engine: impl Into<String>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            engine: engine.into(),
            enabled: true,
            sequence: 0,
            provider,
            epoch: Instant::now(),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            consecutive_successes: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_latency_us: AtomicU64::new(0),
            avg_latency_us: AtomicU64::new(0),
            last_failure_us: AtomicU64::new(0),
        }
    }

    /// Build a repository from configuration, creating its provider through the
    /// registry. No connection is opened here.
    pub fn from_config(config: &RepositoryConfig, registry: &ProviderRegistry) -> DalResult<Self> {
        let engine = config.engine_name()?;
        let provider = registry.create(
            &engine,
            ProviderSettings {
                repository: config.name.clone(),
                connection_string: config.connection_string.clone(),
                schema: config.schema.clone(),
                pool: config.pool.clone(),
            },
        )?;
        Ok(Self::new(config.name.clone(), engine, provider)
            .with_enabled(config.enabled)
            .with_sequence(config.sequence))
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine key, e.g. `postgres`.
    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Record a successful operation and the time it took from physical open.
    pub fn record_success(&self, elapsed: Duration) {
        self.total_successes.fetch_add(1, Ordering::AcqRel);
        self.consecutive_successes.fetch_add(1, Ordering::AcqRel);
        self.consecutive_failures.store(0, Ordering::Release);

        let sample = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX).max(1);
        self.last_latency_us.store(sample, Ordering::Release);
        let _ = self
            .avg_latency_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avg| {
                if avg == 0 {
                    Some(sample)
                } else {
                    Some(
                        (avg.saturating_mul(100 - LATENCY_SMOOTHING_PCT)
                            + sample.saturating_mul(LATENCY_SMOOTHING_PCT))
                            / 100,
                    )
                }
            });
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::AcqRel);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        self.consecutive_successes.store(0, Ordering::Release);
        let now = u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX - 1);
        self.last_failure_us.store(now + 1, Ordering::Release);
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes.load(Ordering::Acquire)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Time since the most recent failure, `None` if it never failed.
    pub fn since_last_failure(&self) -> Option<Duration> {
        match self.last_failure_us.load(Ordering::Acquire) {
            0 => None,
            at => {
                let failed_at = self.epoch + Duration::from_micros(at - 1);
                Some(Instant::now().saturating_duration_since(failed_at))
            }
        }
    }

    pub fn health(&self) -> RepositoryHealth {
        let micros = |v: u64| (v > 0).then(|| Duration::from_micros(v));
        RepositoryHealth {
            name: self.name.clone(),
            engine: self.engine.clone(),
            enabled: self.enabled,
            total_successes: self.total_successes(),
            total_failures: self.total_failures(),
            consecutive_successes: self.consecutive_successes.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures(),
            last_latency: micros(self.last_latency_us.load(Ordering::Acquire)),
            average_latency: micros(self.avg_latency_us.load(Ordering::Acquire)),
            since_last_failure: self.since_last_failure(),
        }
    }
}
