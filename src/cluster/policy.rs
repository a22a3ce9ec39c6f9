//! Fallback policies: how a cluster ranks its members and when it retries.
//!
//! Health is advisory. A policy may push a failing member to the back of the ranking
//! but never drops it, so a cluster whose members are all unhealthy still tries them,
//! least-recently-failed first.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::repository::Repository;
use crate::config::{FallbackPolicyConfig, PolicyKind};
use crate::error::DalError;
use crate::models::Command;

/// Pluggable routing strategy, selected per cluster by name.
pub trait FallbackPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Order `members` by current preference. Every member must appear exactly once.
    fn rank(&self, members: &[Arc<Repository>]) -> Vec<Arc<Repository>>;

    /// Outcome of an attempt against `repository`. Health counters are already
    /// updated by the session; this is for policies keeping state of their own.
    fn report(&self, _repository: &Repository, _succeeded: bool) {}

    /// Whether to try the next member after `attempt` (1-based) failed with `error`.
    fn should_retry(&self, command: &Command, error: &DalError, attempt: usize) -> bool {
        default_should_retry(command, error, attempt, None)
    }
}

/// Shared retry rule.
///
/// Conversion failures are deterministic and retrying them elsewhere only repeats
/// the work. Retry-unsafe commands are retried only when the failure happened before
/// the command reached an engine.
pub fn default_should_retry(
    command: &Command,
    error: &DalError,
    attempt: usize,
    max_attempts: Option<usize>,
) -> bool {
    if matches!(error, DalError::ResultConversion { .. }) {
        return false;
    }
    if !command.is_retry_safe() && !error.is_pre_execution() {
        return false;
    }
    max_attempts.is_none_or(|max| attempt < max)
}

/// Healthy members in configured order, then members inside their cooldown window
/// ordered least-recently-failed first.
#[derive(Debug)]
pub struct CooldownPolicy {
    name: String,
    failure_threshold: u64,
    cooldown: Duration,
    max_attempts: Option<usize>,
}

impl CooldownPolicy {
    pub fn new(name: impl Into<String>, failure_threshold: u64, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn cooling_for(&self, repository: &Repository) -> Option<Duration> {
        if repository.consecutive_failures() < self.failure_threshold {
            return None;
        }
        repository
            .since_last_failure()
            .filter(|since| *since < self.cooldown)
    }
}

impl FallbackPolicy for CooldownPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self, members: &[Arc<Repository>]) -> Vec<Arc<Repository>> {
        let mut healthy = Vec::with_capacity(members.len());
        let mut cooling = Vec::new();
        for member in members {
            match self.cooling_for(member) {
                Some(since) => cooling.push((since, Arc::clone(member))),
                None => healthy.push(Arc::clone(member)),
            }
        }
        // Longest time since failure first; stable for ties
        cooling.sort_by(|a, b| b.0.cmp(&a.0));
        healthy.extend(cooling.into_iter().map(|(_, m)| m));
        healthy
    }

    fn should_retry(&self, command: &Command, error: &DalError, attempt: usize) -> bool {
        default_should_retry(command, error, attempt, self.max_attempts)
    }
}

/// Always the configured order, ignoring health.
#[derive(Debug)]
pub struct OrderedPolicy {
    name: String,
    max_attempts: Option<usize>,
}

impl OrderedPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl FallbackPolicy for OrderedPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self, members: &[Arc<Repository>]) -> Vec<Arc<Repository>> {
        members.to_vec()
    }

    fn should_retry(&self, command: &Command, error: &DalError, attempt: usize) -> bool {
        default_should_retry(command, error, attempt, self.max_attempts)
    }
}

/// Rotates the first choice on every ranking to spread load; the remaining members
/// follow in configured order after it.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    name: String,
    next: AtomicUsize,
    max_attempts: Option<usize>,
}

impl RoundRobinPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next: AtomicUsize::new(0),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl FallbackPolicy for RoundRobinPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self, members: &[Arc<Repository>]) -> Vec<Arc<Repository>> {
        if members.is_empty() {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % members.len();
        members[start..]
            .iter()
            .chain(&members[..start])
            .cloned()
            .collect()
    }

    fn should_retry(&self, command: &Command, error: &DalError, attempt: usize) -> bool {
        default_should_retry(command, error, attempt, self.max_attempts)
    }
}

/// Build the policy described by `config`.
pub fn build_policy(config: &FallbackPolicyConfig) -> Arc<dyn FallbackPolicy> {
    match config.kind {
        PolicyKind::Cooldown => Arc::new(
            CooldownPolicy::new(
                &config.name,
                config.failure_threshold,
                config.cooldown_duration(),
            )
            .with_max_attempts(config.max_attempts),
        ),
        PolicyKind::Ordered => {
            Arc::new(OrderedPolicy::new(&config.name).with_max_attempts(config.max_attempts))
        }
        PolicyKind::RoundRobin => {
            Arc::new(RoundRobinPolicy::new(&config.name).with_max_attempts(config.max_attempts))
        }
    }
}
